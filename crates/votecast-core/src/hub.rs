// Notification hub: the registry of connected observers and best-effort
// fan-out of result snapshots to them.
//
// The registry is a plain map behind a std mutex, touched only for short
// insert/remove/snapshot critical sections. Socket writes happen outside it.
// Each observer's sink lives in its own slot (`Option` behind an async mutex)
// and is taken out exactly once, by whichever of eviction or unsubscribe gets
// there first, so a sink is never closed twice.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::error::DeliveryError;

// ---------------------------------------------------------------------------
// Observer types
// ---------------------------------------------------------------------------

/// Outbound half of a subscriber connection. The hub takes ownership on
/// subscribe and is the only writer until the observer is removed.
#[async_trait]
pub trait ObserverSink: Send {
    /// Deliver one payload.
    async fn send(&mut self, payload: &[u8]) -> Result<(), DeliveryError>;

    /// Release the underlying channel. Called at most once per sink.
    async fn close(&mut self);
}

/// Opaque handle identifying a subscribed observer. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs-{}", self.0)
    }
}

struct ObserverSlot {
    sink: tokio::sync::Mutex<Option<Box<dyn ObserverSink>>>,
}

// ---------------------------------------------------------------------------
// NotificationHub
// ---------------------------------------------------------------------------

pub struct NotificationHub {
    observers: Mutex<HashMap<ObserverId, Arc<ObserverSlot>>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl NotificationHub {
    /// Create an empty hub. Each per-observer write (and close) is bounded by
    /// `write_timeout`.
    pub fn new(write_timeout: Duration) -> Self {
        NotificationHub {
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            write_timeout,
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<ObserverId, Arc<ObserverSlot>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `sink` and return its handle. Never waits on in-flight
    /// broadcasts.
    pub fn subscribe<S>(&self, sink: S) -> ObserverId
    where
        S: ObserverSink + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(ObserverSlot {
            sink: tokio::sync::Mutex::new(Some(Box::new(sink))),
        });
        let count = {
            let mut observers = self.registry();
            observers.insert(id, slot);
            observers.len()
        };
        info!(observer = %id, observers = count, "observer subscribed");
        id
    }

    /// Remove `id` and close its channel. A no-op if the observer is already
    /// gone (unsubscribed or evicted).
    pub async fn unsubscribe(&self, id: ObserverId) {
        let Some(slot) = self.registry().remove(&id) else {
            debug!(observer = %id, "unsubscribe of unknown observer ignored");
            return;
        };
        let taken = slot.sink.lock().await.take();
        if let Some(sink) = taken {
            self.close_sink(id, sink).await;
            info!(observer = %id, "observer unsubscribed");
        }
    }

    /// Deliver `payload` to every observer registered when the call begins.
    ///
    /// Writes run concurrently, each bounded by the write timeout. An
    /// observer whose write fails is unregistered and closed before this
    /// returns; failures never propagate to the caller. Returns the number of
    /// observers that received the payload.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        let targets: Vec<(ObserverId, Arc<ObserverSlot>)> = self
            .registry()
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        if targets.is_empty() {
            debug!("broadcast skipped, no observers");
            return 0;
        }

        let outcomes = join_all(
            targets
                .iter()
                .map(|(id, slot)| self.deliver(*id, slot, payload)),
        )
        .await;

        let delivered = outcomes.into_iter().filter(|ok| *ok).count();
        debug!(
            targets = targets.len(),
            delivered,
            bytes = payload.len(),
            "broadcast complete"
        );
        delivered
    }

    /// Deliver `payload` to a single observer, with the same eviction policy
    /// as [`broadcast`](Self::broadcast). Returns `false` if the observer is
    /// unknown or the write failed.
    pub async fn send_to(&self, id: ObserverId, payload: &[u8]) -> bool {
        let slot = self.registry().get(&id).cloned();
        match slot {
            Some(slot) => self.deliver(id, &slot, payload).await,
            None => false,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.registry().len()
    }

    pub fn is_subscribed(&self, id: ObserverId) -> bool {
        self.registry().contains_key(&id)
    }

    /// Unregister and close every observer. Used on shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<(ObserverId, Arc<ObserverSlot>)> = self.registry().drain().collect();
        let count = drained.len();
        join_all(drained.into_iter().map(|(id, slot)| async move {
            let taken = slot.sink.lock().await.take();
            if let Some(sink) = taken {
                self.close_sink(id, sink).await;
            }
        }))
        .await;
        info!(observers = count, "all observers closed");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// One delivery attempt. On failure the observer is removed from the
    /// registry and its sink taken and closed while the slot lock is held,
    /// so every exit path leaves the observer either healthy or fully gone.
    async fn deliver(&self, id: ObserverId, slot: &ObserverSlot, payload: &[u8]) -> bool {
        let mut guard = slot.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            // Closed by a concurrent unsubscribe or eviction.
            return false;
        };

        let result = match tokio::time::timeout(self.write_timeout, sink.send(payload)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                self.registry().remove(&id);
                if let Some(sink) = guard.take() {
                    self.close_sink(id, sink).await;
                }
                warn!(observer = %id, error = %e, "observer delivery failed, evicted");
                false
            }
        }
    }

    async fn close_sink(&self, id: ObserverId, mut sink: Box<dyn ObserverSink>) {
        if tokio::time::timeout(self.write_timeout, sink.close())
            .await
            .is_err()
        {
            warn!(observer = %id, "observer close timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Test sink that records everything it is given.
    #[derive(Clone, Default)]
    struct Recorder {
        received: Arc<Mutex<Vec<Vec<u8>>>>,
        sends: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        mode: Mode,
    }

    #[derive(Clone, Copy, Default)]
    enum Mode {
        #[default]
        Healthy,
        Broken,
        Stalled,
        SlowBroken,
    }

    impl Recorder {
        fn with_mode(mode: Mode) -> Self {
            Recorder {
                mode,
                ..Recorder::default()
            }
        }

        fn received(&self) -> Vec<Vec<u8>> {
            self.received.lock().unwrap().clone()
        }

        fn sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ObserverSink for Recorder {
        async fn send(&mut self, payload: &[u8]) -> Result<(), DeliveryError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Healthy => {
                    self.received.lock().unwrap().push(payload.to_vec());
                    Ok(())
                }
                Mode::Broken => Err(DeliveryError::Closed),
                Mode::Stalled => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                Mode::SlowBroken => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(DeliveryError::Transport("reset by peer".into()))
                }
            }
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn hub() -> NotificationHub {
        NotificationHub::new(Duration::from_millis(200))
    }

    #[test]
    fn subscribe_assigns_distinct_ids() {
        let hub = hub();
        let a = hub.subscribe(Recorder::default());
        let b = hub.subscribe(Recorder::default());
        assert_ne!(a, b);
        assert_eq!(hub.observer_count(), 2);
        assert!(hub.is_subscribed(a) && hub.is_subscribed(b));
    }

    #[tokio::test]
    async fn broadcast_delivers_exact_payload_to_all() {
        let hub = hub();
        let observers: Vec<Recorder> = (0..3).map(|_| Recorder::default()).collect();
        for o in &observers {
            hub.subscribe(o.clone());
        }

        let delivered = hub.broadcast(b"{\"sessions\":[]}").await;

        assert_eq!(delivered, 3);
        for o in &observers {
            assert_eq!(o.received(), vec![b"{\"sessions\":[]}".to_vec()]);
        }
    }

    #[tokio::test]
    async fn broadcast_without_observers_is_noop() {
        let hub = hub();
        assert_eq!(hub.broadcast(b"hello").await, 0);
    }

    #[tokio::test]
    async fn broken_observer_is_evicted_and_skipped_afterwards() {
        let hub = hub();
        let healthy = Recorder::default();
        let broken = Recorder::with_mode(Mode::Broken);
        hub.subscribe(healthy.clone());
        let broken_id = hub.subscribe(broken.clone());

        assert_eq!(hub.broadcast(b"one").await, 1);
        assert!(!hub.is_subscribed(broken_id));
        assert_eq!(hub.observer_count(), 1);
        assert_eq!(broken.closes(), 1);

        assert_eq!(hub.broadcast(b"two").await, 1);
        assert_eq!(broken.sends(), 1);
        assert_eq!(healthy.received(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_observer_times_out_without_blocking_others() {
        let hub = hub();
        let healthy = Recorder::default();
        let stalled = Recorder::with_mode(Mode::Stalled);
        hub.subscribe(healthy.clone());
        let stalled_id = hub.subscribe(stalled.clone());

        assert_eq!(hub.broadcast(b"payload").await, 1);

        assert_eq!(healthy.received(), vec![b"payload".to_vec()]);
        assert!(!hub.is_subscribed(stalled_id));
        assert_eq!(stalled.closes(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let hub = hub();
        let observer = Recorder::default();
        let id = hub.subscribe(observer.clone());

        hub.unsubscribe(id).await;
        hub.unsubscribe(id).await;

        assert_eq!(hub.observer_count(), 0);
        assert_eq!(observer.closes(), 1);
        assert_eq!(hub.broadcast(b"x").await, 0);
        assert_eq!(observer.sends(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_after_eviction_does_not_close_twice() {
        let hub = hub();
        let broken = Recorder::with_mode(Mode::Broken);
        let id = hub.subscribe(broken.clone());

        hub.broadcast(b"x").await;
        hub.unsubscribe(id).await;

        assert_eq!(broken.closes(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsubscribe_racing_failed_delivery_closes_once() {
        let hub = Arc::new(hub());
        let slow = Recorder::with_mode(Mode::SlowBroken);
        let id = hub.subscribe(slow.clone());

        let broadcaster = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.broadcast(b"x").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        hub.unsubscribe(id).await;

        assert_eq!(broadcaster.await.unwrap(), 0);
        assert_eq!(slow.closes(), 1);
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn send_to_targets_one_observer() {
        let hub = hub();
        let a = Recorder::default();
        let b = Recorder::default();
        let a_id = hub.subscribe(a.clone());
        hub.subscribe(b.clone());

        assert!(hub.send_to(a_id, b"reply").await);
        assert_eq!(a.received(), vec![b"reply".to_vec()]);
        assert!(b.received().is_empty());
    }

    #[tokio::test]
    async fn send_to_unknown_or_broken_observer_returns_false() {
        let hub = hub();
        let broken = Recorder::with_mode(Mode::Broken);
        let id = hub.subscribe(broken.clone());

        assert!(!hub.send_to(id, b"reply").await);
        assert!(!hub.is_subscribed(id));
        assert!(!hub.send_to(id, b"reply").await);
        assert_eq!(broken.sends(), 1);
    }

    #[tokio::test]
    async fn close_all_closes_every_observer() {
        let hub = hub();
        let observers: Vec<Recorder> = (0..4).map(|_| Recorder::default()).collect();
        for o in &observers {
            hub.subscribe(o.clone());
        }

        hub.close_all().await;

        assert_eq!(hub.observer_count(), 0);
        assert!(observers.iter().all(|o| o.closes() == 1));
    }
}
