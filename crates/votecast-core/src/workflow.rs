// Vote workflow: the async entry point for casting one vote.
//
// The transactional protocol itself lives in `SessionStore::record_vote`;
// this layer moves it onto the blocking pool and ties it to the caller's
// cancellation signal.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::VoteError;
use crate::store::SessionStore;

#[derive(Clone)]
pub struct VoteWorkflow {
    store: Arc<SessionStore>,
}

impl VoteWorkflow {
    pub fn new(store: Arc<SessionStore>) -> Self {
        VoteWorkflow { store }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Validate and atomically record a vote of `user_id` for `option_id`.
    ///
    /// Cancelling `cancel` (or dropping the returned future) before the
    /// transaction commits rolls it back and yields [`VoteError::Cancelled`].
    /// Once committed the vote stands regardless of later cancellation; this
    /// future always waits for the transaction to settle, so the result
    /// reflects what is actually stored.
    pub async fn cast_vote(
        &self,
        cancel: &CancellationToken,
        option_id: Uuid,
        user_id: Uuid,
    ) -> Result<Uuid, VoteError> {
        let token = cancel.child_token();
        // Fires if this future is dropped mid-flight.
        let guard = token.clone().drop_guard();

        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || {
            store.record_vote(option_id, user_id, Utc::now(), &token)
        })
        .await
        .map_err(|e| VoteError::StorageUnavailable(format!("vote task failed: {e}")))
        .and_then(|r| r);

        guard.disarm();

        match &result {
            Ok(vote_id) => info!(%vote_id, %option_id, %user_id, "vote recorded"),
            Err(VoteError::StorageUnavailable(reason)) => {
                warn!(%option_id, %user_id, %reason, "vote failed, storage unavailable")
            }
            Err(e) => info!(%option_id, %user_id, reason = %e, "vote rejected"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::model::{NewSession, Page};
    use chrono::Duration;

    fn setup(ends_in: Duration) -> (tempfile::TempDir, VoteWorkflow, Uuid, Vec<Uuid>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.db");
        let store = Arc::new(
            SessionStore::open(&DatabaseConfig::with_path(path.to_string_lossy())).unwrap(),
        );
        let now = Utc::now();
        let session = store
            .create_session(&NewSession {
                name: "S".into(),
                description: String::new(),
                started_at: now - Duration::days(2),
                ended_at: now + ends_in,
                options: vec!["A".into(), "B".into()],
            })
            .unwrap();
        let options = store.list_results(Page::default()).unwrap().sessions[0]
            .options
            .iter()
            .map(|o| o.id)
            .collect();
        (dir, VoteWorkflow::new(store), session, options)
    }

    #[tokio::test]
    async fn cast_vote_then_duplicate() {
        let (_dir, workflow, session, options) = setup(Duration::days(1));
        let user = Uuid::new_v4();
        let cancel = CancellationToken::new();

        workflow.cast_vote(&cancel, options[0], user).await.unwrap();
        assert_eq!(
            workflow.cast_vote(&cancel, options[1], user).await,
            Err(VoteError::DuplicateVote)
        );

        let snapshot = workflow.store().list_results(Page::default()).unwrap();
        let s = snapshot.session(session).unwrap();
        assert_eq!(s.votes_for("A"), Some(1));
        assert_eq!(s.votes_for("B"), Some(0));
    }

    #[tokio::test]
    async fn closed_session_is_rejected() {
        let (_dir, workflow, session, options) = setup(-Duration::hours(1));
        let cancel = CancellationToken::new();

        assert_eq!(
            workflow.cast_vote(&cancel, options[0], Uuid::new_v4()).await,
            Err(VoteError::SessionClosed)
        );
        let snapshot = workflow.store().list_results(Page::default()).unwrap();
        assert_eq!(snapshot.session(session).unwrap().total_votes(), 0);
    }

    #[tokio::test]
    async fn pre_cancelled_request_records_nothing() {
        let (_dir, workflow, session, options) = setup(Duration::days(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(
            workflow.cast_vote(&cancel, options[0], Uuid::new_v4()).await,
            Err(VoteError::Cancelled)
        );
        let snapshot = workflow.store().list_results(Page::default()).unwrap();
        assert_eq!(snapshot.session(session).unwrap().total_votes(), 0);
    }

    #[tokio::test]
    async fn cancellation_after_commit_keeps_vote() {
        let (_dir, workflow, session, options) = setup(Duration::days(1));
        let cancel = CancellationToken::new();

        workflow
            .cast_vote(&cancel, options[0], Uuid::new_v4())
            .await
            .unwrap();
        cancel.cancel();

        let snapshot = workflow.store().list_results(Page::default()).unwrap();
        assert_eq!(snapshot.session(session).unwrap().total_votes(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_casts_for_same_user_admit_one() {
        let (_dir, workflow, session, options) = setup(Duration::days(1));
        let user = Uuid::new_v4();

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let workflow = workflow.clone();
                let option = options[i % options.len()];
                tokio::spawn(async move {
                    workflow
                        .cast_vote(&CancellationToken::new(), option, user)
                        .await
                })
            })
            .collect();

        let mut ok = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_eq!(e, VoteError::DuplicateVote),
            }
        }
        assert_eq!(ok, 1);

        let snapshot = workflow.store().list_results(Page::default()).unwrap();
        assert_eq!(snapshot.session(session).unwrap().total_votes(), 1);
    }
}
