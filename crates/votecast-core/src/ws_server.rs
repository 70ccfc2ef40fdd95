// WebSocket server: every connection is both an observer of result
// broadcasts and a source of requests.
//
// On connect the write half is handed to the hub, which from then on owns all
// writes to that socket (broadcasts and request replies alike). The read half
// stays with the connection task, which feeds text frames to the service.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DeliveryError;
use crate::hub::{NotificationHub, ObserverId, ObserverSink};
use crate::service::VotingService;

// ---------------------------------------------------------------------------
// Observer sink over a websocket write half
// ---------------------------------------------------------------------------

pub struct WsObserver<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WsObserver<S> {
    pub fn new(sink: SplitSink<WebSocketStream<S>, Message>) -> Self {
        WsObserver { sink }
    }
}

#[async_trait]
impl<S> ObserverSink for WsObserver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, payload: &[u8]) -> Result<(), DeliveryError> {
        let message = match std::str::from_utf8(payload) {
            Ok(text) => Message::text(text.to_owned()),
            Err(_) => Message::binary(payload.to_vec()),
        };
        self.sink.send(message).await.map_err(|e| match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => DeliveryError::Closed,
            other => DeliveryError::Transport(other.to_string()),
        })
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("websocket close failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// Accept connections on `listener` until `shutdown` fires. Each connection
/// gets its own task; a failed handshake only drops that connection.
pub async fn run(
    listener: TcpListener,
    hub: Arc<NotificationHub>,
    service: Arc<VotingService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!("WebSocket server listening on {local_addr}");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("WebSocket server shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("failed to accept TCP connection: {e}");
                        continue;
                    }
                };
                let hub = Arc::clone(&hub);
                let service = Arc::clone(&service);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_connection(stream, addr, hub, service, shutdown).await;
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<NotificationHub>,
    service: Arc<VotingService>,
    shutdown: CancellationToken,
) {
    let addr = addr.to_string();
    info!("Accepted TCP connection from {addr}");

    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {addr}: {e}");
            return;
        }
    };

    let (write, read) = ws_stream.split();
    let id = hub.subscribe(WsObserver::new(write));
    info!(observer = %id, "client {addr} connected");

    tokio::select! {
        _ = process_requests(read, id, &hub, &service, &addr) => {}
        _ = shutdown.cancelled() => {}
    }

    hub.unsubscribe(id).await;
    info!(observer = %id, "client {addr} disconnected");
}

/// Handle request frames from `stream`, replying to observer `id` through
/// the hub. Stops on a close frame, a read error, or once the observer can
/// no longer be written to. Returns `Err(())` in the last case.
///
/// Generic over the stream type so it can be driven by in-memory streams.
pub async fn process_requests<St>(
    mut stream: St,
    id: ObserverId,
    hub: &NotificationHub,
    service: &VotingService,
    addr: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let reply = service.handle_text(text.as_str()).await;
                let payload = match reply.to_json() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("failed to serialize reply for {addr}: {e}");
                        continue;
                    }
                };
                if !hub.send_to(id, &payload).await {
                    debug!(observer = %id, "reply undeliverable, dropping connection");
                    return Err(());
                }
            }
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
        }
    }
    Ok(())
}
