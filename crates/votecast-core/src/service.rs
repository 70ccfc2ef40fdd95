// Request dispatch: turns one decoded client message into one reply.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthError, CredentialStore};
use crate::error::{StoreError, VoteError};
use crate::model::Page;
use crate::orchestrator::VoteCaster;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::store::SessionStore;

pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
const STORAGE_UNAVAILABLE: &str = "STORAGE_UNAVAILABLE";

pub struct VotingService {
    caster: VoteCaster,
    credentials: CredentialStore,
    request_timeout: Duration,
}

impl VotingService {
    pub fn new(caster: VoteCaster, credentials: CredentialStore, request_timeout: Duration) -> Self {
        VotingService {
            caster,
            credentials,
            request_timeout,
        }
    }

    pub fn caster(&self) -> &VoteCaster {
        &self.caster
    }

    fn store(&self) -> Arc<SessionStore> {
        Arc::clone(self.caster.store())
    }

    /// Decode and handle one text frame. Malformed input yields an
    /// INVALID_REQUEST error reply rather than a failure.
    pub async fn handle_text(&self, text: &str) -> ServerMessage {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                debug!("rejecting malformed request: {e}");
                ServerMessage::error(None, INVALID_REQUEST, format!("malformed request: {e}"))
            }
        }
    }

    pub async fn handle(&self, msg: ClientMessage) -> ServerMessage {
        let kind = msg.kind();
        let request_id = msg.request_id().map(str::to_string);
        debug!(request = kind, request_id = ?request_id, "handling request");

        match msg {
            ClientMessage::CastVote {
                login,
                password,
                option_id,
                ..
            } => {
                let user_id = match self.credentials.authenticate(&login, &password) {
                    Ok(id) => id,
                    Err(e) => return auth_error(request_id, &login, e),
                };
                match self.cast_with_deadline(option_id, user_id).await {
                    Ok(vote_id) => ServerMessage::VoteAccepted {
                        request_id,
                        vote_id,
                    },
                    Err(e) => ServerMessage::error(request_id, e.code(), e.to_string()),
                }
            }

            ClientMessage::ListSessions { limit, offset, .. } => {
                let page = Page {
                    limit: limit.unwrap_or(Page::default().limit),
                    offset: offset.unwrap_or(0),
                };
                match self.blocking(move |store| store.list_results(page)).await {
                    Ok(snapshot) => ServerMessage::Results {
                        request_id,
                        sessions: snapshot.sessions,
                    },
                    Err(e) => store_error(request_id, kind, e),
                }
            }

            ClientMessage::CreateSession { session, .. } => {
                match self.blocking(move |store| store.create_session(&session)).await {
                    Ok(id) => {
                        info!(session = %id, "session created");
                        self.caster.schedule_refresh();
                        ServerMessage::SessionCreated { request_id, id }
                    }
                    Err(e) => store_error(request_id, kind, e),
                }
            }

            ClientMessage::UpdateSession { id, update, .. } => {
                let result = self
                    .blocking(move |store| store.update_session(id, &update))
                    .await;
                self.mutation_reply(request_id, kind, id, result)
            }

            ClientMessage::ArchiveSession { id, .. } => {
                let result = self.blocking(move |store| store.archive_session(id)).await;
                self.mutation_reply(request_id, kind, id, result)
            }

            ClientMessage::DeleteSession { id, .. } => {
                let result = self.blocking(move |store| store.delete_session(id)).await;
                self.mutation_reply(request_id, kind, id, result)
            }
        }
    }

    /// Cast a vote, cancelling it if it has not committed within the request
    /// timeout. The transaction is always awaited to completion so the reply
    /// matches what was stored.
    async fn cast_with_deadline(&self, option_id: Uuid, user_id: Uuid) -> Result<Uuid, VoteError> {
        let cancel = CancellationToken::new();
        let cast = self.caster.cast_vote(&cancel, option_id, user_id);
        tokio::pin!(cast);

        tokio::select! {
            result = &mut cast => result,
            _ = tokio::time::sleep(self.request_timeout) => {
                warn!(%option_id, "vote request deadline exceeded, cancelling");
                cancel.cancel();
                cast.await
            }
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&SessionStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store();
        match tokio::task::spawn_blocking(move || op(&store)).await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Task(e.to_string())),
        }
    }

    fn mutation_reply(
        &self,
        request_id: Option<String>,
        kind: &str,
        id: Uuid,
        result: Result<(), StoreError>,
    ) -> ServerMessage {
        match result {
            Ok(()) => {
                info!(session = %id, request = kind, "session changed");
                self.caster.schedule_refresh();
                ServerMessage::Ok { request_id }
            }
            Err(e) => store_error(request_id, kind, e),
        }
    }
}

fn auth_error(request_id: Option<String>, login: &str, err: AuthError) -> ServerMessage {
    info!(login, "vote rejected: {err}");
    ServerMessage::error(request_id, UNAUTHORIZED, "invalid login or password")
}

fn store_error(request_id: Option<String>, kind: &str, err: StoreError) -> ServerMessage {
    match err {
        StoreError::NotFound => {
            ServerMessage::error(request_id, VoteError::SessionNotFound.code(), err.to_string())
        }
        StoreError::InvalidSession { .. } => {
            ServerMessage::error(request_id, INVALID_REQUEST, err.to_string())
        }
        StoreError::Storage(_) | StoreError::Pool(_) | StoreError::Task(_) => {
            warn!(request = kind, "storage failure: {err}");
            ServerMessage::error(request_id, STORAGE_UNAVAILABLE, err.to_string())
        }
    }
}
