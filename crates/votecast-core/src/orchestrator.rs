// Post-vote orchestration: cast a vote, then push fresh results to every
// observer without holding up the caller.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::VoteError;
use crate::hub::NotificationHub;
use crate::model::Page;
use crate::protocol::ServerMessage;
use crate::store::SessionStore;
use crate::workflow::VoteWorkflow;

#[derive(Clone)]
pub struct VoteCaster {
    workflow: VoteWorkflow,
    hub: Arc<NotificationHub>,
    snapshot_page: Page,
}

impl VoteCaster {
    /// `snapshot_limit` bounds how many sessions each pushed snapshot covers.
    pub fn new(workflow: VoteWorkflow, hub: Arc<NotificationHub>, snapshot_limit: u32) -> Self {
        VoteCaster {
            workflow,
            hub,
            snapshot_page: Page {
                limit: snapshot_limit,
                offset: 0,
            },
        }
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        self.workflow.store()
    }

    /// Cast a vote and, on success, schedule a results broadcast.
    ///
    /// The outcome is returned as soon as the transaction settles; the refresh
    /// runs as its own task and is not tied to `cancel`. A rejected vote
    /// triggers no broadcast.
    pub async fn cast_vote(
        &self,
        cancel: &CancellationToken,
        option_id: Uuid,
        user_id: Uuid,
    ) -> Result<Uuid, VoteError> {
        let vote_id = self.workflow.cast_vote(cancel, option_id, user_id).await?;
        self.schedule_refresh();
        Ok(vote_id)
    }

    /// Spawn a detached snapshot-and-broadcast. Failures are logged only.
    pub fn schedule_refresh(&self) -> JoinHandle<()> {
        let caster = self.clone();
        tokio::spawn(async move {
            match caster.refresh().await {
                Ok(delivered) => debug!(delivered, "results snapshot broadcast"),
                Err(e) => warn!("results refresh failed: {e:#}"),
            }
        })
    }

    /// Read a results snapshot and broadcast it. Returns the number of
    /// observers that received it.
    pub async fn refresh(&self) -> anyhow::Result<usize> {
        let store = Arc::clone(self.workflow.store());
        let page = self.snapshot_page;
        let snapshot = tokio::task::spawn_blocking(move || store.list_results(page))
            .await
            .context("snapshot task panicked")?
            .context("failed to read results snapshot")?;

        let payload = ServerMessage::Results {
            request_id: None,
            sessions: snapshot.sessions,
        }
        .to_json()
        .context("failed to serialize results snapshot")?;

        Ok(self.hub.broadcast(&payload).await)
    }
}
