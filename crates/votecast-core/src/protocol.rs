// JSON wire protocol spoken over the websocket.
//
// Every frame is a JSON object with a `type` discriminator. Requests may carry
// a client-chosen `requestId`, echoed back on the matching response so a client
// can tell replies apart from the unsolicited RESULTS broadcasts.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{NewSession, SessionResults, SessionUpdate};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    CastVote {
        #[serde(default)]
        request_id: Option<String>,
        login: String,
        password: String,
        option_id: Uuid,
    },
    ListSessions {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        offset: Option<u32>,
    },
    CreateSession {
        #[serde(default)]
        request_id: Option<String>,
        session: NewSession,
    },
    UpdateSession {
        #[serde(default)]
        request_id: Option<String>,
        id: Uuid,
        update: SessionUpdate,
    },
    ArchiveSession {
        #[serde(default)]
        request_id: Option<String>,
        id: Uuid,
    },
    DeleteSession {
        #[serde(default)]
        request_id: Option<String>,
        id: Uuid,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientMessage::CastVote { request_id, .. }
            | ClientMessage::ListSessions { request_id, .. }
            | ClientMessage::CreateSession { request_id, .. }
            | ClientMessage::UpdateSession { request_id, .. }
            | ClientMessage::ArchiveSession { request_id, .. }
            | ClientMessage::DeleteSession { request_id, .. } => request_id.as_deref(),
        }
    }

    /// Short name for log lines. Never includes credentials.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CastVote { .. } => "cast_vote",
            ClientMessage::ListSessions { .. } => "list_sessions",
            ClientMessage::CreateSession { .. } => "create_session",
            ClientMessage::UpdateSession { .. } => "update_session",
            ClientMessage::ArchiveSession { .. } => "archive_session",
            ClientMessage::DeleteSession { .. } => "delete_session",
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Results snapshot. Broadcast to every observer after a change (no
    /// `requestId`) and returned in reply to LIST_SESSIONS.
    Results {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        sessions: Vec<SessionResults>,
    },
    VoteAccepted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        vote_id: Uuid,
    },
    SessionCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        id: Uuid,
    },
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(
        request_id: Option<String>,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        ServerMessage::Error {
            request_id,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
