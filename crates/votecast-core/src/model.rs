// Domain types shared by the store, the vote workflow and the wire protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Voting sessions
// ---------------------------------------------------------------------------

/// A time-bounded set of options that users vote among.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingSession {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Soft-delete marker. An archived session is hidden from listings and
    /// no longer accepts votes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl VotingSession {
    /// A session is open iff it has not been archived and `now` is strictly
    /// before its end time. The start time is deliberately not consulted.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        is_open(self.deleted_at, self.ended_at, now)
    }
}

/// Shared "open" predicate, usable without a fully materialised session.
pub(crate) fn is_open(
    deleted_at: Option<DateTime<Utc>>,
    ended_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    deleted_at.is_none() && now < ended_at
}

/// Parameters for creating a session together with its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Partial update of a session. `None` fields are left untouched; a provided
/// option list replaces the existing options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
}

/// Pagination over sessions. A `limit` of 0 means "no limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Page {
            limit: 10,
            offset: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Results snapshot
// ---------------------------------------------------------------------------

/// One option of a session annotated with its current vote count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionTally {
    pub id: Uuid,
    pub name: String,
    pub votes: u64,
}

/// A visible session with its tallied options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResults {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub options: Vec<OptionTally>,
}

impl SessionResults {
    /// Vote count of the option named `name`, if the session has one.
    pub fn votes_for(&self, name: &str) -> Option<u64> {
        self.options
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.votes)
    }

    pub fn total_votes(&self) -> u64 {
        self.options.iter().map(|o| o.votes).sum()
    }
}

/// Derived, read-only projection of vote counts. Produced on demand and
/// never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsSnapshot {
    pub sessions: Vec<SessionResults>,
}

impl ResultsSnapshot {
    pub fn session(&self, id: Uuid) -> Option<&SessionResults> {
        self.sessions.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(ended_at: DateTime<Utc>, deleted_at: Option<DateTime<Utc>>) -> VotingSession {
        let now = Utc::now();
        VotingSession {
            id: Uuid::new_v4(),
            name: "Lunch".into(),
            description: String::new(),
            created_at: now,
            started_at: now - Duration::hours(1),
            ended_at,
            deleted_at,
        }
    }

    #[test]
    fn session_open_until_end_time() {
        let now = Utc::now();
        assert!(session(now + Duration::seconds(1), None).is_open(now));
        assert!(!session(now, None).is_open(now));
        assert!(!session(now - Duration::seconds(1), None).is_open(now));
    }

    #[test]
    fn archived_session_is_never_open() {
        let now = Utc::now();
        let s = session(now + Duration::days(1), Some(now));
        assert!(!s.is_open(now));
    }

    #[test]
    fn session_results_helpers() {
        let now = Utc::now();
        let results = SessionResults {
            id: Uuid::new_v4(),
            name: "S".into(),
            description: String::new(),
            created_at: now,
            started_at: now,
            ended_at: now,
            options: vec![
                OptionTally {
                    id: Uuid::new_v4(),
                    name: "A".into(),
                    votes: 3,
                },
                OptionTally {
                    id: Uuid::new_v4(),
                    name: "B".into(),
                    votes: 1,
                },
            ],
        };
        assert_eq!(results.votes_for("A"), Some(3));
        assert_eq!(results.votes_for("C"), None);
        assert_eq!(results.total_votes(), 4);
    }

    #[test]
    fn snapshot_serializes_with_camel_case_fields() {
        let now = Utc::now();
        let snapshot = ResultsSnapshot {
            sessions: vec![SessionResults {
                id: Uuid::nil(),
                name: "S".into(),
                description: "d".into(),
                created_at: now,
                started_at: now,
                ended_at: now,
                options: vec![],
            }],
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        let first = &value["sessions"][0];
        assert!(first.get("startedAt").is_some());
        assert!(first.get("endedAt").is_some());
        assert!(first.get("createdAt").is_some());
        assert_eq!(first["options"], serde_json::json!([]));
    }
}
