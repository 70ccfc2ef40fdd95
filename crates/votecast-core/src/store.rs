// SQLite persistence for voting sessions, their options and recorded votes.
//
// Every operation checks out its own connection from a bounded r2d2 pool, so
// unrelated requests never contend on an in-process lock. Writers that touch
// the vote table use IMMEDIATE transactions: SQLite takes its write lock at
// BEGIN, which is the engine's equivalent of a locking read of the rows the
// validation inspects.

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{StoreError, VoteError};
use crate::model::{
    is_open, NewSession, OptionTally, Page, ResultsSnapshot, SessionResults, SessionUpdate,
    VotingSession,
};

const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS voting_sessions (
    id          BLOB PRIMARY KEY,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    ended_at    TEXT NOT NULL,
    deleted_at  TEXT
);

CREATE TABLE IF NOT EXISTS voting_options (
    id         BLOB PRIMARY KEY,
    session_id BLOB NOT NULL REFERENCES voting_sessions(id) ON DELETE CASCADE,
    name       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS votes (
    id         BLOB PRIMARY KEY,
    option_id  BLOB NOT NULL REFERENCES voting_options(id) ON DELETE CASCADE,
    session_id BLOB NOT NULL REFERENCES voting_sessions(id) ON DELETE CASCADE,
    user_id    BLOB NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_voting_options_session ON voting_options(session_id);
CREATE INDEX IF NOT EXISTS idx_votes_option ON votes(option_id);
";

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Durable record of voting sessions, options and votes.
///
/// All methods are blocking; async callers should run them on the blocking
/// thread pool (see [`crate::workflow::VoteWorkflow`]).
pub struct SessionStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SessionStore {
    /// Open (or create) the database described by `config`, ensure the schema
    /// exists and build a connection pool capped at `max_connections`.
    pub fn open(config: &DatabaseConfig) -> Result<Self, StoreError> {
        // Journal mode and schema are settled once, before any pooled
        // connection exists.
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(config.busy_timeout())?;
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        let busy_timeout = config.busy_timeout();
        let manager = SqliteConnectionManager::file(&config.path).with_init(move |c| {
            c.busy_timeout(busy_timeout)?;
            c.execute_batch(PRAGMAS)
        });
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .min_idle(Some(1))
            .connection_timeout(config.connection_timeout())
            .build(manager)?;

        info!(
            path = %config.path,
            max_connections = config.max_connections,
            "session store opened"
        );
        Ok(SessionStore { pool })
    }

    // ------------------------------------------------------------------
    // Session CRUD
    // ------------------------------------------------------------------

    /// Create a session together with its options in a single transaction.
    /// Returns the new session id.
    pub fn create_session(&self, new: &NewSession) -> Result<Uuid, StoreError> {
        validate_name(&new.name)?;
        validate_window(new.started_at, new.ended_at)?;
        validate_options(&new.options)?;

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO voting_sessions (id, name, description, created_at, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                new.name.trim(),
                new.description,
                Utc::now(),
                new.started_at,
                new.ended_at
            ],
        )?;
        insert_options(&tx, id, &new.options)?;

        tx.commit()?;
        debug!(session_id = %id, options = new.options.len(), "voting session created");
        Ok(id)
    }

    /// Fetch a single session, including archived ones.
    pub fn session(&self, id: Uuid) -> Result<VotingSession, StoreError> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT id, name, description, created_at, started_at, ended_at, deleted_at
             FROM voting_sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok(VotingSession {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    created_at: row.get(3)?,
                    started_at: row.get(4)?,
                    ended_at: row.get(5)?,
                    deleted_at: row.get(6)?,
                })
            },
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    /// Non-archived sessions ordered by name, each with its options ordered
    /// by name and annotated with vote counts. Pagination counts sessions.
    ///
    /// Reads run inside one transaction so the snapshot is consistent.
    pub fn list_results(&self, page: Page) -> Result<ResultsSnapshot, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let limit: i64 = if page.limit == 0 {
            -1
        } else {
            i64::from(page.limit)
        };

        let mut sessions = {
            let mut stmt = tx.prepare_cached(
                "SELECT id, name, description, created_at, started_at, ended_at
                 FROM voting_sessions
                 WHERE deleted_at IS NULL
                 ORDER BY name, id
                 LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![limit, i64::from(page.offset)], |row| {
                Ok(SessionResults {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    created_at: row.get(3)?,
                    started_at: row.get(4)?,
                    ended_at: row.get(5)?,
                    options: Vec::new(),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        {
            let mut stmt = tx.prepare_cached(
                "SELECT o.id, o.name, COUNT(r.id)
                 FROM voting_options o
                 LEFT JOIN votes r ON r.option_id = o.id
                 WHERE o.session_id = ?1
                 GROUP BY o.id
                 ORDER BY o.name, o.id",
            )?;
            for session in &mut sessions {
                let rows = stmt.query_map(params![session.id], |row| {
                    let votes: i64 = row.get(2)?;
                    Ok(OptionTally {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        votes: votes.max(0) as u64,
                    })
                })?;
                session.options = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            }
        }

        tx.commit()?;
        Ok(ResultsSnapshot { sessions })
    }

    /// Apply a partial update. The existence check and the write share one
    /// IMMEDIATE transaction so a concurrent vote observes either the old or
    /// the new end time, never a mix.
    pub fn update_session(&self, id: Uuid, update: &SessionUpdate) -> Result<(), StoreError> {
        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        if let Some(options) = &update.options {
            validate_options(options)?;
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (started_at, ended_at): (DateTime<Utc>, DateTime<Utc>) = tx
            .query_row(
                "SELECT started_at, ended_at FROM voting_sessions
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;

        let started_at = update.started_at.unwrap_or(started_at);
        let ended_at = update.ended_at.unwrap_or(ended_at);
        validate_window(started_at, ended_at)?;

        tx.execute(
            "UPDATE voting_sessions
             SET name        = COALESCE(?2, name),
                 description = COALESCE(?3, description),
                 started_at  = ?4,
                 ended_at    = ?5
             WHERE id = ?1",
            params![
                id,
                update.name.as_deref().map(str::trim),
                update.description,
                started_at,
                ended_at
            ],
        )?;

        if let Some(options) = &update.options {
            // Votes on the replaced options go with them (ON DELETE CASCADE).
            tx.execute(
                "DELETE FROM voting_options WHERE session_id = ?1",
                params![id],
            )?;
            insert_options(&tx, id, options)?;
        }

        tx.commit()?;
        debug!(session_id = %id, "voting session updated");
        Ok(())
    }

    /// Set the soft-delete marker. Archived sessions disappear from listings
    /// and stop accepting votes; their data is kept.
    pub fn archive_session(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE voting_sessions SET deleted_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id, Utc::now()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        debug!(session_id = %id, "voting session archived");
        Ok(())
    }

    /// Delete a session; its options and votes are removed by cascade.
    pub fn delete_session(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM voting_sessions WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        debug!(session_id = %id, "voting session deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Vote recording
    // ------------------------------------------------------------------

    /// Record one vote for `option_id` by `user_id`.
    ///
    /// Read-with-lock, validate, write, commit-or-rollback:
    /// 1. the owning session must be open at `now` (`SessionClosed`),
    /// 2. the user must have no vote on any option of that session
    ///    (`DuplicateVote`),
    /// 3. the vote row is inserted.
    ///
    /// All three steps run inside a single IMMEDIATE transaction; any early
    /// return drops the transaction, which rolls it back. `cancel` is
    /// consulted before the transaction starts and again right before commit.
    pub fn record_vote(
        &self,
        option_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Uuid, VoteError> {
        if cancel.is_cancelled() {
            return Err(VoteError::Cancelled);
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (session_id, ended_at, deleted_at): (Uuid, DateTime<Utc>, Option<DateTime<Utc>>) = tx
            .query_row(
                "SELECT v.id, v.ended_at, v.deleted_at
                 FROM voting_options o
                 JOIN voting_sessions v ON v.id = o.session_id
                 WHERE o.id = ?1",
                params![option_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or(VoteError::SessionNotFound)?;

        if deleted_at.is_some() {
            return Err(VoteError::SessionNotFound);
        }
        if !is_open(deleted_at, ended_at, now) {
            return Err(VoteError::SessionClosed);
        }

        let already_voted: bool = tx.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM votes r
                JOIN voting_options o ON o.id = r.option_id
                WHERE o.session_id = ?1 AND r.user_id = ?2
             )",
            params![session_id, user_id],
            |row| row.get(0),
        )?;
        if already_voted {
            return Err(VoteError::DuplicateVote);
        }

        let vote_id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO votes (id, option_id, session_id, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![vote_id, option_id, session_id, user_id, now],
        )?;

        if cancel.is_cancelled() {
            return Err(VoteError::Cancelled);
        }
        tx.commit()?;

        debug!(%session_id, %option_id, %user_id, "vote committed");
        Ok(vote_id)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn insert_options(tx: &Transaction<'_>, session_id: Uuid, options: &[String]) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO voting_options (id, session_id, name) VALUES (?1, ?2, ?3)",
    )?;
    for name in options {
        stmt.execute(params![Uuid::new_v4(), session_id, name.trim()])?;
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::invalid("name", "must not be empty"));
    }
    Ok(())
}

fn validate_window(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Result<(), StoreError> {
    if started_at >= ended_at {
        return Err(StoreError::invalid(
            "endedAt",
            format!("must be after start time {started_at}"),
        ));
    }
    Ok(())
}

fn validate_options(options: &[String]) -> Result<(), StoreError> {
    let mut seen = std::collections::HashSet::new();
    for name in options {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::invalid("options", "option names must not be empty"));
        }
        if !seen.insert(name) {
            return Err(StoreError::invalid(
                "options",
                format!("duplicate option `{name}`"),
            ));
        }
    }
    Ok(())
}
