//! Conversation sessions: at most one session row per (channel instance, remote endpoint).
//!
//! Find-or-create is a single upsert against the unique (instance, endpoint) key, so
//! concurrent inbound events for a new endpoint all resolve to the same row. Rows are never
//! deleted; a closed conversation is reactivated.

use crate::channels::{ChannelInstance, ChannelRegistry};
use crate::state::ConversationState;
use crate::store::{format_time, parse_time, SessionId, Store, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Active,
    Inactive,
}

impl SessionStatus {
    fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Inactive => "INACTIVE",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "ACTIVE" {
            SessionStatus::Active
        } else {
            SessionStatus::Inactive
        }
    }
}

/// One ongoing conversation between a channel instance and a remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub id: SessionId,
    pub instance_id: i64,
    pub remote_endpoint: String,
    pub status: SessionStatus,
    /// State of the session's most recent message entry; written only by the message log.
    #[serde(default)]
    pub state: Option<ConversationState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

const SESSION_COLUMNS: &str = "id, instance_id, remote_endpoint, status, state, created_at, updated_at";

fn parse_session_row(row: &Row<'_>) -> rusqlite::Result<ConversationSession> {
    let state: Option<String> = row.get(4)?;
    Ok(ConversationSession {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        remote_endpoint: row.get(2)?,
        status: SessionStatus::parse(&row.get::<_, String>(3)?),
        state: state.and_then(|s| s.parse().ok()),
        created_at: parse_time(&row.get::<_, String>(5)?),
        updated_at: parse_time(&row.get::<_, String>(6)?),
    })
}

/// Session lookups and lifecycle.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<Store>,
    channels: Arc<ChannelRegistry>,
}

impl SessionManager {
    pub fn new(store: Arc<Store>, channels: Arc<ChannelRegistry>) -> Self {
        Self { store, channels }
    }

    pub fn find_instance_by_name(&self, name: &str) -> Option<ChannelInstance> {
        log::debug!("session: finding instance by name {}", name);
        self.channels.find_by_name(name).cloned()
    }

    pub fn find_instance_by_id(&self, id: i64) -> Option<ChannelInstance> {
        self.channels.find_by_id(id).cloned()
    }

    /// Return the active session for the pair, reactivating an inactive row or inserting a new one.
    pub async fn find_or_create_session(
        &self,
        instance: &ChannelInstance,
        remote_endpoint: &str,
    ) -> Result<ConversationSession, StoreError> {
        let instance_id = instance.id;
        let endpoint = remote_endpoint.to_string();
        let (session, previous) = self
            .store
            .call(move |conn| -> Result<_, StoreError> {
                let tx = conn.transaction()?;
                let previous: Option<String> = tx
                    .query_row(
                        "SELECT status FROM sessions WHERE instance_id = ?1 AND remote_endpoint = ?2",
                        params![instance_id, endpoint],
                        |r| r.get(0),
                    )
                    .optional()?;
                let now = format_time(Utc::now());
                tx.execute(
                    "INSERT INTO sessions (instance_id, remote_endpoint, status, created_at, updated_at)
                     VALUES (?1, ?2, 'ACTIVE', ?3, ?3)
                     ON CONFLICT (instance_id, remote_endpoint) DO UPDATE SET
                         status = 'ACTIVE',
                         updated_at = CASE WHEN status = 'ACTIVE' THEN updated_at ELSE excluded.updated_at END",
                    params![instance_id, endpoint, now],
                )?;
                let session = tx.query_row(
                    &format!(
                        "SELECT {} FROM sessions WHERE instance_id = ?1 AND remote_endpoint = ?2",
                        SESSION_COLUMNS
                    ),
                    params![instance_id, endpoint],
                    parse_session_row,
                )?;
                tx.commit()?;
                Ok((session, previous.map(|s| SessionStatus::parse(&s))))
            })
            .await?;
        match previous {
            Some(SessionStatus::Active) => {
                log::debug!("session: active session {} found for {}", session.id, session.remote_endpoint)
            }
            Some(SessionStatus::Inactive) => {
                log::info!("session: reactivating session {} for {}", session.id, session.remote_endpoint)
            }
            None => log::info!(
                "session: created session {} for {} on {}",
                session.id,
                session.remote_endpoint,
                instance.name
            ),
        }
        Ok(session)
    }

    pub async fn get(&self, session_id: SessionId) -> Result<Option<ConversationSession>, StoreError> {
        self.store
            .call(move |conn| -> Result<_, StoreError> {
                let session = conn
                    .query_row(
                        &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                        [session_id],
                        parse_session_row,
                    )
                    .optional()?;
                Ok(session)
            })
            .await
    }

    /// Mark the session inactive. No-op when it is missing or already inactive.
    pub async fn deactivate_session(&self, session_id: SessionId) -> Result<(), StoreError> {
        let changed = self
            .store
            .call(move |conn| -> Result<_, StoreError> {
                let n = conn.execute(
                    "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                    params![
                        SessionStatus::Inactive.as_str(),
                        format_time(Utc::now()),
                        session_id,
                        SessionStatus::Active.as_str()
                    ],
                )?;
                Ok(n > 0)
            })
            .await?;
        if changed {
            log::info!("session: session {} deactivated", session_id);
        } else {
            log::debug!("session: deactivate {} skipped (missing or already inactive)", session_id);
        }
        Ok(())
    }

    /// Active sessions for the pair (never more than one).
    pub async fn active_count(&self, instance_id: i64, remote_endpoint: &str) -> Result<usize, StoreError> {
        let endpoint = remote_endpoint.to_string();
        self.store
            .call(move |conn| -> Result<_, StoreError> {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sessions WHERE instance_id = ?1 AND remote_endpoint = ?2 AND status = 'ACTIVE'",
                    params![instance_id, endpoint],
                    |r| r.get(0),
                )?;
                Ok(n as usize)
            })
            .await
    }
}
