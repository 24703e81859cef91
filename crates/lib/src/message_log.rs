//! Message log: one entry per processed inbound event, carrying the conversation state.
//!
//! Entries are append-only except for their state label (plus revision counter and effect
//! journal). The state of a session's most recent entry is mirrored onto the session row in
//! the same transaction, so the session always knows where its conversation stands.

use crate::queue::Payload;
use crate::state::ConversationState;
use crate::store::{format_time, parse_time, EntryId, SessionId, Store, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One durable record of an inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    pub id: EntryId,
    pub session_id: SessionId,
    /// Originating event payload, JSON-encoded.
    pub raw_payload: String,
    #[serde(rename = "stateLabel")]
    pub state: ConversationState,
    /// Gateway timestamp (unix seconds).
    pub timestamp: i64,
    pub remote_endpoint: String,
    pub from_remote: bool,
    pub kind: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Gateway message id, when the gateway supplied one.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Number of state writes applied to this entry.
    #[serde(default)]
    pub revision: u32,
    /// Completed side effects (e.g. created task item id), keyed by effect name.
    #[serde(default)]
    pub effects: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageEntry {
    pub fn payload(&self) -> Result<Payload, serde_json::Error> {
        serde_json::from_str(&self.raw_payload)
    }

    pub fn effect(&self, key: &str) -> Option<&str> {
        self.effects.get(key).map(String::as_str)
    }

    /// No state write and no recorded effect since the entry was appended.
    pub fn is_untouched(&self) -> bool {
        self.revision == 0 && self.effects.is_empty()
    }
}

/// Fields of a new entry.
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub session_id: SessionId,
    pub payload: &'a Payload,
    pub state: ConversationState,
    pub timestamp: i64,
    pub remote_endpoint: &'a str,
    pub from_remote: bool,
    pub kind: &'a str,
    pub display_name: Option<&'a str>,
    pub external_id: Option<&'a str>,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message entry {0} not found")]
    NotFound(EntryId),
    #[error("message entry {entry} is in {found}, expected {expected}")]
    Conflict {
        entry: EntryId,
        expected: ConversationState,
        found: ConversationState,
    },
    #[error("transition {from} -> {to} is not allowed")]
    NotAllowed {
        from: ConversationState,
        to: ConversationState,
    },
}

impl From<rusqlite::Error> for LogError {
    fn from(e: rusqlite::Error) -> Self {
        LogError::Store(StoreError::Sqlite(e))
    }
}

const ENTRY_COLUMNS: &str = "id, session_id, raw_payload, state, timestamp, remote_endpoint, from_remote, kind, \
                             display_name, external_id, revision, effects, created_at, updated_at";

fn conversion<E: std::error::Error + Send + Sync + 'static>(col: usize, e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e))
}

fn parse_entry_row(row: &Row<'_>) -> rusqlite::Result<MessageEntry> {
    let state: String = row.get(3)?;
    let effects: String = row.get(11)?;
    Ok(MessageEntry {
        id: row.get(0)?,
        session_id: row.get(1)?,
        raw_payload: row.get(2)?,
        state: state.parse().map_err(|e| conversion(3, e))?,
        timestamp: row.get(4)?,
        remote_endpoint: row.get(5)?,
        from_remote: row.get(6)?,
        kind: row.get(7)?,
        display_name: row.get(8)?,
        external_id: row.get(9)?,
        revision: row.get(10)?,
        effects: serde_json::from_str(&effects).map_err(|e| conversion(11, e))?,
        created_at: parse_time(&row.get::<_, String>(12)?),
        updated_at: parse_time(&row.get::<_, String>(13)?),
    })
}

fn load_entry(conn: &Connection, entry_id: EntryId) -> rusqlite::Result<Option<MessageEntry>> {
    conn.query_row(
        &format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS),
        [entry_id],
        parse_entry_row,
    )
    .optional()
}

/// Write a new state onto an entry and mirror it onto the session when the entry is the
/// session's latest. `expected` turns the write into a compare-and-set; returns whether a row
/// was updated.
fn write_state(
    conn: &Connection,
    entry_id: EntryId,
    expected: Option<ConversationState>,
    state: ConversationState,
) -> rusqlite::Result<bool> {
    let now = format_time(Utc::now());
    let updated = conn.execute(
        "UPDATE entries SET state = ?1, revision = revision + 1, updated_at = ?2
         WHERE id = ?3 AND (?4 IS NULL OR state = ?4)",
        params![state.label(), now, entry_id, expected.map(ConversationState::label)],
    )?;
    if updated == 0 {
        return Ok(false);
    }
    conn.execute(
        "UPDATE sessions SET state = ?1, updated_at = ?2
         WHERE id = (SELECT session_id FROM entries WHERE id = ?3)
           AND ?3 = (SELECT MAX(e.id) FROM entries e WHERE e.session_id = sessions.id)",
        params![state.label(), now, entry_id],
    )?;
    Ok(true)
}

/// Owner of all message entries.
#[derive(Clone)]
pub struct MessageLog {
    store: Arc<Store>,
}

impl MessageLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Insert one entry; it becomes the session's latest, so the session's state follows it.
    pub async fn append(&self, new: NewEntry<'_>) -> Result<MessageEntry, LogError> {
        let raw_payload = serde_json::to_string(new.payload)?;
        let session_id = new.session_id;
        let state = new.state;
        let timestamp = new.timestamp;
        let remote_endpoint = new.remote_endpoint.to_string();
        let from_remote = new.from_remote;
        let kind = new.kind.to_string();
        let display_name = new.display_name.map(str::to_string);
        let external_id = new.external_id.map(str::to_string);
        let entry = self
            .store
            .call(move |conn| -> Result<MessageEntry, LogError> {
                let tx = conn.transaction()?;
                let now = format_time(Utc::now());
                tx.execute(
                    "INSERT INTO entries (session_id, raw_payload, state, timestamp, remote_endpoint, from_remote,
                                          kind, display_name, external_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                    params![
                        session_id,
                        raw_payload,
                        state.label(),
                        timestamp,
                        remote_endpoint,
                        from_remote,
                        kind,
                        display_name,
                        external_id,
                        now
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "UPDATE sessions SET state = ?1, updated_at = ?2 WHERE id = ?3",
                    params![state.label(), now, session_id],
                )?;
                let entry = load_entry(&tx, id)?.ok_or(LogError::NotFound(id))?;
                tx.commit()?;
                Ok(entry)
            })
            .await?;
        log::info!(
            "log: entry {} appended for {} in {}",
            entry.id,
            entry.remote_endpoint,
            entry.state
        );
        Ok(entry)
    }

    /// Unconditionally set the state label. No-op (returns None) when the entry is missing.
    pub async fn advance_state(
        &self,
        entry_id: EntryId,
        state: ConversationState,
    ) -> Result<Option<MessageEntry>, StoreError> {
        let updated = self
            .store
            .call(move |conn| -> Result<_, StoreError> {
                let tx = conn.transaction()?;
                if !write_state(&tx, entry_id, None, state)? {
                    return Ok(None);
                }
                let entry = load_entry(&tx, entry_id)?;
                tx.commit()?;
                Ok(entry)
            })
            .await?;
        match updated {
            Some(_) => log::info!("log: entry {} advanced to {}", entry_id, state),
            None => log::debug!("log: advance of missing entry {} ignored", entry_id),
        }
        Ok(updated)
    }

    /// Move an entry from `from` to `to`, failing when the stored state is no longer `from`
    /// or the pair is not in the transition table.
    pub async fn transition(
        &self,
        entry_id: EntryId,
        from: ConversationState,
        to: ConversationState,
    ) -> Result<MessageEntry, LogError> {
        if !from.can_transition_to(to) {
            return Err(LogError::NotAllowed { from, to });
        }
        let entry = self
            .store
            .call(move |conn| -> Result<MessageEntry, LogError> {
                let tx = conn.transaction()?;
                if !write_state(&tx, entry_id, Some(from), to)? {
                    return Err(match load_entry(&tx, entry_id)? {
                        None => LogError::NotFound(entry_id),
                        Some(found) => LogError::Conflict {
                            entry: entry_id,
                            expected: from,
                            found: found.state,
                        },
                    });
                }
                let entry = load_entry(&tx, entry_id)?.ok_or(LogError::NotFound(entry_id))?;
                tx.commit()?;
                Ok(entry)
            })
            .await?;
        log::info!("log: entry {} {} -> {}", entry_id, from, to);
        Ok(entry)
    }

    /// Most recent entry (by insertion order) for a remote endpoint.
    pub async fn latest_by_endpoint(&self, remote_endpoint: &str) -> Result<Option<MessageEntry>, StoreError> {
        let endpoint = remote_endpoint.to_string();
        self.store
            .call(move |conn| -> Result<_, StoreError> {
                let entry = conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM entries WHERE remote_endpoint = ?1 ORDER BY id DESC LIMIT 1",
                            ENTRY_COLUMNS
                        ),
                        [endpoint],
                        parse_entry_row,
                    )
                    .optional()?;
                Ok(entry)
            })
            .await
    }

    /// Single read. The session is not loaded; fetch it through the session manager.
    pub async fn get(&self, entry_id: EntryId) -> Result<Option<MessageEntry>, StoreError> {
        self.store
            .call(move |conn| -> Result<_, StoreError> { Ok(load_entry(conn, entry_id)?) })
            .await
    }

    /// Entry already recorded for this gateway message in the session, if any.
    pub async fn find_by_external_id(
        &self,
        session_id: SessionId,
        external_id: &str,
    ) -> Result<Option<MessageEntry>, StoreError> {
        let external_id = external_id.to_string();
        self.store
            .call(move |conn| -> Result<_, StoreError> {
                let entry = conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM entries WHERE session_id = ?1 AND external_id = ?2 ORDER BY id DESC LIMIT 1",
                            ENTRY_COLUMNS
                        ),
                        params![session_id, external_id],
                        parse_entry_row,
                    )
                    .optional()?;
                Ok(entry)
            })
            .await
    }

    /// Remember that a side effect for this entry completed. No-op when the entry is missing.
    pub async fn record_effect(&self, entry_id: EntryId, key: &str, value: &str) -> Result<(), LogError> {
        let key = key.to_string();
        let value = value.to_string();
        self.store
            .call(move |conn| -> Result<(), LogError> {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row("SELECT effects FROM entries WHERE id = ?1", [entry_id], |r| r.get(0))
                    .optional()?;
                let Some(current) = current else {
                    return Ok(());
                };
                let mut effects: BTreeMap<String, String> = serde_json::from_str(&current)?;
                effects.insert(key, value);
                tx.execute(
                    "UPDATE entries SET effects = ?1, updated_at = ?2 WHERE id = ?3",
                    params![serde_json::to_string(&effects)?, format_time(Utc::now()), entry_id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelGroup, ChannelInstance, ChannelRegistry};
    use crate::session::SessionManager;
    use crate::state::ConversationState::*;
    use serde_json::json;

    async fn setup() -> (SessionManager, MessageLog, SessionId) {
        let instance = ChannelInstance {
            id: 1,
            name: "instanceA".to_string(),
            status: "open".to_string(),
            group: ChannelGroup {
                name: "acme".to_string(),
                url: "http://gw".to_string(),
                api_key: None,
                owner: None,
            },
        };
        let store = Arc::new(Store::open_in_memory().unwrap());
        let sessions = SessionManager::new(store.clone(), Arc::new(ChannelRegistry::new(vec![instance.clone()]).unwrap()));
        let session = sessions.find_or_create_session(&instance, "555").await.unwrap();
        (sessions, MessageLog::new(store), session.id)
    }

    fn payload(text: &str) -> Payload {
        match json!({ "data": { "message": { "conversation": text } } }) {
            serde_json::Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    async fn append(log: &MessageLog, session_id: SessionId, endpoint: &str, state: ConversationState) -> MessageEntry {
        let p = payload("hi");
        log.append(NewEntry {
            session_id,
            payload: &p,
            state,
            timestamp: 1,
            remote_endpoint: endpoint,
            from_remote: true,
            kind: "conversation",
            display_name: Some("Ana"),
            external_id: None,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn append_stores_payload_and_mirrors_session_state() {
        let (sessions, log, sid) = setup().await;
        let e = append(&log, sid, "555", MessageReceived).await;
        assert_eq!(e.revision, 0);
        assert_eq!(e.payload().unwrap(), payload("hi"));
        assert_eq!(log.get(e.id).await.unwrap(), Some(e.clone()));
        assert_eq!(sessions.get(sid).await.unwrap().unwrap().state, Some(MessageReceived));
    }

    #[tokio::test]
    async fn advance_state_keeps_last_written_value() {
        let (_, log, sid) = setup().await;
        let e = append(&log, sid, "555", MessageReceived).await;
        log.advance_state(e.id, MessageProcessed).await.unwrap();
        log.advance_state(e.id, AwaitingTaskDetail).await.unwrap();
        let got = log.get(e.id).await.unwrap().unwrap();
        assert_eq!(got.state, AwaitingTaskDetail);
        assert_eq!(got.revision, 2);
        assert!(log.advance_state(424242, TaskCreated).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_rejects_stale_expected_state() {
        let (sessions, log, sid) = setup().await;
        let e = append(&log, sid, "555", MessageReceived).await;
        log.transition(e.id, MessageReceived, MessageProcessed).await.unwrap();
        let err = log.transition(e.id, MessageReceived, MessageProcessed).await.unwrap_err();
        assert!(matches!(err, LogError::Conflict { found: MessageProcessed, .. }));
        let err = log.transition(e.id, MessageProcessed, TaskCreated).await.unwrap_err();
        assert!(matches!(err, LogError::NotAllowed { .. }));
        let err = log.transition(999, MessageReceived, MessageProcessed).await.unwrap_err();
        assert!(matches!(err, LogError::NotFound(999)));
        assert_eq!(log.get(e.id).await.unwrap().unwrap().state, MessageProcessed);
        assert_eq!(sessions.get(sid).await.unwrap().unwrap().state, Some(MessageProcessed));
    }

    #[tokio::test]
    async fn older_entry_does_not_overwrite_session_state() {
        let (sessions, log, sid) = setup().await;
        let first = append(&log, sid, "555", MessageReceived).await;
        append(&log, sid, "555", MessageProcessed).await;
        log.transition(first.id, MessageReceived, MessageProcessed).await.unwrap();
        log.advance_state(first.id, SessionClosed).await.unwrap();
        assert_eq!(sessions.get(sid).await.unwrap().unwrap().state, Some(MessageProcessed));
    }

    #[tokio::test]
    async fn latest_by_endpoint_uses_insertion_order() {
        let (_, log, sid) = setup().await;
        assert!(log.latest_by_endpoint("555").await.unwrap().is_none());
        append(&log, sid, "555", MessageReceived).await;
        let second = append(&log, sid, "555", MessageProcessed).await;
        append(&log, sid, "777", MessageReceived).await;
        assert_eq!(log.latest_by_endpoint("555").await.unwrap().map(|e| e.id), Some(second.id));
    }

    #[tokio::test]
    async fn external_id_lookup_and_effects() {
        let (_, log, sid) = setup().await;
        let p = payload("1");
        let e = log
            .append(NewEntry {
                session_id: sid,
                payload: &p,
                state: MessageReceived,
                timestamp: 5,
                remote_endpoint: "555",
                from_remote: true,
                kind: "conversation",
                display_name: None,
                external_id: Some("MSG-1"),
            })
            .await
            .unwrap();
        assert_eq!(log.find_by_external_id(sid, "MSG-1").await.unwrap().map(|x| x.id), Some(e.id));
        assert!(log.find_by_external_id(sid + 1, "MSG-1").await.unwrap().is_none());

        log.record_effect(e.id, "task_item", "991").await.unwrap();
        log.record_effect(e.id, "task_comment", "5").await.unwrap();
        log.record_effect(424242, "task_item", "1").await.unwrap();
        let got = log.get(e.id).await.unwrap().unwrap();
        assert_eq!(got.effect("task_item"), Some("991"));
        assert_eq!(got.effect("task_comment"), Some("5"));
    }

    #[tokio::test]
    async fn entries_and_session_state_survive_reopen() {
        let dir = std::env::temp_dir().join(format!("parley-log-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("parley.db");
        let instance = ChannelInstance {
            id: 1,
            name: "instanceA".to_string(),
            status: "open".to_string(),
            group: ChannelGroup {
                name: "acme".to_string(),
                url: "http://gw".to_string(),
                api_key: None,
                owner: None,
            },
        };
        let channels = Arc::new(ChannelRegistry::new(vec![instance.clone()]).unwrap());
        let (sid, eid) = {
            let store = Arc::new(Store::open(&path).unwrap());
            let sessions = SessionManager::new(store.clone(), channels.clone());
            let log = MessageLog::new(store);
            let sid = sessions.find_or_create_session(&instance, "555").await.unwrap().id;
            let e = append(&log, sid, "555", MessageReceived).await;
            log.transition(e.id, MessageReceived, MessageProcessed).await.unwrap();
            (sid, e.id)
        };
        let store = Arc::new(Store::open(&path).unwrap());
        let sessions = SessionManager::new(store.clone(), channels);
        let log = MessageLog::new(store);
        let e = log.latest_by_endpoint("555").await.unwrap().unwrap();
        assert_eq!((e.id, e.state, e.revision), (eid, MessageProcessed, 1));
        let again = sessions.find_or_create_session(&instance, "555").await.unwrap();
        assert_eq!(again.id, sid);
        assert_eq!(again.state, Some(MessageProcessed));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
