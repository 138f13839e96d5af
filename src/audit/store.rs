use anyhow::{anyhow, Result};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::compliance::{ComplianceEvent, ComplianceFilter};
use super::entry::{AuditCheckpoint, AuditFilter, AuditLogEntry, GENESIS_CHAIN_HASH};
use crate::open_db_connection;

/// Position of the next append: the chain hash it links to and its sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainCursor {
    pub last_chain_hash: [u8; 32],
    pub next_sequence: u64,
}

impl ChainCursor {
    pub fn genesis() -> Self {
        Self {
            last_chain_hash: GENESIS_CHAIN_HASH,
            next_sequence: 1,
        }
    }
}

/// Persistence for the audit chain, its checkpoints and compliance events.
///
/// Appends are serialized by the caller; implementations only need to make
/// each individual write atomic.
pub trait AuditStore: Send + Sync {
    fn append_entry(&self, entry: &AuditLogEntry) -> Result<()>;

    /// Head of the stored chain, falling back to the latest checkpoint and
    /// then to genesis.
    fn chain_cursor(&self) -> Result<ChainCursor>;

    fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>>;

    fn latest_checkpoint(&self) -> Result<Option<AuditCheckpoint>>;

    /// Record a checkpoint and delete every entry at or below its cutoff.
    /// Returns the number of pruned entries.
    fn checkpoint_and_prune(&self, checkpoint: &AuditCheckpoint) -> Result<usize>;

    fn append_compliance_event(&self, event: &ComplianceEvent) -> Result<()>;

    fn mark_reported(&self, event_id: &str, reported_at: u64) -> Result<()>;

    fn compliance_events(&self, filter: &ComplianceFilter) -> Result<Vec<ComplianceEvent>>;

    fn store_verifying_key(&self, key: &[u8; 32]) -> Result<()>;

    fn verifying_key(&self) -> Result<Option<[u8; 32]>>;
}

pub struct SqliteAuditStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl SqliteAuditStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let writer = open_db_connection(db_path)?;
        Self::ensure_schema(&writer)?;
        let reader = open_db_connection(db_path)?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS audit_entries (
              sequence INTEGER PRIMARY KEY,
              id TEXT NOT NULL UNIQUE,
              timestamp INTEGER NOT NULL,
              actor_id TEXT NOT NULL,
              actor_role TEXT NOT NULL,
              action TEXT NOT NULL,
              resource_type TEXT NOT NULL,
              resource_id TEXT NOT NULL,
              details TEXT NOT NULL,
              ip_address TEXT,
              user_agent TEXT,
              session_id TEXT,
              success INTEGER NOT NULL,
              error TEXT,
              error_code TEXT,
              metadata_json TEXT NOT NULL,
              signature TEXT NOT NULL,
              chain_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_checkpoints (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              cutoff_sequence INTEGER NOT NULL,
              chain_head TEXT NOT NULL,
              signature TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS compliance_events (
              id TEXT PRIMARY KEY,
              audit_entry_id TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              event_json TEXT NOT NULL,
              reported_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS audit_metadata (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              public_key BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_entries(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_entries(actor_id);
            "#,
        )?;
        Ok(())
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<AuditLogEntry> {
        let sequence: i64 = row.get(0)?;
        let timestamp: i64 = row.get(2)?;
        let action: String = row.get(5)?;
        let resource_type: String = row.get(6)?;
        let success: i64 = row.get(12)?;
        let metadata_json: String = row.get(15)?;
        Ok(AuditLogEntry {
            id: row.get(1)?,
            sequence: sequence as u64,
            timestamp: timestamp as u64,
            actor_id: row.get(3)?,
            actor_role: row.get(4)?,
            action: action.parse().map_err(|e| conversion_error(5, e))?,
            resource_type: resource_type.parse().map_err(|e| conversion_error(6, e))?,
            resource_id: row.get(7)?,
            details: row.get(8)?,
            ip_address: row.get(9)?,
            user_agent: row.get(10)?,
            session_id: row.get(11)?,
            success: success != 0,
            error: row.get(13)?,
            error_code: row.get(14)?,
            metadata: serde_json::from_str::<BTreeMap<String, String>>(&metadata_json)
                .map_err(|e| conversion_error(15, e.into()))?,
            signature: row.get(16)?,
            chain_hash: row.get(17)?,
        })
    }
}

fn conversion_error(column: usize, err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err.into())
}

const ENTRY_COLUMNS: &str = "sequence, id, timestamp, actor_id, actor_role, action, resource_type, \
     resource_id, details, ip_address, user_agent, session_id, success, error, error_code, \
     metadata_json, signature, chain_hash";

impl AuditStore for SqliteAuditStore {
    fn append_entry(&self, entry: &AuditLogEntry) -> Result<()> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| anyhow!("audit writer lock poisoned"))?;
        let metadata_json = serde_json::to_string(&entry.metadata)?;
        conn.execute(
            &format!(
                "INSERT INTO audit_entries({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                ENTRY_COLUMNS
            ),
            params![
                entry.sequence as i64,
                entry.id,
                entry.timestamp as i64,
                entry.actor_id,
                entry.actor_role,
                entry.action.as_str(),
                entry.resource_type.as_str(),
                entry.resource_id,
                entry.details,
                entry.ip_address,
                entry.user_agent,
                entry.session_id,
                entry.success as i64,
                entry.error,
                entry.error_code,
                metadata_json,
                entry.signature,
                entry.chain_hash,
            ],
        )?;
        Ok(())
    }

    fn chain_cursor(&self) -> Result<ChainCursor> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| anyhow!("audit reader lock poisoned"))?;
        let last: Option<(i64, String)> = conn
            .query_row(
                "SELECT sequence, chain_hash FROM audit_entries ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((sequence, chain_hash)) = last {
            let bytes = hex::decode(&chain_hash)
                .map_err(|e| anyhow!("corrupt audit log: chain hash hex: {}", e))?;
            return Ok(ChainCursor {
                last_chain_hash: crate::blob32(bytes, "audit chain hash")?,
                next_sequence: sequence as u64 + 1,
            });
        }
        drop(conn);
        match self.latest_checkpoint()? {
            Some(checkpoint) => Ok(ChainCursor {
                last_chain_hash: checkpoint.chain_head_bytes()?,
                next_sequence: checkpoint.cutoff_sequence + 1,
            }),
            None => Ok(ChainCursor::genesis()),
        }
    }

    fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(t) = filter.from_timestamp {
            clauses.push("timestamp >= ?");
            values.push(Value::Integer(t as i64));
        }
        if let Some(t) = filter.to_timestamp {
            clauses.push("timestamp <= ?");
            values.push(Value::Integer(t as i64));
        }
        if let Some(s) = filter.from_sequence {
            clauses.push("sequence >= ?");
            values.push(Value::Integer(s as i64));
        }
        if let Some(s) = filter.to_sequence {
            clauses.push("sequence <= ?");
            values.push(Value::Integer(s as i64));
        }
        if let Some(actor) = &filter.actor_id {
            clauses.push("actor_id = ?");
            values.push(Value::Text(actor.clone()));
        }
        if let Some(action) = filter.action {
            clauses.push("action = ?");
            values.push(Value::Text(action.as_str().to_string()));
        }
        if let Some(resource_type) = filter.resource_type {
            clauses.push("resource_type = ?");
            values.push(Value::Text(resource_type.as_str().to_string()));
        }
        if let Some(resource_id) = &filter.resource_id {
            clauses.push("resource_id = ?");
            values.push(Value::Text(resource_id.clone()));
        }
        let mut sql = format!("SELECT {} FROM audit_entries", ENTRY_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY sequence ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self
            .reader
            .lock()
            .map_err(|_| anyhow!("audit reader lock poisoned"))?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn latest_checkpoint(&self) -> Result<Option<AuditCheckpoint>> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| anyhow!("audit reader lock poisoned"))?;
        let checkpoint = conn
            .query_row(
                "SELECT created_at, cutoff_sequence, chain_head, signature FROM audit_checkpoints ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    let created_at: i64 = row.get(0)?;
                    let cutoff_sequence: i64 = row.get(1)?;
                    Ok(AuditCheckpoint {
                        created_at: created_at as u64,
                        cutoff_sequence: cutoff_sequence as u64,
                        chain_head: row.get(2)?,
                        signature: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn checkpoint_and_prune(&self, checkpoint: &AuditCheckpoint) -> Result<usize> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| anyhow!("audit writer lock poisoned"))?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO audit_checkpoints(created_at, cutoff_sequence, chain_head, signature) VALUES (?1, ?2, ?3, ?4)",
            params![
                checkpoint.created_at as i64,
                checkpoint.cutoff_sequence as i64,
                checkpoint.chain_head,
                checkpoint.signature
            ],
        )?;
        let pruned = tx.execute(
            "DELETE FROM audit_entries WHERE sequence <= ?1",
            params![checkpoint.cutoff_sequence as i64],
        )?;
        tx.commit()?;
        Ok(pruned)
    }

    fn append_compliance_event(&self, event: &ComplianceEvent) -> Result<()> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| anyhow!("audit writer lock poisoned"))?;
        conn.execute(
            "INSERT INTO compliance_events(id, audit_entry_id, created_at, event_json, reported_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id,
                event.audit_entry_id,
                event.created_at as i64,
                serde_json::to_string(event)?,
                event.reported_at.map(|t| t as i64)
            ],
        )?;
        Ok(())
    }

    fn mark_reported(&self, event_id: &str, reported_at: u64) -> Result<()> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| anyhow!("audit writer lock poisoned"))?;
        let updated = conn.execute(
            "UPDATE compliance_events SET reported_at = ?1 WHERE id = ?2",
            params![reported_at as i64, event_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("compliance event {} not found", event_id));
        }
        Ok(())
    }

    fn compliance_events(&self, filter: &ComplianceFilter) -> Result<Vec<ComplianceEvent>> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| anyhow!("audit reader lock poisoned"))?;
        let mut stmt = conn.prepare(
            "SELECT event_json, reported_at FROM compliance_events ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let json: String = row.get(0)?;
            let reported_at: Option<i64> = row.get(1)?;
            Ok((json, reported_at))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (json, reported_at) = row?;
            let mut event: ComplianceEvent = serde_json::from_str(&json)?;
            event.reported_at = reported_at.map(|t| t as u64);
            if filter.matches(&event) {
                out.push(event);
            }
        }
        Ok(out)
    }

    fn store_verifying_key(&self, key: &[u8; 32]) -> Result<()> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| anyhow!("audit writer lock poisoned"))?;
        let existing: Option<Vec<u8>> = conn
            .query_row(
                "SELECT public_key FROM audit_metadata WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(bytes) if bytes.as_slice() != key.as_slice() => Err(anyhow!(
                "audit signing key mismatch: database was sealed by a different key"
            )),
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO audit_metadata(id, public_key) VALUES (1, ?1)",
                    params![key.to_vec()],
                )?;
                Ok(())
            }
        }
    }

    fn verifying_key(&self) -> Result<Option<[u8; 32]>> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| anyhow!("audit reader lock poisoned"))?;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT public_key FROM audit_metadata WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        bytes
            .map(|b| crate::blob32(b, "audit public key"))
            .transpose()
    }
}

#[derive(Default)]
struct MemoryState {
    entries: Vec<AuditLogEntry>,
    checkpoints: Vec<AuditCheckpoint>,
    compliance: Vec<ComplianceEvent>,
    verifying_key: Option<[u8; 32]>,
}

/// Process-local store for tests and ephemeral tooling.
#[derive(Default)]
pub struct InMemoryAuditStore {
    state: Mutex<MemoryState>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("audit memory store lock poisoned"))
    }

    /// Rewrite a stored entry in place. Used to exercise tamper detection.
    pub fn tamper_with(&self, sequence: u64, edit: impl FnOnce(&mut AuditLogEntry)) -> Result<()> {
        let mut state = self.state()?;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.sequence == sequence)
            .ok_or_else(|| anyhow!("no audit entry with sequence {}", sequence))?;
        edit(entry);
        Ok(())
    }
}

impl AuditStore for InMemoryAuditStore {
    fn append_entry(&self, entry: &AuditLogEntry) -> Result<()> {
        let mut state = self.state()?;
        if state.entries.iter().any(|e| e.sequence == entry.sequence) {
            return Err(anyhow!("duplicate audit sequence {}", entry.sequence));
        }
        state.entries.push(entry.clone());
        Ok(())
    }

    fn chain_cursor(&self) -> Result<ChainCursor> {
        let state = self.state()?;
        if let Some(last) = state.entries.last() {
            return Ok(ChainCursor {
                last_chain_hash: last.chain_hash_bytes()?,
                next_sequence: last.sequence + 1,
            });
        }
        match state.checkpoints.last() {
            Some(checkpoint) => Ok(ChainCursor {
                last_chain_hash: checkpoint.chain_head_bytes()?,
                next_sequence: checkpoint.cutoff_sequence + 1,
            }),
            None => Ok(ChainCursor::genesis()),
        }
    }

    fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>> {
        let state = self.state()?;
        let matching = state.entries.iter().filter(|e| filter.matches(e)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    fn latest_checkpoint(&self) -> Result<Option<AuditCheckpoint>> {
        Ok(self.state()?.checkpoints.last().cloned())
    }

    fn checkpoint_and_prune(&self, checkpoint: &AuditCheckpoint) -> Result<usize> {
        let mut state = self.state()?;
        state.checkpoints.push(checkpoint.clone());
        let before = state.entries.len();
        state
            .entries
            .retain(|e| e.sequence > checkpoint.cutoff_sequence);
        Ok(before - state.entries.len())
    }

    fn append_compliance_event(&self, event: &ComplianceEvent) -> Result<()> {
        self.state()?.compliance.push(event.clone());
        Ok(())
    }

    fn mark_reported(&self, event_id: &str, reported_at: u64) -> Result<()> {
        let mut state = self.state()?;
        let event = state
            .compliance
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| anyhow!("compliance event {} not found", event_id))?;
        event.reported_at = Some(reported_at);
        Ok(())
    }

    fn compliance_events(&self, filter: &ComplianceFilter) -> Result<Vec<ComplianceEvent>> {
        Ok(self
            .state()?
            .compliance
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    fn store_verifying_key(&self, key: &[u8; 32]) -> Result<()> {
        let mut state = self.state()?;
        match state.verifying_key {
            Some(existing) if existing != *key => Err(anyhow!(
                "audit signing key mismatch: store was sealed by a different key"
            )),
            Some(_) => Ok(()),
            None => {
                state.verifying_key = Some(*key);
                Ok(())
            }
        }
    }

    fn verifying_key(&self) -> Result<Option<[u8; 32]>> {
        Ok(self.state()?.verifying_key)
    }
}
