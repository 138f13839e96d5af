use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};

use super::types::{HlsKey, HlsKeyStatus, KeyRotationEvent, StreamEncryptionState};
use crate::kms::EncryptedPayload;
use crate::open_db_connection;

/// A stream key together with its KMS-sealed material.
#[derive(Clone, Debug)]
pub struct StoredHlsKey {
    pub key: HlsKey,
    pub sealed: EncryptedPayload,
}

pub trait StreamKeyStore {
    /// Persist a stream state together with the keys it touched in one
    /// atomic write. `updated` keys must already exist; `created` keys must
    /// not.
    fn commit_state(
        &mut self,
        state: &StreamEncryptionState,
        updated: &[HlsKey],
        created: &[StoredHlsKey],
    ) -> Result<()>;

    /// Mark keys and drop the stream state in one atomic write.
    fn close_stream(&mut self, stream_id: &str, updated: &[HlsKey]) -> Result<()>;

    fn update_keys(&mut self, updated: &[HlsKey]) -> Result<()>;

    fn key(&self, id: &str) -> Result<Option<StoredHlsKey>>;

    fn keys_for_stream(&self, stream_id: &str) -> Result<Vec<HlsKey>>;

    /// Active keys whose expiry is at or before `now_s`.
    fn expired_active_keys(&self, now_s: u64) -> Result<Vec<HlsKey>>;

    fn state(&self, stream_id: &str) -> Result<Option<StreamEncryptionState>>;

    fn append_event(&mut self, event: &KeyRotationEvent) -> Result<()>;

    fn events(&self, stream_id: &str) -> Result<Vec<KeyRotationEvent>>;
}

pub struct SqliteStreamKeyStore {
    conn: Connection,
}

impl SqliteStreamKeyStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS hls_keys (
              id TEXT PRIMARY KEY,
              stream_id TEXT NOT NULL,
              status TEXT NOT NULL,
              expires_at INTEGER,
              record_json TEXT NOT NULL,
              sealed_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_hls_keys_stream ON hls_keys(stream_id);

            CREATE TABLE IF NOT EXISTS stream_states (
              stream_id TEXT PRIMARY KEY,
              record_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rotation_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              event_id TEXT NOT NULL UNIQUE,
              stream_id TEXT NOT NULL,
              timestamp INTEGER NOT NULL,
              record_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rotation_events_stream ON rotation_events(stream_id);
            "#,
        )?;
        Ok(Self { conn })
    }

    fn read_keys(&self, sql: &str, arg: rusqlite::types::Value) -> Result<Vec<HlsKey>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![arg], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }
}

fn update_key(conn: &Connection, key: &HlsKey) -> Result<()> {
    let updated = conn.execute(
        "UPDATE hls_keys SET status = ?2, expires_at = ?3, record_json = ?4 WHERE id = ?1",
        params![
            key.id,
            key.status.as_str(),
            key.expires_at.map(|t| t as i64),
            serde_json::to_string(key)?
        ],
    )?;
    if updated == 0 {
        return Err(anyhow!("stream key {} not found", key.id));
    }
    Ok(())
}

fn insert_key(conn: &Connection, stored: &StoredHlsKey) -> Result<()> {
    conn.execute(
        "INSERT INTO hls_keys(id, stream_id, status, expires_at, record_json, sealed_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            stored.key.id,
            stored.key.stream_id,
            stored.key.status.as_str(),
            stored.key.expires_at.map(|t| t as i64),
            serde_json::to_string(&stored.key)?,
            serde_json::to_string(&stored.sealed)?
        ],
    )?;
    Ok(())
}

impl StreamKeyStore for SqliteStreamKeyStore {
    fn commit_state(
        &mut self,
        state: &StreamEncryptionState,
        updated: &[HlsKey],
        created: &[StoredHlsKey],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        for stored in created {
            insert_key(&tx, stored)?;
        }
        for key in updated {
            update_key(&tx, key)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO stream_states(stream_id, record_json) VALUES (?1, ?2)",
            params![state.stream_id, serde_json::to_string(state)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn close_stream(&mut self, stream_id: &str, updated: &[HlsKey]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for key in updated {
            update_key(&tx, key)?;
        }
        tx.execute(
            "DELETE FROM stream_states WHERE stream_id = ?1",
            params![stream_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn update_keys(&mut self, updated: &[HlsKey]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for key in updated {
            update_key(&tx, key)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn key(&self, id: &str) -> Result<Option<StoredHlsKey>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT record_json, sealed_json FROM hls_keys WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(key, sealed)| {
            Ok(StoredHlsKey {
                key: serde_json::from_str(&key)?,
                sealed: serde_json::from_str(&sealed)?,
            })
        })
        .transpose()
    }

    fn keys_for_stream(&self, stream_id: &str) -> Result<Vec<HlsKey>> {
        self.read_keys(
            "SELECT record_json FROM hls_keys WHERE stream_id = ?1 ORDER BY rowid ASC",
            stream_id.to_string().into(),
        )
    }

    fn expired_active_keys(&self, now_s: u64) -> Result<Vec<HlsKey>> {
        self.read_keys(
            "SELECT record_json FROM hls_keys WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?1 ORDER BY rowid ASC",
            (now_s as i64).into(),
        )
    }

    fn state(&self, stream_id: &str) -> Result<Option<StreamEncryptionState>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT record_json FROM stream_states WHERE stream_id = ?1",
                params![stream_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(Into::into))
            .transpose()
    }

    fn append_event(&mut self, event: &KeyRotationEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO rotation_events(event_id, stream_id, timestamp, record_json) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.id,
                event.stream_id,
                event.timestamp as i64,
                serde_json::to_string(event)?
            ],
        )?;
        Ok(())
    }

    fn events(&self, stream_id: &str) -> Result<Vec<KeyRotationEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_json FROM rotation_events WHERE stream_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![stream_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct InMemoryStreamKeyStore {
    keys: BTreeMap<String, StoredHlsKey>,
    key_order: Vec<String>,
    states: HashMap<String, StreamEncryptionState>,
    events: Vec<KeyRotationEvent>,
}

impl InMemoryStreamKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_updates(&self, updated: &[HlsKey]) -> Result<()> {
        for key in updated {
            if !self.keys.contains_key(&key.id) {
                return Err(anyhow!("stream key {} not found", key.id));
            }
        }
        Ok(())
    }

    fn apply_updates(&mut self, updated: &[HlsKey]) {
        for key in updated {
            if let Some(stored) = self.keys.get_mut(&key.id) {
                stored.key = key.clone();
            }
        }
    }
}

impl StreamKeyStore for InMemoryStreamKeyStore {
    fn commit_state(
        &mut self,
        state: &StreamEncryptionState,
        updated: &[HlsKey],
        created: &[StoredHlsKey],
    ) -> Result<()> {
        self.check_updates(updated)?;
        for stored in created {
            if self.keys.contains_key(&stored.key.id) {
                return Err(anyhow!("stream key {} already exists", stored.key.id));
            }
        }
        for stored in created {
            self.key_order.push(stored.key.id.clone());
            self.keys.insert(stored.key.id.clone(), stored.clone());
        }
        self.apply_updates(updated);
        self.states.insert(state.stream_id.clone(), state.clone());
        Ok(())
    }

    fn close_stream(&mut self, stream_id: &str, updated: &[HlsKey]) -> Result<()> {
        self.check_updates(updated)?;
        self.apply_updates(updated);
        self.states.remove(stream_id);
        Ok(())
    }

    fn update_keys(&mut self, updated: &[HlsKey]) -> Result<()> {
        self.check_updates(updated)?;
        self.apply_updates(updated);
        Ok(())
    }

    fn key(&self, id: &str) -> Result<Option<StoredHlsKey>> {
        Ok(self.keys.get(id).cloned())
    }

    fn keys_for_stream(&self, stream_id: &str) -> Result<Vec<HlsKey>> {
        Ok(self
            .key_order
            .iter()
            .filter_map(|id| self.keys.get(id))
            .filter(|stored| stored.key.stream_id == stream_id)
            .map(|stored| stored.key.clone())
            .collect())
    }

    fn expired_active_keys(&self, now_s: u64) -> Result<Vec<HlsKey>> {
        Ok(self
            .key_order
            .iter()
            .filter_map(|id| self.keys.get(id))
            .map(|stored| &stored.key)
            .filter(|key| {
                key.status == HlsKeyStatus::Active && key.expires_at.map_or(false, |t| t <= now_s)
            })
            .cloned()
            .collect())
    }

    fn state(&self, stream_id: &str) -> Result<Option<StreamEncryptionState>> {
        Ok(self.states.get(stream_id).cloned())
    }

    fn append_event(&mut self, event: &KeyRotationEvent) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }

    fn events(&self, stream_id: &str) -> Result<Vec<KeyRotationEvent>> {
        Ok(self
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .cloned()
            .collect())
    }
}
