use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

use super::types::EncryptedEnvelope;
use crate::error::{custody_err, ErrorKind};
use crate::open_db_connection;

pub trait EnvelopeStore {
    /// Fails with `DuplicateEnvelope` if the id is taken.
    fn insert(&mut self, envelope: &EncryptedEnvelope) -> Result<()>;

    /// Replace an existing envelope in one atomic write.
    fn replace(&mut self, envelope: &EncryptedEnvelope) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<EncryptedEnvelope>>;

    fn ids(&self) -> Result<Vec<String>>;

    fn ids_for_master(&self, master_key_id: &str) -> Result<Vec<String>>;

    fn count_for_master(&self, master_key_id: &str) -> Result<usize>;
}

pub struct SqliteEnvelopeStore {
    conn: Connection,
}

impl SqliteEnvelopeStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS envelopes (
              id TEXT PRIMARY KEY,
              master_key_id TEXT NOT NULL,
              data_key_id TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              record_json TEXT NOT NULL,
              ciphertext BLOB NOT NULL,
              iv BLOB NOT NULL,
              auth_tag BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_envelopes_master ON envelopes(master_key_id);
            "#,
        )?;
        Ok(Self { conn })
    }
}

impl EnvelopeStore for SqliteEnvelopeStore {
    fn insert(&mut self, envelope: &EncryptedEnvelope) -> Result<()> {
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO envelopes(id, master_key_id, data_key_id, created_at, record_json, ciphertext, iv, auth_tag)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                envelope.id,
                envelope.master_key_id,
                envelope.data_key_id,
                envelope.created_at as i64,
                serde_json::to_string(envelope)?,
                envelope.ciphertext,
                envelope.iv,
                envelope.auth_tag
            ],
        )?;
        if inserted == 0 {
            return Err(custody_err(
                ErrorKind::DuplicateEnvelope,
                format!("envelope {} already exists", envelope.id),
            ));
        }
        Ok(())
    }

    fn replace(&mut self, envelope: &EncryptedEnvelope) -> Result<()> {
        let updated = self.conn.execute(
            r#"
            UPDATE envelopes
            SET master_key_id = ?2, data_key_id = ?3, record_json = ?4, ciphertext = ?5, iv = ?6, auth_tag = ?7
            WHERE id = ?1
            "#,
            params![
                envelope.id,
                envelope.master_key_id,
                envelope.data_key_id,
                serde_json::to_string(envelope)?,
                envelope.ciphertext,
                envelope.iv,
                envelope.auth_tag
            ],
        )?;
        if updated == 0 {
            return Err(custody_err(
                ErrorKind::EnvelopeNotFound,
                format!("envelope {} not found", envelope.id),
            ));
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<EncryptedEnvelope>> {
        let row: Option<(String, Vec<u8>, Vec<u8>, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT record_json, ciphertext, iv, auth_tag FROM envelopes WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((json, ciphertext, iv, auth_tag)) = row else {
            return Ok(None);
        };
        let mut envelope: EncryptedEnvelope = serde_json::from_str(&json)?;
        envelope.ciphertext = ciphertext;
        envelope.iv = iv;
        envelope.auth_tag = auth_tag;
        Ok(Some(envelope))
    }

    fn ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM envelopes ORDER BY created_at ASC, id ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    fn ids_for_master(&self, master_key_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM envelopes WHERE master_key_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![master_key_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    fn count_for_master(&self, master_key_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM envelopes WHERE master_key_id = ?1",
            params![master_key_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[derive(Default)]
pub struct InMemoryEnvelopeStore {
    envelopes: BTreeMap<String, EncryptedEnvelope>,
}

impl InMemoryEnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnvelopeStore for InMemoryEnvelopeStore {
    fn insert(&mut self, envelope: &EncryptedEnvelope) -> Result<()> {
        if self.envelopes.contains_key(&envelope.id) {
            return Err(custody_err(
                ErrorKind::DuplicateEnvelope,
                format!("envelope {} already exists", envelope.id),
            ));
        }
        self.envelopes.insert(envelope.id.clone(), envelope.clone());
        Ok(())
    }

    fn replace(&mut self, envelope: &EncryptedEnvelope) -> Result<()> {
        match self.envelopes.get_mut(&envelope.id) {
            Some(slot) => {
                *slot = envelope.clone();
                Ok(())
            }
            None => Err(custody_err(
                ErrorKind::EnvelopeNotFound,
                format!("envelope {} not found", envelope.id),
            )),
        }
    }

    fn get(&self, id: &str) -> Result<Option<EncryptedEnvelope>> {
        Ok(self.envelopes.get(id).cloned())
    }

    fn ids(&self) -> Result<Vec<String>> {
        Ok(self.envelopes.keys().cloned().collect())
    }

    fn ids_for_master(&self, master_key_id: &str) -> Result<Vec<String>> {
        Ok(self
            .envelopes
            .values()
            .filter(|e| e.master_key_id == master_key_id)
            .map(|e| e.id.clone())
            .collect())
    }

    fn count_for_master(&self, master_key_id: &str) -> Result<usize> {
        Ok(self
            .envelopes
            .values()
            .filter(|e| e.master_key_id == master_key_id)
            .count())
    }
}
