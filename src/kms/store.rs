use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

use super::key::{DataKey, MasterKey};
use crate::error::{custody_err, ErrorKind};
use crate::open_db_connection;

/// Persistence for the key hierarchy. The service serializes all access.
pub trait KeyStore {
    fn insert_master_key(&mut self, key: &MasterKey) -> Result<()>;

    fn update_master_key(&mut self, key: &MasterKey) -> Result<()>;

    /// Atomically hand the alias of `retired` over to `successor`: the
    /// retired record is updated and the successor inserted.
    fn commit_rotation(&mut self, retired: &MasterKey, successor: &MasterKey) -> Result<()>;

    fn master_key(&self, id: &str) -> Result<Option<MasterKey>>;

    fn master_key_by_alias(&self, alias: &str) -> Result<Option<MasterKey>>;

    fn list_master_keys(&self) -> Result<Vec<MasterKey>>;

    fn insert_data_key(&mut self, key: &DataKey) -> Result<()>;

    fn update_data_key(&mut self, key: &DataKey) -> Result<()>;

    /// Atomically insert `replacement` and mark `old_id` as superseded by it.
    fn supersede_data_key(&mut self, old_id: &str, replacement: &DataKey) -> Result<()>;

    fn data_key(&self, id: &str) -> Result<Option<DataKey>>;

    /// Data keys wrapped under a master key, oldest first.
    fn data_keys_for_master(&self, master_key_id: &str) -> Result<Vec<DataKey>>;
}

pub struct SqliteKeyStore {
    conn: Connection,
}

impl SqliteKeyStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS master_keys (
              id TEXT PRIMARY KEY,
              alias TEXT NOT NULL UNIQUE,
              status TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              record_json TEXT NOT NULL,
              sealed_material BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS data_keys (
              id TEXT PRIMARY KEY,
              master_key_id TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              record_json TEXT NOT NULL,
              wrapped_key BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_data_keys_master ON data_keys(master_key_id);
            "#,
        )?;
        Ok(())
    }

    fn read_master(json: String, sealed: Vec<u8>) -> Result<MasterKey> {
        let mut key: MasterKey = serde_json::from_str(&json)?;
        key.sealed_material = sealed;
        Ok(key)
    }

    fn read_data_key(json: String, wrapped: Vec<u8>) -> Result<DataKey> {
        let mut key: DataKey = serde_json::from_str(&json)?;
        key.wrapped_key = wrapped;
        Ok(key)
    }

    fn query_master(&self, sql: &str, arg: &str) -> Result<Option<MasterKey>> {
        let row: Option<(String, Vec<u8>)> = self
            .conn
            .query_row(sql, params![arg], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        row.map(|(json, sealed)| Self::read_master(json, sealed))
            .transpose()
    }
}

fn map_alias_conflict(err: rusqlite::Error, alias: &str) -> anyhow::Error {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            custody_err(
                ErrorKind::DuplicateAlias,
                format!("alias {} is already in use", alias),
            )
        }
        other => other.into(),
    }
}

fn insert_master(conn: &Connection, key: &MasterKey) -> Result<()> {
    conn.execute(
        "INSERT INTO master_keys(id, alias, status, created_at, record_json, sealed_material) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            key.id,
            key.alias,
            key.status.as_str(),
            key.created_at as i64,
            serde_json::to_string(key)?,
            key.sealed_material
        ],
    )
    .map_err(|e| map_alias_conflict(e, &key.alias))?;
    Ok(())
}

fn update_master(conn: &Connection, key: &MasterKey) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE master_keys SET alias = ?2, status = ?3, record_json = ?4, sealed_material = ?5 WHERE id = ?1",
            params![
                key.id,
                key.alias,
                key.status.as_str(),
                serde_json::to_string(key)?,
                key.sealed_material
            ],
        )
        .map_err(|e| map_alias_conflict(e, &key.alias))?;
    if updated == 0 {
        return Err(custody_err(
            ErrorKind::KeyNotFound,
            format!("master key {} not found", key.id),
        ));
    }
    Ok(())
}

fn insert_data(conn: &Connection, key: &DataKey) -> Result<()> {
    conn.execute(
        "INSERT INTO data_keys(id, master_key_id, created_at, record_json, wrapped_key) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            key.id,
            key.master_key_id,
            key.created_at as i64,
            serde_json::to_string(key)?,
            key.wrapped_key
        ],
    )?;
    Ok(())
}

impl KeyStore for SqliteKeyStore {
    fn insert_master_key(&mut self, key: &MasterKey) -> Result<()> {
        insert_master(&self.conn, key)
    }

    fn update_master_key(&mut self, key: &MasterKey) -> Result<()> {
        update_master(&self.conn, key)
    }

    fn commit_rotation(&mut self, retired: &MasterKey, successor: &MasterKey) -> Result<()> {
        let tx = self.conn.transaction()?;
        update_master(&tx, retired)?;
        insert_master(&tx, successor)?;
        tx.commit()?;
        Ok(())
    }

    fn master_key(&self, id: &str) -> Result<Option<MasterKey>> {
        self.query_master(
            "SELECT record_json, sealed_material FROM master_keys WHERE id = ?1",
            id,
        )
    }

    fn master_key_by_alias(&self, alias: &str) -> Result<Option<MasterKey>> {
        self.query_master(
            "SELECT record_json, sealed_material FROM master_keys WHERE alias = ?1",
            alias,
        )
    }

    fn list_master_keys(&self) -> Result<Vec<MasterKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_json, sealed_material FROM master_keys ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            let (json, sealed) = row?;
            out.push(Self::read_master(json, sealed)?);
        }
        Ok(out)
    }

    fn insert_data_key(&mut self, key: &DataKey) -> Result<()> {
        insert_data(&self.conn, key)
    }

    fn update_data_key(&mut self, key: &DataKey) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE data_keys SET record_json = ?2, wrapped_key = ?3 WHERE id = ?1",
            params![key.id, serde_json::to_string(key)?, key.wrapped_key],
        )?;
        if updated == 0 {
            return Err(custody_err(
                ErrorKind::KeyNotFound,
                format!("data key {} not found", key.id),
            ));
        }
        Ok(())
    }

    fn supersede_data_key(&mut self, old_id: &str, replacement: &DataKey) -> Result<()> {
        let tx = self.conn.transaction()?;
        let row: Option<(String, Vec<u8>)> = tx
            .query_row(
                "SELECT record_json, wrapped_key FROM data_keys WHERE id = ?1",
                params![old_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (json, wrapped) = row.ok_or_else(|| {
            custody_err(ErrorKind::KeyNotFound, format!("data key {} not found", old_id))
        })?;
        let mut old = Self::read_data_key(json, wrapped)?;
        if let Some(existing) = &old.superseded_by {
            return Err(anyhow!(
                "data key {} already superseded by {}",
                old_id,
                existing
            ));
        }
        old.superseded_by = Some(replacement.id.clone());
        insert_data(&tx, replacement)?;
        tx.execute(
            "UPDATE data_keys SET record_json = ?2 WHERE id = ?1",
            params![old.id, serde_json::to_string(&old)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn data_key(&self, id: &str) -> Result<Option<DataKey>> {
        let row: Option<(String, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT record_json, wrapped_key FROM data_keys WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(json, wrapped)| Self::read_data_key(json, wrapped))
            .transpose()
    }

    fn data_keys_for_master(&self, master_key_id: &str) -> Result<Vec<DataKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_json, wrapped_key FROM data_keys WHERE master_key_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![master_key_id], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (json, wrapped) = row?;
            out.push(Self::read_data_key(json, wrapped)?);
        }
        Ok(out)
    }
}

/// Process-local key store for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemoryKeyStore {
    masters: HashMap<String, MasterKey>,
    master_order: Vec<String>,
    data_keys: HashMap<String, DataKey>,
    data_order: Vec<String>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn alias_taken_by_other(&self, alias: &str, id: &str) -> bool {
        self.masters
            .values()
            .any(|k| k.alias == alias && k.id != id)
    }
}

impl KeyStore for InMemoryKeyStore {
    fn insert_master_key(&mut self, key: &MasterKey) -> Result<()> {
        if self.alias_taken_by_other(&key.alias, &key.id) {
            return Err(custody_err(
                ErrorKind::DuplicateAlias,
                format!("alias {} is already in use", key.alias),
            ));
        }
        if self.masters.contains_key(&key.id) {
            return Err(anyhow!("master key {} already exists", key.id));
        }
        self.master_order.push(key.id.clone());
        self.masters.insert(key.id.clone(), key.clone());
        Ok(())
    }

    fn update_master_key(&mut self, key: &MasterKey) -> Result<()> {
        if !self.masters.contains_key(&key.id) {
            return Err(custody_err(
                ErrorKind::KeyNotFound,
                format!("master key {} not found", key.id),
            ));
        }
        if self.alias_taken_by_other(&key.alias, &key.id) {
            return Err(custody_err(
                ErrorKind::DuplicateAlias,
                format!("alias {} is already in use", key.alias),
            ));
        }
        self.masters.insert(key.id.clone(), key.clone());
        Ok(())
    }

    fn commit_rotation(&mut self, retired: &MasterKey, successor: &MasterKey) -> Result<()> {
        let previous = self
            .masters
            .get(&retired.id)
            .cloned()
            .ok_or_else(|| {
                custody_err(
                    ErrorKind::KeyNotFound,
                    format!("master key {} not found", retired.id),
                )
            })?;
        self.update_master_key(retired)?;
        if let Err(e) = self.insert_master_key(successor) {
            self.masters.insert(previous.id.clone(), previous);
            return Err(e);
        }
        Ok(())
    }

    fn master_key(&self, id: &str) -> Result<Option<MasterKey>> {
        Ok(self.masters.get(id).cloned())
    }

    fn master_key_by_alias(&self, alias: &str) -> Result<Option<MasterKey>> {
        Ok(self.masters.values().find(|k| k.alias == alias).cloned())
    }

    fn list_master_keys(&self) -> Result<Vec<MasterKey>> {
        Ok(self
            .master_order
            .iter()
            .filter_map(|id| self.masters.get(id).cloned())
            .collect())
    }

    fn insert_data_key(&mut self, key: &DataKey) -> Result<()> {
        if self.data_keys.contains_key(&key.id) {
            return Err(anyhow!("data key {} already exists", key.id));
        }
        self.data_order.push(key.id.clone());
        self.data_keys.insert(key.id.clone(), key.clone());
        Ok(())
    }

    fn update_data_key(&mut self, key: &DataKey) -> Result<()> {
        match self.data_keys.get_mut(&key.id) {
            Some(slot) => {
                *slot = key.clone();
                Ok(())
            }
            None => Err(custody_err(
                ErrorKind::KeyNotFound,
                format!("data key {} not found", key.id),
            )),
        }
    }

    fn supersede_data_key(&mut self, old_id: &str, replacement: &DataKey) -> Result<()> {
        let old = self.data_keys.get(old_id).ok_or_else(|| {
            custody_err(ErrorKind::KeyNotFound, format!("data key {} not found", old_id))
        })?;
        if let Some(existing) = &old.superseded_by {
            return Err(anyhow!(
                "data key {} already superseded by {}",
                old_id,
                existing
            ));
        }
        self.insert_data_key(replacement)?;
        if let Some(old) = self.data_keys.get_mut(old_id) {
            old.superseded_by = Some(replacement.id.clone());
        }
        Ok(())
    }

    fn data_key(&self, id: &str) -> Result<Option<DataKey>> {
        Ok(self.data_keys.get(id).cloned())
    }

    fn data_keys_for_master(&self, master_key_id: &str) -> Result<Vec<DataKey>> {
        Ok(self
            .data_order
            .iter()
            .filter_map(|id| self.data_keys.get(id))
            .filter(|k| k.master_key_id == master_key_id)
            .cloned()
            .collect())
    }
}
