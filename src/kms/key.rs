use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::crypto::aead::Algorithm;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    Evidence,
    Pii,
    Document,
    Backup,
    StreamingEncryption,
    General,
}

impl KeyPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyPurpose::Evidence => "evidence",
            KeyPurpose::Pii => "pii",
            KeyPurpose::Document => "document",
            KeyPurpose::Backup => "backup",
            KeyPurpose::StreamingEncryption => "streaming_encryption",
            KeyPurpose::General => "general",
        }
    }
}

impl std::str::FromStr for KeyPurpose {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "evidence" => Ok(KeyPurpose::Evidence),
            "pii" => Ok(KeyPurpose::Pii),
            "document" => Ok(KeyPurpose::Document),
            "backup" => Ok(KeyPurpose::Backup),
            "streaming_encryption" | "streaming" => Ok(KeyPurpose::StreamingEncryption),
            "general" => Ok(KeyPurpose::General),
            other => Err(anyhow!("unknown key purpose: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Rotating,
    Deactivated,
    PendingDeletion,
    Destroyed,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Rotating => "rotating",
            KeyStatus::Deactivated => "deactivated",
            KeyStatus::PendingDeletion => "pending_deletion",
            KeyStatus::Destroyed => "destroyed",
        }
    }

    /// Whether existing data keys under this master may still be unwrapped.
    pub fn can_unwrap(self) -> bool {
        !matches!(self, KeyStatus::Destroyed)
    }
}

/// Roles allowed to use a master key for data operations. `*` admits any role.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub allowed_roles: BTreeSet<String>,
}

impl AccessPolicy {
    pub fn roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, role: &str) -> bool {
        self.allowed_roles.contains("*") || self.allowed_roles.contains(role)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKey {
    pub id: String,
    pub alias: String,
    pub purpose: KeyPurpose,
    pub algorithm: Algorithm,
    pub status: KeyStatus,
    pub version: u32,
    pub created_at: u64,
    pub last_rotated_at: Option<u64>,
    pub next_rotation_at: u64,
    pub rotation_interval_days: u32,
    pub access_policy: AccessPolicy,
    pub predecessor_id: Option<String>,
    pub successor_id: Option<String>,
    pub deletion_date: Option<u64>,
    pub requires_migration: bool,
    /// Key material sealed under the root key (`nonce || tag || ciphertext`).
    /// Empty once the key is destroyed.
    #[serde(skip)]
    pub sealed_material: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataKey {
    pub id: String,
    pub master_key_id: String,
    pub created_at: u64,
    pub usage_count: u64,
    pub supersedes: Option<String>,
    pub superseded_by: Option<String>,
    /// Data key wrapped under its master key (`nonce || tag || ciphertext`).
    #[serde(skip)]
    pub wrapped_key: Vec<u8>,
}

/// Output of [`super::KeyManagementService::encrypt_data`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub data_key_id: String,
    pub master_key_id: String,
    pub algorithm: Algorithm,
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub id: String,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSummary {
    pub old_key_id: String,
    pub new_key_id: String,
    pub rotated_count: usize,
    pub failed: Vec<ItemFailure>,
    pub requires_migration: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRotationReport {
    pub rotated: Vec<RotationSummary>,
    pub failed: Vec<ItemFailure>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestructionReport {
    pub destroyed: Vec<String>,
    pub deferred: Vec<ItemFailure>,
}
