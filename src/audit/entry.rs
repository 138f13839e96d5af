use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::error_kind;

pub const GENESIS_CHAIN_HASH: [u8; 32] = [0u8; 32];

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err(anyhow!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

string_enum!(AuditAction {
    Create => "create",
    Read => "read",
    Update => "update",
    Delete => "delete",
    Login => "login",
    Logout => "logout",
    Export => "export",
    Encrypt => "encrypt",
    Decrypt => "decrypt",
    Rotate => "rotate",
    Escalate => "escalate",
    PermissionChange => "permission_change",
    Verify => "verify",
});

string_enum!(ResourceType {
    MasterKey => "master_key",
    DataKey => "data_key",
    Evidence => "evidence",
    Pii => "pii",
    Document => "document",
    Backup => "backup",
    Stream => "stream",
    StreamKey => "stream_key",
    AuditLog => "audit_log",
    System => "system",
});

/// Identity and session context of whoever performed an action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor_id: String,
    pub role: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
}

impl ActorContext {
    pub fn new(actor_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            role: role.into(),
            ip_address: None,
            user_agent: None,
            session_id: None,
        }
    }

    /// Actor used for background work (timers, sweeps, bootstrap).
    pub fn system() -> Self {
        Self::new("system", "system")
    }

    pub fn with_session(
        mut self,
        ip_address: Option<String>,
        user_agent: Option<String>,
        session_id: Option<String>,
    ) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self.session_id = session_id;
        self
    }
}

/// What a caller asks the log to record. Sequence, timestamp, signature and
/// chain hash are assigned at append time.
#[derive(Clone, Debug)]
pub struct AuditRecord {
    pub actor: ActorContext,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub details: String,
    pub success: bool,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl AuditRecord {
    pub fn new(
        actor: &ActorContext,
        action: AuditAction,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.clone(),
            action,
            resource_type,
            resource_id: resource_id.into(),
            details: details.into(),
            success: true,
            error: None,
            error_code: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Mark the record as a failed action, keeping the typed error code when
    /// the error carries one.
    pub fn failed(mut self, err: &anyhow::Error) -> Self {
        self.success = false;
        self.error = Some(format!("{:#}", err));
        self.error_code = error_kind(err).map(|kind| kind.code().to_string());
        self
    }

    pub fn meta(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub sequence: u64,
    pub timestamp: u64,
    pub actor_id: String,
    pub actor_role: String,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub details: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Hex-encoded Ed25519 signature over [`AuditLogEntry::signing_digest`].
    pub signature: String,
    /// Hex-encoded chain hash binding this entry to its predecessor.
    pub chain_hash: String,
}

#[derive(Serialize)]
struct CanonicalEntry<'a> {
    id: &'a str,
    sequence: u64,
    timestamp: u64,
    actor_id: &'a str,
    actor_role: &'a str,
    action: AuditAction,
    resource_type: ResourceType,
    resource_id: &'a str,
    details: &'a str,
    ip_address: &'a Option<String>,
    user_agent: &'a Option<String>,
    session_id: &'a Option<String>,
    success: bool,
    error: &'a Option<String>,
    error_code: &'a Option<String>,
    metadata: &'a BTreeMap<String, String>,
}

impl AuditLogEntry {
    pub(crate) fn unsigned(id: String, sequence: u64, timestamp: u64, record: AuditRecord) -> Self {
        Self {
            id,
            sequence,
            timestamp,
            actor_id: record.actor.actor_id,
            actor_role: record.actor.role,
            action: record.action,
            resource_type: record.resource_type,
            resource_id: record.resource_id,
            details: record.details,
            ip_address: record.actor.ip_address,
            user_agent: record.actor.user_agent,
            session_id: record.actor.session_id,
            success: record.success,
            error: record.error,
            error_code: record.error_code,
            metadata: record.metadata,
            signature: String::new(),
            chain_hash: String::new(),
        }
    }

    /// SHA-256 over the canonical JSON form of every field except the
    /// signature and chain hash.
    pub fn signing_digest(&self) -> Result<[u8; 32]> {
        let canonical = CanonicalEntry {
            id: &self.id,
            sequence: self.sequence,
            timestamp: self.timestamp,
            actor_id: &self.actor_id,
            actor_role: &self.actor_role,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: &self.resource_id,
            details: &self.details,
            ip_address: &self.ip_address,
            user_agent: &self.user_agent,
            session_id: &self.session_id,
            success: self.success,
            error: &self.error,
            error_code: &self.error_code,
            metadata: &self.metadata,
        };
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(Sha256::digest(&bytes).into())
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.signature).map_err(|e| anyhow!("entry {} signature hex: {}", self.id, e))
    }

    pub fn chain_hash_bytes(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.chain_hash)
            .map_err(|e| anyhow!("entry {} chain hash hex: {}", self.id, e))?;
        crate::blob32(bytes, "audit chain hash")
    }
}

/// chain_n = SHA-256(chain_{n-1} || id || timestamp || signature)
pub fn compute_chain_hash(prev: &[u8; 32], id: &str, timestamp: u64, signature: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev);
    hasher.update(id.as_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(signature);
    hasher.finalize().into()
}

/// Signed record of the chain head taken before older entries are pruned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCheckpoint {
    pub created_at: u64,
    pub cutoff_sequence: u64,
    pub chain_head: String,
    pub signature: String,
}

impl AuditCheckpoint {
    pub fn digest(cutoff_sequence: u64, chain_head: &[u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(cutoff_sequence.to_be_bytes());
        hasher.update(chain_head);
        hasher.finalize().into()
    }

    pub fn chain_head_bytes(&self) -> Result<[u8; 32]> {
        let bytes =
            hex::decode(&self.chain_head).map_err(|e| anyhow!("checkpoint head hex: {}", e))?;
        crate::blob32(bytes, "checkpoint chain head")
    }
}

/// Query over stored entries. Empty fields match everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub from_timestamp: Option<u64>,
    pub to_timestamp: Option<u64>,
    pub from_sequence: Option<u64>,
    pub to_sequence: Option<u64>,
    pub actor_id: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<ResourceType>,
    pub resource_id: Option<String>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.from_timestamp.map_or(true, |t| entry.timestamp >= t)
            && self.to_timestamp.map_or(true, |t| entry.timestamp <= t)
            && self.from_sequence.map_or(true, |s| entry.sequence >= s)
            && self.to_sequence.map_or(true, |s| entry.sequence <= s)
            && self.actor_id.as_deref().map_or(true, |a| entry.actor_id == a)
            && self.action.map_or(true, |a| entry.action == a)
            && self.resource_type.map_or(true, |r| entry.resource_type == r)
            && self
                .resource_id
                .as_deref()
                .map_or(true, |r| entry.resource_id == r)
    }
}
