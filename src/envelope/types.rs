use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::audit::ResourceType;
use crate::crypto::aead::Algorithm;
use crate::kms::{EncryptedPayload, KeyPurpose};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopePurpose {
    Evidence,
    Pii,
    Document,
    Backup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Public => "public",
            Classification::Internal => "internal",
            Classification::Confidential => "confidential",
            Classification::Restricted => "restricted",
        }
    }
}

/// Per-purpose encryption defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PurposeDefaults {
    pub compress: bool,
    pub integrity: bool,
    pub classification: Classification,
    pub retention_days: u32,
    pub key_alias: &'static str,
    pub rotation_interval_days: u32,
}

impl EnvelopePurpose {
    pub const ALL: [EnvelopePurpose; 4] = [
        EnvelopePurpose::Evidence,
        EnvelopePurpose::Pii,
        EnvelopePurpose::Document,
        EnvelopePurpose::Backup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopePurpose::Evidence => "evidence",
            EnvelopePurpose::Pii => "pii",
            EnvelopePurpose::Document => "document",
            EnvelopePurpose::Backup => "backup",
        }
    }

    pub fn defaults(self) -> PurposeDefaults {
        match self {
            EnvelopePurpose::Evidence => PurposeDefaults {
                compress: true,
                integrity: true,
                classification: Classification::Restricted,
                retention_days: 2555,
                key_alias: "evidence-key",
                rotation_interval_days: 365,
            },
            EnvelopePurpose::Pii => PurposeDefaults {
                compress: false,
                integrity: true,
                classification: Classification::Confidential,
                retention_days: 1095,
                key_alias: "pii-key",
                rotation_interval_days: 90,
            },
            EnvelopePurpose::Document => PurposeDefaults {
                compress: true,
                integrity: false,
                classification: Classification::Internal,
                retention_days: 1825,
                key_alias: "document-key",
                rotation_interval_days: 180,
            },
            EnvelopePurpose::Backup => PurposeDefaults {
                compress: true,
                integrity: true,
                classification: Classification::Restricted,
                retention_days: 365,
                key_alias: "backup-key",
                rotation_interval_days: 365,
            },
        }
    }

    pub fn resource_type(self) -> ResourceType {
        match self {
            EnvelopePurpose::Evidence => ResourceType::Evidence,
            EnvelopePurpose::Pii => ResourceType::Pii,
            EnvelopePurpose::Document => ResourceType::Document,
            EnvelopePurpose::Backup => ResourceType::Backup,
        }
    }

    pub fn key_purpose(self) -> KeyPurpose {
        match self {
            EnvelopePurpose::Evidence => KeyPurpose::Evidence,
            EnvelopePurpose::Pii => KeyPurpose::Pii,
            EnvelopePurpose::Document => KeyPurpose::Document,
            EnvelopePurpose::Backup => KeyPurpose::Backup,
        }
    }
}

impl std::str::FromStr for EnvelopePurpose {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "evidence" => Ok(EnvelopePurpose::Evidence),
            "pii" => Ok(EnvelopePurpose::Pii),
            "document" => Ok(EnvelopePurpose::Document),
            "backup" => Ok(EnvelopePurpose::Backup),
            other => Err(anyhow!("unknown envelope purpose: {}", other)),
        }
    }
}

/// Caller overrides for a single encryption. Unset fields take the purpose
/// defaults.
#[derive(Clone, Debug, Default)]
pub struct EncryptOptions {
    pub master_key_alias: Option<String>,
    pub compress: Option<bool>,
    pub integrity: Option<bool>,
    pub classification: Option<Classification>,
    pub retention_days: Option<u32>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub purpose: EnvelopePurpose,
    pub classification: Classification,
    pub retention_days: u32,
    pub original_size: u64,
    pub encrypted_size: u64,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub id: String,
    pub data_key_id: String,
    pub master_key_id: String,
    pub algorithm: Algorithm,
    #[serde(skip)]
    pub ciphertext: Vec<u8>,
    #[serde(skip)]
    pub iv: Vec<u8>,
    #[serde(skip)]
    pub auth_tag: Vec<u8>,
    pub compressed: bool,
    /// SHA-256 hex of the compressed, pre-encryption bytes.
    pub integrity_hash: Option<String>,
    pub metadata: EnvelopeMetadata,
    pub created_by: String,
    pub created_at: u64,
    pub rotated_at: Option<u64>,
}

impl EncryptedEnvelope {
    pub fn payload(&self) -> EncryptedPayload {
        EncryptedPayload {
            data_key_id: self.data_key_id.clone(),
            master_key_id: self.master_key_id.clone(),
            algorithm: self.algorithm,
            ciphertext: self.ciphertext.clone(),
            iv: self.iv.clone(),
            auth_tag: self.auth_tag.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedData {
    pub data: Vec<u8>,
    pub integrity_verified: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencryptionReport {
    pub master_key_id: String,
    pub new_master_key_id: String,
    pub total: usize,
    pub rotated: usize,
    pub failed: Vec<crate::kms::ItemFailure>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegritySweepReport {
    pub checked: usize,
    pub passed: usize,
    /// Envelopes whose authentication tag or digest did not verify.
    pub failed: Vec<crate::kms::ItemFailure>,
    /// Envelopes that could not be checked at all (access, missing keys, storage).
    pub errors: Vec<crate::kms::ItemFailure>,
}

impl IntegritySweepReport {
    pub fn failed_ids(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.id.clone()).collect()
    }
}
