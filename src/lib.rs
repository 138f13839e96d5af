//! Custody Kernel
//!
//! Key custody and tamper-evident accountability for evidence, personal data
//! and live media.
//!
//! # Architecture
//!
//! - `kms`: master keys sealed under a root key wrap per-purpose data keys;
//!   rotation, scheduled deletion and destruction.
//! - `envelope`: per-item encryption of evidence, PII, documents and backups
//!   with optional compression and an integrity digest.
//! - `streaming`: HLS AES-128 key pipelines per live stream, timed and
//!   segment-count rotation, CDN key distribution and key delivery.
//! - `audit`: an Ed25519-signed, hash-chained action log with compliance
//!   event derivation, verification, export and retention checkpoints.
//!
//! Every service records its actions in the shared audit log and fails
//! closed: if the audit append fails, the operation fails and releases no key
//! material or plaintext.

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod audit;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod kms;
pub mod runtime;
pub mod streaming;
pub mod ui;
pub mod validate;

pub use audit::{ActorContext, AuditAction, AuditLog, AuditRecord, ResourceType};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CustodyConfig;
pub use envelope::{EnvelopeEncryptionService, EnvelopePurpose};
pub use error::{custody_err, error_kind, CustodyError, ErrorKind};
pub use kms::KeyManagementService;
pub use runtime::CustodyRuntime;
pub use streaming::StreamKeyRotationService;

/// A fresh shared-cache in-memory database URI. Every connection opened on
/// the same URI sees the same data, so the per-subsystem stores can share
/// one database in tests and in `:memory:` deployments.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:custody_kernel_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn blob32(bytes: Vec<u8>, context: &str) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!(
            "corrupt {}: expected 32 bytes, got {}",
            context,
            bytes.len()
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
