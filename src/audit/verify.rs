use anyhow::Result;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use super::entry::{compute_chain_hash, AuditCheckpoint, AuditLogEntry, GENESIS_CHAIN_HASH};
use crate::crypto::signatures::{verify_with_domain, DOMAIN_AUDIT_CHECKPOINT, DOMAIN_AUDIT_ENTRY};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidEntry {
    pub id: String,
    pub sequence: u64,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub invalid_entries: Vec<InvalidEntry>,
    pub broken_chain: bool,
    pub first_broken_sequence: Option<u64>,
    pub from_checkpoint: bool,
}

impl IntegrityReport {
    pub fn is_valid(&self) -> bool {
        !self.broken_chain && self.invalid_entries.is_empty()
    }
}

/// Inclusive sequence range to report on. Replay always starts at genesis or
/// the latest checkpoint regardless of the range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerifyRange {
    pub from_sequence: Option<u64>,
    pub to_sequence: Option<u64>,
}

impl VerifyRange {
    pub fn all() -> Self {
        Self::default()
    }

    fn contains(&self, sequence: u64) -> bool {
        self.from_sequence.map_or(true, |s| sequence >= s)
            && self.to_sequence.map_or(true, |s| sequence <= s)
    }
}

/// Replay the chain and check every signature, link and sequence number.
///
/// Once a link fails, every later entry is flagged too: its chain hash can
/// no longer be tied back to a trusted head.
pub fn verify_chain(
    entries: &[AuditLogEntry],
    checkpoint: Option<&AuditCheckpoint>,
    verifying_key: &VerifyingKey,
    range: VerifyRange,
) -> IntegrityReport {
    let mut report = IntegrityReport {
        from_checkpoint: checkpoint.is_some(),
        ..IntegrityReport::default()
    };

    let (mut prev, mut expected_sequence, mut broken_reason) = match checkpoint {
        Some(cp) => match verify_checkpoint(cp, verifying_key) {
            Ok(head) => (head, cp.cutoff_sequence + 1, None),
            Err(e) => (
                GENESIS_CHAIN_HASH,
                cp.cutoff_sequence + 1,
                Some(format!("checkpoint invalid: {}", e)),
            ),
        },
        None => (GENESIS_CHAIN_HASH, 1, None),
    };

    let checkpoint_broken = broken_reason.is_some();

    for entry in entries {
        let failure = match &broken_reason {
            Some(reason) => Some(format!("follows broken link ({})", reason)),
            None => check_entry(entry, &prev, expected_sequence, verifying_key).err(),
        };

        if let Some(reason) = failure {
            if broken_reason.is_none() {
                broken_reason = Some(format!("sequence {}: {}", entry.sequence, reason));
                report.first_broken_sequence = Some(entry.sequence);
            } else if report.first_broken_sequence.is_none() {
                report.first_broken_sequence = Some(entry.sequence);
            }
            if range.contains(entry.sequence) {
                report.invalid_entries.push(InvalidEntry {
                    id: entry.id.clone(),
                    sequence: entry.sequence,
                    reason,
                });
            }
        }

        if range.contains(entry.sequence) {
            report.checked += 1;
        }
        if let Ok(hash) = entry.chain_hash_bytes() {
            prev = hash;
        }
        expected_sequence = entry.sequence + 1;
    }

    report.broken_chain = match (report.first_broken_sequence, range.to_sequence) {
        (Some(first), Some(to)) => first <= to,
        (Some(_), None) => true,
        (None, _) => false,
    } || checkpoint_broken;
    report
}

fn check_entry(
    entry: &AuditLogEntry,
    prev: &[u8; 32],
    expected_sequence: u64,
    verifying_key: &VerifyingKey,
) -> std::result::Result<(), String> {
    if entry.sequence != expected_sequence {
        return Err(format!(
            "sequence gap: expected {}, found {}",
            expected_sequence, entry.sequence
        ));
    }
    let digest = entry.signing_digest().map_err(|e| e.to_string())?;
    let signature = entry.signature_bytes().map_err(|e| e.to_string())?;
    verify_with_domain(DOMAIN_AUDIT_ENTRY, verifying_key, &digest, &signature)
        .map_err(|e| e.to_string())?;
    let stored = entry.chain_hash_bytes().map_err(|e| e.to_string())?;
    let expected = compute_chain_hash(prev, &entry.id, entry.timestamp, &signature);
    if stored != expected {
        return Err("chain hash mismatch".to_string());
    }
    Ok(())
}

fn verify_checkpoint(checkpoint: &AuditCheckpoint, verifying_key: &VerifyingKey) -> Result<[u8; 32]> {
    let head = checkpoint.chain_head_bytes()?;
    let digest = AuditCheckpoint::digest(checkpoint.cutoff_sequence, &head);
    let signature = hex::decode(&checkpoint.signature)?;
    verify_with_domain(DOMAIN_AUDIT_CHECKPOINT, verifying_key, &digest, &signature)?;
    Ok(head)
}
