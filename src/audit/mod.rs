//! Tamper-evident audit log.
//!
//! Every entry is signed with the audit Ed25519 key and linked to its
//! predecessor by a chain hash. Appends go through a single cursor lock so
//! the chain never branches; reads go straight to the store.

use anyhow::{anyhow, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::crypto::random_id;
use crate::crypto::signatures::{sign_with_domain, DOMAIN_AUDIT_CHECKPOINT, DOMAIN_AUDIT_ENTRY};
use crate::error::{custody_err, ErrorKind};

pub mod compliance;
pub mod entry;
pub mod export;
pub mod store;
pub mod verify;

pub use compliance::{
    derive_events, ComplianceDraft, ComplianceEvent, ComplianceEventType, ComplianceFilter,
    ComplianceReporter, LogComplianceReporter, Severity,
};
pub use entry::{
    compute_chain_hash, ActorContext, AuditAction, AuditCheckpoint, AuditFilter, AuditLogEntry,
    AuditRecord, ResourceType, GENESIS_CHAIN_HASH,
};
pub use export::ExportFormat;
pub use store::{AuditStore, ChainCursor, InMemoryAuditStore, SqliteAuditStore};
pub use verify::{verify_chain, IntegrityReport, InvalidEntry, VerifyRange};

pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    signing_key: SigningKey,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ComplianceReporter>,
    cursor: Mutex<ChainCursor>,
}

impl AuditLog {
    pub fn open(
        store: Arc<dyn AuditStore>,
        signing_key: SigningKey,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ComplianceReporter>,
    ) -> Result<Self> {
        store.store_verifying_key(&signing_key.verifying_key().to_bytes())?;
        let cursor = store.chain_cursor()?;
        log::debug!(
            "audit log opened at sequence {} head {}",
            cursor.next_sequence,
            hex::encode(cursor.last_chain_hash)
        );
        Ok(Self {
            store,
            signing_key,
            clock,
            reporter,
            cursor: Mutex::new(cursor),
        })
    }

    /// Ephemeral log backed by memory, the system clock and the log reporter.
    pub fn in_memory(signing_key: SigningKey) -> Result<Self> {
        Self::open(
            Arc::new(InMemoryAuditStore::new()),
            signing_key,
            Arc::new(SystemClock),
            Arc::new(LogComplianceReporter),
        )
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Sign, chain and append one entry, then derive its compliance events.
    pub fn log_action(&self, record: AuditRecord) -> Result<AuditLogEntry> {
        let entry = {
            let mut cursor = self
                .cursor
                .lock()
                .map_err(|_| anyhow!("audit cursor lock poisoned"))?;
            let mut entry = AuditLogEntry::unsigned(
                random_id("audit"),
                cursor.next_sequence,
                self.clock.now_s(),
                record,
            );
            let digest = entry.signing_digest()?;
            let signature = sign_with_domain(DOMAIN_AUDIT_ENTRY, &self.signing_key, &digest);
            let chain_hash =
                compute_chain_hash(&cursor.last_chain_hash, &entry.id, entry.timestamp, &signature);
            entry.signature = hex::encode(signature);
            entry.chain_hash = hex::encode(chain_hash);

            self.store.append_entry(&entry)?;
            cursor.last_chain_hash = chain_hash;
            cursor.next_sequence += 1;
            entry
        };

        if !entry.success {
            log::warn!(
                "audit: {} {} {}:{} failed: {}",
                entry.actor_id,
                entry.action,
                entry.resource_type,
                entry.resource_id,
                entry.error.as_deref().unwrap_or("unknown error")
            );
        }

        for draft in derive_events(&entry) {
            self.persist_compliance(&entry.id, draft)?;
        }
        Ok(entry)
    }

    /// Log the outcome of an operation: the success record built by
    /// `on_success`, or the record marked failed. The operation's own error
    /// is returned unchanged; if the append fails, that error wins.
    pub fn record_outcome<T>(
        &self,
        record: AuditRecord,
        result: Result<T>,
        on_success: impl FnOnce(AuditRecord, &T) -> AuditRecord,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                self.log_action(on_success(record, &value))?;
                Ok(value)
            }
            Err(err) => {
                self.log_action(record.failed(&err))?;
                Err(err)
            }
        }
    }

    /// Record a compliance event raised by a service rather than derived
    /// from an entry pattern.
    pub fn record_compliance_event(
        &self,
        audit_entry_id: &str,
        draft: ComplianceDraft,
    ) -> Result<ComplianceEvent> {
        self.persist_compliance(audit_entry_id, draft)
    }

    fn persist_compliance(
        &self,
        audit_entry_id: &str,
        draft: ComplianceDraft,
    ) -> Result<ComplianceEvent> {
        let mut event = ComplianceEvent {
            id: random_id("ce"),
            audit_entry_id: audit_entry_id.to_string(),
            event_type: draft.event_type,
            severity: draft.severity,
            description: draft.description,
            affected_resources: draft.affected_resources,
            frameworks: draft.frameworks,
            reporting_required: draft.reporting_required,
            created_at: self.clock.now_s(),
            reported_at: None,
        };
        self.store.append_compliance_event(&event)?;

        if event.needs_immediate_report() {
            match self.reporter.report(&event) {
                Ok(()) => {
                    let reported_at = self.clock.now_s();
                    self.store.mark_reported(&event.id, reported_at)?;
                    event.reported_at = Some(reported_at);
                }
                Err(e) => {
                    log::error!("compliance event {} could not be reported: {}", event.id, e);
                }
            }
        }
        Ok(event)
    }

    /// Replay the stored chain and report every entry that fails to verify.
    /// The verification itself is logged; a broken chain raises a critical
    /// integrity violation.
    pub fn verify_integrity(
        &self,
        range: VerifyRange,
        actor: &ActorContext,
    ) -> Result<IntegrityReport> {
        let checkpoint = self.store.latest_checkpoint()?;
        let entries = self.store.entries(&AuditFilter::default())?;
        let report = verify_chain(&entries, checkpoint.as_ref(), &self.verifying_key(), range);

        let mut record = AuditRecord::new(
            actor,
            AuditAction::Verify,
            ResourceType::AuditLog,
            "audit_log",
            format!(
                "verified {} entries, {} invalid",
                report.checked,
                report.invalid_entries.len()
            ),
        )
        .meta("checked", report.checked)
        .meta("invalid", report.invalid_entries.len());
        if report.broken_chain {
            let first = report.first_broken_sequence.unwrap_or_default();
            record = record.failed(&custody_err(
                ErrorKind::ChainBroken,
                format!("audit chain broken at sequence {}", first),
            ));
        }
        let verify_entry = self.log_action(record)?;

        if report.broken_chain {
            self.record_compliance_event(
                &verify_entry.id,
                ComplianceDraft {
                    event_type: ComplianceEventType::IntegrityViolation,
                    severity: Severity::Critical,
                    description: format!(
                        "audit chain broken; {} entries invalid",
                        report.invalid_entries.len()
                    ),
                    affected_resources: report
                        .invalid_entries
                        .iter()
                        .map(|e| format!("audit_entry:{}", e.id))
                        .collect(),
                    frameworks: vec!["SOC2".to_string()],
                    reporting_required: true,
                },
            )?;
        }
        Ok(report)
    }

    /// Render matching entries and log the export. The document is only
    /// returned once the export itself is on the chain.
    pub fn export(
        &self,
        format: ExportFormat,
        filter: &AuditFilter,
        actor: &ActorContext,
    ) -> Result<String> {
        let entries = self.store.entries(filter)?;
        let record = AuditRecord::new(
            actor,
            AuditAction::Export,
            ResourceType::AuditLog,
            "audit_log",
            format!("exported {} entries as {}", entries.len(), format.as_str()),
        )
        .meta("format", format.as_str())
        .meta("count", entries.len());

        match export::render(&entries, format) {
            Ok(document) => {
                self.log_action(record)?;
                Ok(document)
            }
            Err(e) => {
                self.log_action(record.failed(&e))?;
                Err(e)
            }
        }
    }

    /// Checkpoint the chain at the newest entry older than `retention` and
    /// prune everything up to it. Returns the number of pruned entries.
    pub fn enforce_retention(&self, retention: Duration, actor: &ActorContext) -> Result<usize> {
        let pruned = {
            let _cursor = self
                .cursor
                .lock()
                .map_err(|_| anyhow!("audit cursor lock poisoned"))?;
            let now = self.clock.now_s();
            let cutoff = now.saturating_sub(retention.as_secs());
            if cutoff == 0 {
                return Ok(0);
            }
            let old = self.store.entries(&AuditFilter {
                to_timestamp: Some(cutoff - 1),
                ..AuditFilter::default()
            })?;
            let Some(last) = old.last() else {
                return Ok(0);
            };
            let head = last.chain_hash_bytes()?;
            let digest = AuditCheckpoint::digest(last.sequence, &head);
            let signature = sign_with_domain(DOMAIN_AUDIT_CHECKPOINT, &self.signing_key, &digest);
            let checkpoint = AuditCheckpoint {
                created_at: now,
                cutoff_sequence: last.sequence,
                chain_head: hex::encode(head),
                signature: hex::encode(signature),
            };
            self.store.checkpoint_and_prune(&checkpoint)?
        };

        log::info!("audit retention pruned {} entries", pruned);
        self.log_action(
            AuditRecord::new(
                actor,
                AuditAction::Delete,
                ResourceType::AuditLog,
                "audit_log",
                format!("retention checkpoint pruned {} entries", pruned),
            )
            .meta("retention_s", retention.as_secs())
            .meta("pruned", pruned),
        )?;
        Ok(pruned)
    }

    pub fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>> {
        self.store.entries(filter)
    }

    pub fn compliance_events(&self, filter: &ComplianceFilter) -> Result<Vec<ComplianceEvent>> {
        self.store.compliance_events(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    struct Recording(Mutex<Vec<String>>);

    impl ComplianceReporter for Recording {
        fn report(&self, event: &ComplianceEvent) -> Result<()> {
            self.0
                .lock()
                .map_err(|_| anyhow!("poisoned"))?
                .push(event.id.clone());
            Ok(())
        }
    }

    fn fixture() -> Result<(AuditLog, Arc<InMemoryAuditStore>, Arc<ManualClock>, Arc<Recording>)> {
        let store = Arc::new(InMemoryAuditStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let reporter = Arc::new(Recording(Mutex::new(Vec::new())));
        let log = AuditLog::open(
            store.clone(),
            SigningKey::from_bytes(&[7u8; 32]),
            clock.clone(),
            reporter.clone(),
        )?;
        Ok((log, store, clock, reporter))
    }

    fn record(action: AuditAction, resource_type: ResourceType) -> AuditRecord {
        AuditRecord::new(
            &ActorContext::new("alice", "admin"),
            action,
            resource_type,
            "r-1",
            "test",
        )
    }

    #[test]
    fn entries_are_sequenced_and_chained() -> Result<()> {
        let (log, _, _, _) = fixture()?;
        let first = log.log_action(record(AuditAction::Create, ResourceType::MasterKey))?;
        let second = log.log_action(record(AuditAction::Read, ResourceType::Document))?;
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        let sig = second.signature_bytes()?;
        let expected =
            compute_chain_hash(&first.chain_hash_bytes()?, &second.id, second.timestamp, &sig);
        assert_eq!(second.chain_hash_bytes()?, expected);
        Ok(())
    }

    #[test]
    fn concurrent_writers_share_one_gapless_chain() -> Result<()> {
        let (log, _, _, _) = fixture()?;
        let writer_log = &log;
        std::thread::scope(|scope| {
            let writers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(move || -> Result<()> {
                        for _ in 0..25 {
                            writer_log.log_action(record(AuditAction::Update, ResourceType::Document))?;
                        }
                        Ok(())
                    })
                })
                .collect();
            for writer in writers {
                writer.join().map_err(|_| anyhow!("writer panicked"))??;
            }
            Ok::<(), anyhow::Error>(())
        })?;

        let sequences: Vec<u64> = log
            .entries(&AuditFilter::default())?
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, (1..=200).collect::<Vec<u64>>());
        let report = log.verify_integrity(VerifyRange::all(), &ActorContext::system())?;
        assert_eq!(report.checked, 200);
        assert!(report.is_valid(), "{:?}", report);
        Ok(())
    }

    #[test]
    fn critical_incidents_are_reported_immediately() -> Result<()> {
        let (log, _, _, reporter) = fixture()?;
        let err = custody_err(ErrorKind::IntegrityViolation, "tag mismatch");
        log.log_action(record(AuditAction::Decrypt, ResourceType::Evidence).failed(&err))?;
        let events = log.compliance_events(&ComplianceFilter::default())?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Critical);
        assert!(events[0].reported_at.is_some());
        assert_eq!(reporter.0.lock().map_err(|_| anyhow!("poisoned"))?.len(), 1);
        Ok(())
    }

    #[test]
    fn tampered_entry_breaks_chain_from_that_point() -> Result<()> {
        let (log, store, _, _) = fixture()?;
        for _ in 0..5 {
            log.log_action(record(AuditAction::Update, ResourceType::Document))?;
        }
        store.tamper_with(3, |e| e.details = "rewritten".into())?;
        let report = log.verify_integrity(VerifyRange::all(), &ActorContext::system())?;
        assert!(report.broken_chain);
        let flagged: Vec<u64> = report.invalid_entries.iter().map(|e| e.sequence).collect();
        assert_eq!(flagged, vec![3, 4, 5]);
        let incidents = log.compliance_events(&ComplianceFilter {
            event_type: Some(ComplianceEventType::IntegrityViolation),
            ..ComplianceFilter::default()
        })?;
        assert_eq!(incidents.len(), 1);
        Ok(())
    }

    #[test]
    fn retention_checkpoint_keeps_chain_verifiable() -> Result<()> {
        let (log, _, clock, _) = fixture()?;
        for _ in 0..3 {
            log.log_action(record(AuditAction::Update, ResourceType::Document))?;
        }
        clock.advance(10 * crate::clock::SECS_PER_DAY);
        log.log_action(record(AuditAction::Update, ResourceType::Document))?;
        let pruned = log.enforce_retention(
            Duration::from_secs(5 * crate::clock::SECS_PER_DAY),
            &ActorContext::system(),
        )?;
        assert_eq!(pruned, 3);
        let report = log.verify_integrity(VerifyRange::all(), &ActorContext::system())?;
        assert!(report.from_checkpoint);
        assert!(report.is_valid(), "{:?}", report);
        Ok(())
    }

    #[test]
    fn export_is_itself_logged() -> Result<()> {
        let (log, _, _, _) = fixture()?;
        log.log_action(record(AuditAction::Create, ResourceType::MasterKey))?;
        let doc = log.export(
            ExportFormat::Csv,
            &AuditFilter::default(),
            &ActorContext::new("auditor", "auditor"),
        )?;
        assert!(doc.starts_with("sequence,id,timestamp"));
        let exports = log.entries(&AuditFilter {
            action: Some(AuditAction::Export),
            ..AuditFilter::default()
        })?;
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].actor_id, "auditor");
        Ok(())
    }
}
