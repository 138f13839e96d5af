//! Envelope encryption for evidence, PII, documents and backups.
//!
//! Each envelope is encrypted under a KMS data key with the envelope id bound
//! in as associated data. Optional deflate compression runs before
//! encryption; the optional integrity hash covers the compressed bytes.

use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::audit::{
    ActorContext, AuditAction, AuditLog, AuditRecord, ComplianceDraft, ComplianceEventType,
    ResourceType, Severity,
};
use crate::clock::Clock;
use crate::crypto::sha256_hex;
use crate::error::{custody_err, error_kind, ErrorKind};
use crate::kms::{
    AccessPolicy, DestructionReport, ItemFailure, KeyManagementService, MasterKey, NewMasterKey,
};
use crate::validate::validate_identifier;

pub mod store;
pub mod types;

pub use store::{EnvelopeStore, InMemoryEnvelopeStore, SqliteEnvelopeStore};
pub use types::{
    Classification, DecryptedData, EncryptOptions, EncryptedEnvelope, EnvelopeMetadata,
    EnvelopePurpose, IntegritySweepReport, PurposeDefaults, ReencryptionReport,
};

#[derive(Clone, Debug)]
pub struct EnvelopeSettings {
    /// Deflate level, 0 (store) to 10.
    pub compression_level: u8,
    /// Roles granted on master keys created by `bootstrap_default_keys`.
    pub default_key_roles: BTreeSet<String>,
}

impl Default for EnvelopeSettings {
    fn default() -> Self {
        Self {
            compression_level: 6,
            default_key_roles: ["admin", "security_officer", "investigator", "system"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

pub struct EnvelopeEncryptionService {
    kms: Arc<KeyManagementService>,
    audit: Arc<AuditLog>,
    store: Mutex<Box<dyn EnvelopeStore + Send>>,
    clock: Arc<dyn Clock>,
    settings: EnvelopeSettings,
}

fn envelope_aad(id: &str) -> Vec<u8> {
    format!("envelope:{}", id).into_bytes()
}

fn compress(data: &[u8], level: u8) -> Vec<u8> {
    miniz_oxide::deflate::compress_to_vec(data, level.min(10))
}

fn decompress(data: &[u8], original_size: u64) -> Result<Vec<u8>> {
    let limit = usize::try_from(original_size)
        .map_err(|_| anyhow!("original size {} exceeds address space", original_size))?;
    let out = miniz_oxide::inflate::decompress_to_vec_with_limit(data, limit.saturating_add(1))
        .map_err(|e| {
            custody_err(
                ErrorKind::IntegrityViolation,
                format!("decompression failed: {:?}", e.status),
            )
        })?;
    if out.len() != limit {
        return Err(custody_err(
            ErrorKind::IntegrityViolation,
            format!(
                "decompressed size {} does not match recorded size {}",
                out.len(),
                original_size
            ),
        ));
    }
    Ok(out)
}

impl EnvelopeEncryptionService {
    pub fn new(
        kms: Arc<KeyManagementService>,
        audit: Arc<AuditLog>,
        store: Box<dyn EnvelopeStore + Send>,
        clock: Arc<dyn Clock>,
        settings: EnvelopeSettings,
    ) -> Self {
        Self {
            kms,
            audit,
            store: Mutex::new(store),
            clock,
            settings,
        }
    }

    fn store(&self) -> Result<MutexGuard<'_, Box<dyn EnvelopeStore + Send>>> {
        self.store
            .lock()
            .map_err(|_| anyhow!("envelope store lock poisoned"))
    }

    fn audited<T>(
        &self,
        record: AuditRecord,
        result: Result<T>,
        on_success: impl FnOnce(AuditRecord, &T) -> AuditRecord,
    ) -> Result<T> {
        self.audit.record_outcome(record, result, on_success)
    }

    fn load(&self, id: &str) -> Result<EncryptedEnvelope> {
        self.store()?.get(id)?.ok_or_else(|| {
            custody_err(
                ErrorKind::EnvelopeNotFound,
                format!("envelope {} not found", id),
            )
        })
    }

    // -------------------- Encrypt --------------------

    pub fn encrypt_evidence(
        &self,
        id: &str,
        data: &[u8],
        actor: &ActorContext,
        options: EncryptOptions,
    ) -> Result<EncryptedEnvelope> {
        self.encrypt(EnvelopePurpose::Evidence, id, data, actor, options)
    }

    pub fn encrypt_pii(
        &self,
        id: &str,
        data: &[u8],
        actor: &ActorContext,
        options: EncryptOptions,
    ) -> Result<EncryptedEnvelope> {
        self.encrypt(EnvelopePurpose::Pii, id, data, actor, options)
    }

    pub fn encrypt_document(
        &self,
        id: &str,
        data: &[u8],
        actor: &ActorContext,
        options: EncryptOptions,
    ) -> Result<EncryptedEnvelope> {
        self.encrypt(EnvelopePurpose::Document, id, data, actor, options)
    }

    pub fn encrypt_backup(
        &self,
        id: &str,
        data: &[u8],
        actor: &ActorContext,
        options: EncryptOptions,
    ) -> Result<EncryptedEnvelope> {
        self.encrypt(EnvelopePurpose::Backup, id, data, actor, options)
    }

    pub fn encrypt(
        &self,
        purpose: EnvelopePurpose,
        id: &str,
        data: &[u8],
        actor: &ActorContext,
        options: EncryptOptions,
    ) -> Result<EncryptedEnvelope> {
        let record = AuditRecord::new(
            actor,
            AuditAction::Encrypt,
            purpose.resource_type(),
            id,
            format!("encrypt {} envelope", purpose.as_str()),
        )
        .meta("original_size", data.len());
        let result = self.encrypt_inner(purpose, id, data, actor, options);
        self.audited(record, result, |r, env| {
            r.meta("master_key_id", &env.master_key_id)
                .meta("data_key_id", &env.data_key_id)
                .meta("compressed", env.compressed)
                .meta("classification", env.metadata.classification.as_str())
        })
    }

    fn encrypt_inner(
        &self,
        purpose: EnvelopePurpose,
        id: &str,
        data: &[u8],
        actor: &ActorContext,
        options: EncryptOptions,
    ) -> Result<EncryptedEnvelope> {
        validate_identifier("envelope", id)?;
        if self.store()?.get(id)?.is_some() {
            return Err(custody_err(
                ErrorKind::DuplicateEnvelope,
                format!("envelope {} already exists", id),
            ));
        }

        let defaults = purpose.defaults();
        let alias = options
            .master_key_alias
            .as_deref()
            .unwrap_or(defaults.key_alias);
        let master = self.kms.resolve_active_key(alias)?;

        let compressed = options.compress.unwrap_or(defaults.compress);
        let body = if compressed {
            compress(data, self.settings.compression_level)
        } else {
            data.to_vec()
        };
        let integrity_hash = options
            .integrity
            .unwrap_or(defaults.integrity)
            .then(|| sha256_hex(&body));

        let payload = self
            .kms
            .encrypt_data(&master.id, &body, &envelope_aad(id), actor)?;
        let envelope = EncryptedEnvelope {
            id: id.to_string(),
            data_key_id: payload.data_key_id,
            master_key_id: payload.master_key_id,
            algorithm: payload.algorithm,
            compressed,
            integrity_hash,
            metadata: EnvelopeMetadata {
                purpose,
                classification: options.classification.unwrap_or(defaults.classification),
                retention_days: options.retention_days.unwrap_or(defaults.retention_days),
                original_size: data.len() as u64,
                encrypted_size: payload.ciphertext.len() as u64,
                labels: options.labels,
            },
            ciphertext: payload.ciphertext,
            iv: payload.iv,
            auth_tag: payload.auth_tag,
            created_by: actor.actor_id.clone(),
            created_at: self.clock.now_s(),
            rotated_at: None,
        };
        self.store()?.insert(&envelope)?;
        log::debug!(
            "encrypted {} envelope {} ({} -> {} bytes)",
            purpose.as_str(),
            envelope.id,
            envelope.metadata.original_size,
            envelope.metadata.encrypted_size
        );
        Ok(envelope)
    }

    // -------------------- Decrypt --------------------

    /// Decrypt an evidence envelope. Envelopes of any other purpose are
    /// rejected.
    pub fn decrypt_evidence(
        &self,
        id: &str,
        actor: &ActorContext,
        verify_integrity: bool,
    ) -> Result<DecryptedData> {
        self.decrypt_as(id, Some(EnvelopePurpose::Evidence), actor, verify_integrity)
    }

    pub fn decrypt(
        &self,
        id: &str,
        actor: &ActorContext,
        verify_integrity: bool,
    ) -> Result<DecryptedData> {
        self.decrypt_as(id, None, actor, verify_integrity)
    }

    fn decrypt_as(
        &self,
        id: &str,
        expected: Option<EnvelopePurpose>,
        actor: &ActorContext,
        verify_integrity: bool,
    ) -> Result<DecryptedData> {
        let loaded = self.load(id);
        let resource_type = match (&loaded, expected) {
            (Ok(env), _) => env.metadata.purpose.resource_type(),
            (Err(_), Some(purpose)) => purpose.resource_type(),
            (Err(_), None) => ResourceType::Document,
        };
        let record = AuditRecord::new(
            actor,
            AuditAction::Decrypt,
            resource_type,
            id,
            "decrypt envelope",
        )
        .meta("verify_integrity", verify_integrity);

        let result = loaded.and_then(|env| {
            if let Some(purpose) = expected {
                if env.metadata.purpose != purpose {
                    return Err(custody_err(
                        ErrorKind::InvalidInput,
                        format!(
                            "envelope {} holds {} data, not {}",
                            env.id,
                            env.metadata.purpose.as_str(),
                            purpose.as_str()
                        ),
                    ));
                }
            }
            self.open_envelope(&env, actor, verify_integrity)
        });
        self.audited(record, result, |r, out| {
            r.meta("integrity_verified", out.integrity_verified)
                .meta("size", out.data.len())
        })
    }

    /// Authenticate, decrypt, verify and decompress one envelope. Nothing is
    /// returned unless every enabled check passes.
    fn open_envelope(
        &self,
        env: &EncryptedEnvelope,
        actor: &ActorContext,
        verify_integrity: bool,
    ) -> Result<DecryptedData> {
        let body = self
            .kms
            .decrypt_data(&env.payload(), &envelope_aad(&env.id), actor)?;

        let mut integrity_verified = false;
        if verify_integrity {
            if let Some(expected) = &env.integrity_hash {
                let actual = sha256_hex(&body);
                if &actual != expected {
                    log::error!("integrity hash mismatch on envelope {}", env.id);
                    return Err(custody_err(
                        ErrorKind::IntegrityViolation,
                        format!("integrity hash mismatch on envelope {}", env.id),
                    ));
                }
                integrity_verified = true;
            }
        }

        let data = if env.compressed {
            decompress(&body, env.metadata.original_size)?
        } else {
            body.to_vec()
        };
        Ok(DecryptedData {
            data,
            integrity_verified,
        })
    }

    // -------------------- Maintenance --------------------

    /// Re-encrypt every envelope stored under `master_key_id` with a fresh
    /// data key from the key's active successor. Each envelope is replaced
    /// atomically; failures are collected per envelope.
    pub fn rotate_data_keys(
        &self,
        master_key_id: &str,
        actor: &ActorContext,
    ) -> Result<ReencryptionReport> {
        let record = AuditRecord::new(
            actor,
            AuditAction::Rotate,
            ResourceType::DataKey,
            master_key_id,
            "re-encrypt envelopes under fresh data keys",
        );
        let result = self.rotate_data_keys_inner(master_key_id, actor);
        self.audited(record, result, |r, report| {
            r.meta("new_master_key_id", &report.new_master_key_id)
                .meta("total", report.total)
                .meta("rotated", report.rotated)
                .meta("failed", report.failed.len())
        })
    }

    fn rotate_data_keys_inner(
        &self,
        master_key_id: &str,
        actor: &ActorContext,
    ) -> Result<ReencryptionReport> {
        let target = self.kms.resolve_active_key(master_key_id)?;
        let ids = self.store()?.ids_for_master(master_key_id)?;
        let mut report = ReencryptionReport {
            master_key_id: master_key_id.to_string(),
            new_master_key_id: target.id.clone(),
            total: ids.len(),
            ..ReencryptionReport::default()
        };

        for id in ids {
            match self.reencrypt_one(&id, &target, actor) {
                Ok(()) => report.rotated += 1,
                Err(e) => {
                    log::warn!("re-encryption of envelope {} failed: {:#}", id, e);
                    report.failed.push(ItemFailure {
                        id,
                        error: format!("{:#}", e),
                    });
                }
            }
        }
        log::info!(
            "re-encrypted {}/{} envelopes from {} to {}",
            report.rotated,
            report.total,
            master_key_id,
            target.id
        );
        Ok(report)
    }

    fn reencrypt_one(&self, id: &str, target: &MasterKey, actor: &ActorContext) -> Result<()> {
        let env = self.load(id)?;
        let aad = envelope_aad(id);
        let body = self.kms.decrypt_data(&env.payload(), &aad, actor)?;
        let payload = self
            .kms
            .encrypt_data_with_new_key(&target.id, &body, &aad, actor)?;
        let mut replacement = env;
        replacement.data_key_id = payload.data_key_id;
        replacement.master_key_id = payload.master_key_id;
        replacement.algorithm = payload.algorithm;
        replacement.metadata.encrypted_size = payload.ciphertext.len() as u64;
        replacement.ciphertext = payload.ciphertext;
        replacement.iv = payload.iv;
        replacement.auth_tag = payload.auth_tag;
        replacement.rotated_at = Some(self.clock.now_s());
        self.store()?.replace(&replacement)
    }

    /// Decrypt and verify every stored envelope. Tampered envelopes raise a
    /// critical integrity violation that is reported immediately; envelopes
    /// that could not be checked raise a security incident instead.
    pub fn verify_all_integrity(&self, actor: &ActorContext) -> Result<IntegritySweepReport> {
        let ids = self.store()?.ids()?;
        let mut report = IntegritySweepReport::default();
        let mut denied = false;
        for id in ids {
            report.checked += 1;
            match self
                .load(&id)
                .and_then(|env| self.open_envelope(&env, actor, true))
            {
                Ok(_) => report.passed += 1,
                Err(e) => {
                    let failure = ItemFailure {
                        id: id.clone(),
                        error: format!("{:#}", e),
                    };
                    match error_kind(&e) {
                        Some(ErrorKind::IntegrityViolation) => {
                            log::error!("integrity sweep: envelope {} failed: {:#}", id, e);
                            report.failed.push(failure);
                        }
                        kind => {
                            log::warn!("integrity sweep: envelope {} not checked: {:#}", id, e);
                            denied |= kind == Some(ErrorKind::UnauthorizedAccess);
                            report.errors.push(failure);
                        }
                    }
                }
            }
        }

        let mut record = AuditRecord::new(
            actor,
            AuditAction::Verify,
            ResourceType::System,
            "envelopes",
            format!(
                "integrity sweep checked {}, {} failed, {} errors",
                report.checked,
                report.failed.len(),
                report.errors.len()
            ),
        )
        .meta("checked", report.checked)
        .meta("passed", report.passed)
        .meta("failed", report.failed.len())
        .meta("errors", report.errors.len());
        if !report.failed.is_empty() {
            record = record.failed(&custody_err(
                ErrorKind::IntegrityViolation,
                format!("{} envelopes failed integrity verification", report.failed.len()),
            ));
        }
        let entry = self.audit.log_action(record)?;

        if !report.failed.is_empty() {
            self.audit.record_compliance_event(
                &entry.id,
                ComplianceDraft {
                    event_type: ComplianceEventType::IntegrityViolation,
                    severity: Severity::Critical,
                    description: format!(
                        "{} of {} envelopes failed integrity verification",
                        report.failed.len(),
                        report.checked
                    ),
                    affected_resources: report
                        .failed
                        .iter()
                        .map(|f| format!("envelope:{}", f.id))
                        .collect(),
                    frameworks: vec!["CJIS".to_string(), "SOC2".to_string()],
                    reporting_required: true,
                },
            )?;
        }
        if !report.errors.is_empty() {
            self.audit.record_compliance_event(
                &entry.id,
                ComplianceDraft {
                    event_type: ComplianceEventType::SecurityIncident,
                    severity: if denied { Severity::High } else { Severity::Medium },
                    description: format!(
                        "{} of {} envelopes could not be checked during the integrity sweep",
                        report.errors.len(),
                        report.checked
                    ),
                    affected_resources: report
                        .errors
                        .iter()
                        .map(|f| format!("envelope:{}", f.id))
                        .collect(),
                    frameworks: vec!["SOC2".to_string()],
                    reporting_required: denied,
                },
            )?;
        }
        Ok(report)
    }

    /// Create the per-purpose default master keys that do not exist yet.
    pub fn bootstrap_default_keys(&self, actor: &ActorContext) -> Result<Vec<MasterKey>> {
        let mut created = Vec::new();
        for purpose in EnvelopePurpose::ALL {
            let defaults = purpose.defaults();
            if self.kms.master_key_by_alias(defaults.key_alias)?.is_some() {
                continue;
            }
            let key = self.kms.create_master_key(
                NewMasterKey {
                    alias: defaults.key_alias.to_string(),
                    purpose: purpose.key_purpose(),
                    algorithm: Default::default(),
                    rotation_interval_days: defaults.rotation_interval_days,
                    access_policy: AccessPolicy::roles(self.settings.default_key_roles.iter().cloned()),
                },
                actor,
            )?;
            log::info!("bootstrapped default {} key {}", purpose.as_str(), key.id);
            created.push(key);
        }
        Ok(created)
    }

    /// Destroy master keys whose deletion grace has elapsed, keeping any that
    /// still protect stored envelopes or used data keys.
    pub fn purge_deleted_keys(&self, actor: &ActorContext) -> Result<DestructionReport> {
        let dependents = |master_key_id: &str| -> Result<usize> {
            self.store()?.count_for_master(master_key_id)
        };
        self.kms.destroy_expired_keys(&dependents, actor)
    }

    // -------------------- Queries --------------------

    pub fn envelope(&self, id: &str) -> Result<EncryptedEnvelope> {
        self.load(id)
    }

    pub fn envelope_ids(&self) -> Result<Vec<String>> {
        self.store()?.ids()
    }

    pub fn envelope_ids_for_master(&self, master_key_id: &str) -> Result<Vec<String>> {
        self.store()?.ids_for_master(master_key_id)
    }
}
