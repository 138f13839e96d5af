//! Two-tier key hierarchy: master keys sealed under the root key wrap data
//! keys, and data keys encrypt payloads.
//!
//! Lifecycle operations (create, rotate, delete, destroy) are audited on
//! success and failure. Data operations are audited here only when they fail;
//! the calling service records the successful business action.

use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::Zeroizing;

use crate::audit::{ActorContext, AuditAction, AuditLog, AuditRecord, ResourceType};
use crate::clock::{Clock, SECS_PER_DAY};
use crate::crypto::aead::{self, Algorithm};
use crate::crypto::{random_id, RootKey};
use crate::error::{custody_err, error_kind, ErrorKind};
use crate::validate::validate_alias;

pub mod key;
pub mod store;

pub use key::{
    AccessPolicy, DataKey, DestructionReport, EncryptedPayload, ItemFailure, KeyPurpose,
    KeyStatus, MasterKey, RotationSummary, ScheduledRotationReport,
};
pub use store::{InMemoryKeyStore, KeyStore, SqliteKeyStore};

/// Master key material is always sealed with this cipher, independent of
/// the algorithm the master key itself uses.
const ROOT_SEAL_ALGORITHM: Algorithm = Algorithm::ChaCha20Poly1305;

/// Longest supersession chain followed when resolving a data key.
const MAX_SUPERSESSION_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub struct KmsSettings {
    pub data_key_max_uses: u64,
    pub min_deletion_grace_days: u32,
    pub admin_roles: BTreeSet<String>,
}

impl Default for KmsSettings {
    fn default() -> Self {
        Self {
            data_key_max_uses: 10_000,
            min_deletion_grace_days: 7,
            admin_roles: ["admin", "security_officer", "system"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Parameters for [`KeyManagementService::create_master_key`].
#[derive(Clone, Debug)]
pub struct NewMasterKey {
    pub alias: String,
    pub purpose: KeyPurpose,
    pub algorithm: Algorithm,
    pub rotation_interval_days: u32,
    pub access_policy: AccessPolicy,
}

pub struct KeyManagementService {
    store: Mutex<Box<dyn KeyStore + Send>>,
    root: RootKey,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    settings: KmsSettings,
}

impl KeyManagementService {
    pub fn new(
        store: Box<dyn KeyStore + Send>,
        root: RootKey,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        settings: KmsSettings,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            root,
            audit,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &KmsSettings {
        &self.settings
    }

    fn store(&self) -> Result<MutexGuard<'_, Box<dyn KeyStore + Send>>> {
        self.store
            .lock()
            .map_err(|_| anyhow!("key store lock poisoned"))
    }

    /// Fail-closed: an operation whose audit record cannot be written fails.
    fn audited<T>(
        &self,
        record: AuditRecord,
        result: Result<T>,
        on_success: impl FnOnce(AuditRecord, &T) -> AuditRecord,
    ) -> Result<T> {
        self.audit.record_outcome(record, result, on_success)
    }

    /// Log a failure only; successes pass through untouched.
    fn audited_failure<T>(&self, record: AuditRecord, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.audit.log_action(record.failed(err))?;
        }
        result
    }

    fn require_admin(&self, actor: &ActorContext, operation: &str) -> Result<()> {
        if self.settings.admin_roles.contains(&actor.role) {
            return Ok(());
        }
        Err(custody_err(
            ErrorKind::UnauthorizedAccess,
            format!(
                "role {} may not {} master keys",
                actor.role, operation
            ),
        ))
    }

    fn require_policy(key: &MasterKey, actor: &ActorContext) -> Result<()> {
        if key.access_policy.allows(&actor.role) {
            return Ok(());
        }
        Err(custody_err(
            ErrorKind::UnauthorizedAccess,
            format!("role {} is not authorized for key {}", actor.role, key.alias),
        ))
    }

    fn load_master(store: &dyn KeyStore, id: &str) -> Result<MasterKey> {
        store
            .master_key(id)?
            .ok_or_else(|| custody_err(ErrorKind::KeyNotFound, format!("master key {} not found", id)))
    }

    fn seal_material(&self, key_id: &str, material: &[u8]) -> Result<Vec<u8>> {
        aead::wrap_key(ROOT_SEAL_ALGORITHM, self.root.as_bytes(), key_id, material)
    }

    fn unseal_material(&self, key: &MasterKey) -> Result<Zeroizing<Vec<u8>>> {
        if !key.status.can_unwrap() || key.sealed_material.is_empty() {
            return Err(custody_err(
                ErrorKind::InvalidStateTransition,
                format!("master key {} material has been destroyed", key.id),
            ));
        }
        aead::unwrap_key(ROOT_SEAL_ALGORITHM, self.root.as_bytes(), &key.id, &key.sealed_material)
    }

    fn issue_data_key(&self, store: &mut dyn KeyStore, master: &MasterKey) -> Result<DataKey> {
        let material = self.unseal_material(master)?;
        let id = random_id("dk");
        let dek = aead::random_key();
        let key = DataKey {
            wrapped_key: aead::wrap_key(master.algorithm, &material, &id, &dek[..])?,
            id,
            master_key_id: master.id.clone(),
            created_at: self.clock.now_s(),
            usage_count: 0,
            supersedes: None,
            superseded_by: None,
        };
        store.insert_data_key(&key)?;
        log::debug!("issued data key {} under {}", key.id, master.alias);
        Ok(key)
    }

    // -------------------- Lifecycle --------------------

    pub fn create_master_key(&self, spec: NewMasterKey, actor: &ActorContext) -> Result<MasterKey> {
        let record = AuditRecord::new(
            actor,
            AuditAction::Create,
            ResourceType::MasterKey,
            spec.alias.clone(),
            format!("create {} master key {}", spec.purpose.as_str(), spec.alias),
        )
        .meta("alias", &spec.alias)
        .meta("purpose", spec.purpose.as_str())
        .meta("algorithm", spec.algorithm);
        let result = self.create_master_key_inner(spec, actor);
        self.audited(record, result, |r, key| r.meta("key_id", &key.id))
    }

    fn create_master_key_inner(&self, spec: NewMasterKey, actor: &ActorContext) -> Result<MasterKey> {
        self.require_admin(actor, "create")?;
        validate_alias(&spec.alias)?;
        if spec.rotation_interval_days == 0 {
            return Err(custody_err(
                ErrorKind::InvalidInput,
                "rotation interval must be at least one day",
            ));
        }
        let mut store = self.store()?;
        if store.master_key_by_alias(&spec.alias)?.is_some() {
            return Err(custody_err(
                ErrorKind::DuplicateAlias,
                format!("alias {} is already in use", spec.alias),
            ));
        }
        let now = self.clock.now_s();
        let id = random_id("mk");
        let material = aead::random_key();
        let key = MasterKey {
            sealed_material: self.seal_material(&id, &material[..])?,
            id,
            alias: spec.alias,
            purpose: spec.purpose,
            algorithm: spec.algorithm,
            status: KeyStatus::Active,
            version: 1,
            created_at: now,
            last_rotated_at: None,
            next_rotation_at: now + u64::from(spec.rotation_interval_days) * SECS_PER_DAY,
            rotation_interval_days: spec.rotation_interval_days,
            access_policy: spec.access_policy,
            predecessor_id: None,
            successor_id: None,
            deletion_date: None,
            requires_migration: false,
        };
        store.insert_master_key(&key)?;
        log::info!("created master key {} ({})", key.alias, key.id);
        Ok(key)
    }

    /// Rotate a master key: issue (or reuse) its successor and re-wrap every
    /// data key still wrapped under it. Safe to call again after a partial
    /// failure; only unmigrated data keys are touched.
    pub fn rotate_master_key(&self, master_key_id: &str, actor: &ActorContext) -> Result<RotationSummary> {
        let record = AuditRecord::new(
            actor,
            AuditAction::Rotate,
            ResourceType::MasterKey,
            master_key_id,
            "rotate master key",
        );
        let result = self.rotate_master_key_inner(master_key_id, actor);
        self.audited(record, result, |r, summary| {
            r.meta("new_key_id", &summary.new_key_id)
                .meta("rotated_count", summary.rotated_count)
                .meta("failed_count", summary.failed.len())
                .meta("requires_migration", summary.requires_migration)
        })
    }

    fn rotate_master_key_inner(&self, master_key_id: &str, actor: &ActorContext) -> Result<RotationSummary> {
        self.require_admin(actor, "rotate")?;
        let mut store = self.store()?;
        let mut old = Self::load_master(&**store, master_key_id)?;
        if !matches!(old.status, KeyStatus::Active | KeyStatus::Rotating) {
            return Err(custody_err(
                ErrorKind::InvalidStateTransition,
                format!(
                    "master key {} is {} and cannot be rotated",
                    old.id,
                    old.status.as_str()
                ),
            ));
        }

        let now = self.clock.now_s();
        let successor = match &old.successor_id {
            Some(successor_id) => Self::load_master(&**store, successor_id)?,
            None => {
                let id = random_id("mk");
                let material = aead::random_key();
                let successor = MasterKey {
                    sealed_material: self.seal_material(&id, &material[..])?,
                    id,
                    alias: old.alias.clone(),
                    purpose: old.purpose,
                    algorithm: old.algorithm,
                    status: KeyStatus::Active,
                    version: old.version + 1,
                    created_at: now,
                    last_rotated_at: None,
                    next_rotation_at: now + u64::from(old.rotation_interval_days) * SECS_PER_DAY,
                    rotation_interval_days: old.rotation_interval_days,
                    access_policy: old.access_policy.clone(),
                    predecessor_id: Some(old.id.clone()),
                    successor_id: None,
                    deletion_date: None,
                    requires_migration: false,
                };
                old.alias = format!("{}:v{}", old.alias, old.version);
                old.status = KeyStatus::Rotating;
                old.successor_id = Some(successor.id.clone());
                old.last_rotated_at = Some(now);
                store.commit_rotation(&old, &successor)?;
                log::info!(
                    "master key {} rotated to {} (v{})",
                    successor.alias,
                    successor.id,
                    successor.version
                );
                successor
            }
        };

        let old_material = self.unseal_material(&old)?;
        let new_material = self.unseal_material(&successor)?;
        let pending: Vec<DataKey> = store
            .data_keys_for_master(&old.id)?
            .into_iter()
            .filter(|dk| dk.superseded_by.is_none())
            .collect();

        let mut rotated_count = 0;
        let mut failed = Vec::new();
        for dk in pending {
            let rewrapped = aead::unwrap_key(old.algorithm, &old_material, &dk.id, &dk.wrapped_key)
                .and_then(|dek| {
                    let id = random_id("dk");
                    Ok(DataKey {
                        wrapped_key: aead::wrap_key(successor.algorithm, &new_material, &id, &dek)?,
                        id,
                        master_key_id: successor.id.clone(),
                        created_at: now,
                        usage_count: dk.usage_count,
                        supersedes: Some(dk.id.clone()),
                        superseded_by: None,
                    })
                })
                .and_then(|replacement| store.supersede_data_key(&dk.id, &replacement));
            match rewrapped {
                Ok(()) => rotated_count += 1,
                Err(e) => {
                    log::warn!("re-wrap of data key {} failed: {:#}", dk.id, e);
                    failed.push(ItemFailure {
                        id: dk.id.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        old.requires_migration = !failed.is_empty();
        if failed.is_empty() {
            old.status = KeyStatus::Deactivated;
        }
        store.update_master_key(&old)?;

        Ok(RotationSummary {
            old_key_id: old.id,
            new_key_id: successor.id,
            rotated_count,
            requires_migration: !failed.is_empty(),
            failed,
        })
    }

    /// Active keys whose scheduled rotation time has passed.
    pub fn get_keys_requiring_rotation(&self) -> Result<Vec<MasterKey>> {
        let now = self.clock.now_s();
        Ok(self
            .store()?
            .list_master_keys()?
            .into_iter()
            .filter(|k| k.status == KeyStatus::Active && now > k.next_rotation_at)
            .collect())
    }

    /// Rotate every key that is due, plus keys left mid-rotation by an
    /// earlier partial failure. One key failing does not stop the others.
    pub fn schedule_key_rotation(&self, actor: &ActorContext) -> Result<ScheduledRotationReport> {
        let mut due = self.get_keys_requiring_rotation()?;
        due.extend(
            self.store()?
                .list_master_keys()?
                .into_iter()
                .filter(|k| k.status == KeyStatus::Rotating),
        );

        let mut report = ScheduledRotationReport::default();
        for key in due {
            match self.rotate_master_key(&key.id, actor) {
                Ok(summary) => report.rotated.push(summary),
                Err(e) => report.failed.push(ItemFailure {
                    id: key.id.clone(),
                    error: format!("{:#}", e),
                }),
            }
        }
        if !report.rotated.is_empty() || !report.failed.is_empty() {
            log::info!(
                "scheduled rotation: {} rotated, {} failed",
                report.rotated.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    /// Schedule destruction of a master key. The grace period is raised to
    /// the configured minimum.
    pub fn delete_key(
        &self,
        master_key_id: &str,
        grace_period_days: u32,
        actor: &ActorContext,
    ) -> Result<MasterKey> {
        let record = AuditRecord::new(
            actor,
            AuditAction::Delete,
            ResourceType::MasterKey,
            master_key_id,
            "schedule master key deletion",
        )
        .meta("requested_grace_days", grace_period_days);
        let result = (|| -> Result<MasterKey> {
            self.require_admin(actor, "delete")?;
            let mut store = self.store()?;
            let mut key = Self::load_master(&**store, master_key_id)?;
            if matches!(key.status, KeyStatus::PendingDeletion | KeyStatus::Destroyed) {
                return Err(custody_err(
                    ErrorKind::InvalidStateTransition,
                    format!("master key {} is already {}", key.id, key.status.as_str()),
                ));
            }
            if key.status == KeyStatus::Rotating || key.requires_migration {
                return Err(custody_err(
                    ErrorKind::InvalidStateTransition,
                    format!("master key {} still has data keys to migrate", key.id),
                ));
            }
            let grace = grace_period_days.max(self.settings.min_deletion_grace_days);
            key.status = KeyStatus::PendingDeletion;
            key.deletion_date = Some(self.clock.now_s() + u64::from(grace) * SECS_PER_DAY);
            store.update_master_key(&key)?;
            log::warn!("master key {} pending deletion in {} days", key.alias, grace);
            Ok(key)
        })();
        self.audited(record, result, |r, key| {
            r.meta("deletion_date", key.deletion_date.unwrap_or_default())
        })
    }

    pub fn cancel_key_deletion(&self, master_key_id: &str, actor: &ActorContext) -> Result<MasterKey> {
        let record = AuditRecord::new(
            actor,
            AuditAction::Update,
            ResourceType::MasterKey,
            master_key_id,
            "cancel master key deletion",
        );
        let result = (|| -> Result<MasterKey> {
            self.require_admin(actor, "restore")?;
            let mut store = self.store()?;
            let mut key = Self::load_master(&**store, master_key_id)?;
            if key.status != KeyStatus::PendingDeletion {
                return Err(custody_err(
                    ErrorKind::InvalidStateTransition,
                    format!("master key {} is not pending deletion", key.id),
                ));
            }
            key.status = if key.requires_migration {
                KeyStatus::Rotating
            } else if key.successor_id.is_some() {
                KeyStatus::Deactivated
            } else {
                KeyStatus::Active
            };
            key.deletion_date = None;
            store.update_master_key(&key)?;
            Ok(key)
        })();
        self.audited(record, result, |r, key| r.meta("status", key.status.as_str()))
    }

    /// Destroy the material of keys whose grace period has elapsed and that
    /// no longer have dependents. A key with a used data key that has not
    /// been re-wrapped under a successor is always kept; `dependents`
    /// reports how many further stored records reference the key.
    pub fn destroy_expired_keys(
        &self,
        dependents: &dyn Fn(&str) -> Result<usize>,
        actor: &ActorContext,
    ) -> Result<DestructionReport> {
        self.require_admin(actor, "destroy")?;
        let now = self.clock.now_s();
        let candidates: Vec<MasterKey> = self
            .store()?
            .list_master_keys()?
            .into_iter()
            .filter(|k| {
                k.status == KeyStatus::PendingDeletion
                    && k.deletion_date.map_or(false, |d| d <= now)
            })
            .collect();

        let mut report = DestructionReport::default();
        for mut key in candidates {
            let live_data_keys = self
                .store()?
                .data_keys_for_master(&key.id)?
                .iter()
                .filter(|dk| dk.superseded_by.is_none() && dk.usage_count > 0)
                .count();
            if live_data_keys > 0 {
                report.deferred.push(ItemFailure {
                    id: key.id.clone(),
                    error: format!(
                        "{} data keys still wrapped only under this key",
                        live_data_keys
                    ),
                });
                continue;
            }
            let remaining = match dependents(&key.id) {
                Ok(n) => n,
                Err(e) => {
                    report.deferred.push(ItemFailure {
                        id: key.id.clone(),
                        error: format!("dependents check failed: {:#}", e),
                    });
                    continue;
                }
            };
            if remaining > 0 {
                report.deferred.push(ItemFailure {
                    id: key.id.clone(),
                    error: format!("{} dependents still reference this key", remaining),
                });
                continue;
            }
            let record = AuditRecord::new(
                actor,
                AuditAction::Delete,
                ResourceType::MasterKey,
                key.id.clone(),
                "destroy master key material",
            );
            let result = (|| -> Result<()> {
                key.status = KeyStatus::Destroyed;
                key.sealed_material.clear();
                self.store()?.update_master_key(&key)
            })();
            match self.audited(record, result, |r, _| r) {
                Ok(()) => {
                    log::warn!("destroyed master key {}", key.id);
                    report.destroyed.push(key.id.clone());
                }
                Err(e) => report.deferred.push(ItemFailure {
                    id: key.id.clone(),
                    error: format!("{:#}", e),
                }),
            }
        }
        Ok(report)
    }

    // -------------------- Data operations --------------------

    /// Encrypt under the current data key of an active master key, issuing a
    /// fresh data key when the current one has reached its usage limit.
    pub fn encrypt_data(
        &self,
        master_key_id: &str,
        plaintext: &[u8],
        aad: &[u8],
        actor: &ActorContext,
    ) -> Result<EncryptedPayload> {
        let record = AuditRecord::new(
            actor,
            AuditAction::Encrypt,
            ResourceType::MasterKey,
            master_key_id,
            "encrypt with master key",
        );
        let result = self.encrypt_data_inner(master_key_id, plaintext, aad, actor, false);
        self.audited_failure(record, result)
    }

    /// Like [`encrypt_data`](Self::encrypt_data) but always under a freshly
    /// issued data key. Used when re-encrypting stored payloads.
    pub fn encrypt_data_with_new_key(
        &self,
        master_key_id: &str,
        plaintext: &[u8],
        aad: &[u8],
        actor: &ActorContext,
    ) -> Result<EncryptedPayload> {
        let record = AuditRecord::new(
            actor,
            AuditAction::Encrypt,
            ResourceType::MasterKey,
            master_key_id,
            "encrypt with new data key",
        );
        let result = self.encrypt_data_inner(master_key_id, plaintext, aad, actor, true);
        self.audited_failure(record, result)
    }

    fn encrypt_data_inner(
        &self,
        master_key_id: &str,
        plaintext: &[u8],
        aad: &[u8],
        actor: &ActorContext,
        fresh_key: bool,
    ) -> Result<EncryptedPayload> {
        // The store lock covers key selection and the usage count only.
        let (master, dk) = {
            let mut store = self.store()?;
            let master = Self::load_master(&**store, master_key_id)?;
            Self::require_policy(&master, actor)?;
            if master.status != KeyStatus::Active {
                return Err(custody_err(
                    ErrorKind::InvalidStateTransition,
                    format!(
                        "master key {} is {} and cannot encrypt",
                        master.id,
                        master.status.as_str()
                    ),
                ));
            }

            let current = if fresh_key {
                None
            } else {
                store
                    .data_keys_for_master(&master.id)?
                    .into_iter()
                    .rev()
                    .find(|dk| dk.superseded_by.is_none() && dk.usage_count < self.settings.data_key_max_uses)
            };
            let mut dk = match current {
                Some(dk) => dk,
                None => self.issue_data_key(&mut **store, &master)?,
            };
            dk.usage_count += 1;
            store.update_data_key(&dk)?;
            (master, dk)
        };

        let material = self.unseal_material(&master)?;
        let dek = aead::unwrap_key(master.algorithm, &material, &dk.id, &dk.wrapped_key)?;
        let iv = aead::random_nonce();
        let mut ciphertext = plaintext.to_vec();
        let tag = aead::seal_in_place(master.algorithm, &dek, &iv, aad, &mut ciphertext)?;
        Ok(EncryptedPayload {
            data_key_id: dk.id,
            master_key_id: master.id,
            algorithm: master.algorithm,
            ciphertext,
            iv: iv.to_vec(),
            auth_tag: tag.to_vec(),
        })
    }

    /// Decrypt a payload, following the data key's supersession chain to the
    /// newest wrapping. Tag failures are `IntegrityViolation` and no
    /// plaintext is returned.
    pub fn decrypt_data(
        &self,
        payload: &EncryptedPayload,
        aad: &[u8],
        actor: &ActorContext,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let record = AuditRecord::new(
            actor,
            AuditAction::Decrypt,
            ResourceType::DataKey,
            payload.data_key_id.clone(),
            "decrypt with data key",
        )
        .meta("master_key_id", &payload.master_key_id);
        let result = self.decrypt_data_inner(payload, aad, actor);
        if let Err(e) = &result {
            if error_kind(e) == Some(ErrorKind::IntegrityViolation) {
                log::error!(
                    "integrity violation decrypting with data key {}: {:#}",
                    payload.data_key_id,
                    e
                );
            }
        }
        self.audited_failure(record, result)
    }

    fn decrypt_data_inner(
        &self,
        payload: &EncryptedPayload,
        aad: &[u8],
        actor: &ActorContext,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let dek = {
            let store = self.store()?;
            let (dk, master) = Self::resolve_data_key(&**store, &payload.data_key_id)?;
            Self::require_policy(&master, actor)?;
            let material = self.unseal_material(&master)?;
            aead::unwrap_key(master.algorithm, &material, &dk.id, &dk.wrapped_key)?
        };
        let mut plaintext = Zeroizing::new(payload.ciphertext.clone());
        aead::open_in_place(
            payload.algorithm,
            &dek,
            &payload.iv,
            aad,
            plaintext.as_mut_slice(),
            &payload.auth_tag,
        )?;
        Ok(plaintext)
    }

    fn resolve_data_key(store: &dyn KeyStore, data_key_id: &str) -> Result<(DataKey, MasterKey)> {
        let mut dk = store.data_key(data_key_id)?.ok_or_else(|| {
            custody_err(
                ErrorKind::KeyNotFound,
                format!("data key {} not found", data_key_id),
            )
        })?;
        for _ in 0..MAX_SUPERSESSION_DEPTH {
            let Some(next_id) = dk.superseded_by.clone() else {
                let master = Self::load_master(store, &dk.master_key_id)?;
                return Ok((dk, master));
            };
            dk = store.data_key(&next_id)?.ok_or_else(|| {
                custody_err(
                    ErrorKind::KeyNotFound,
                    format!("superseding data key {} not found", next_id),
                )
            })?;
        }
        Err(anyhow!(
            "data key {} supersession chain exceeds {} links",
            data_key_id,
            MAX_SUPERSESSION_DEPTH
        ))
    }

    // -------------------- Queries --------------------

    pub fn master_key(&self, id: &str) -> Result<MasterKey> {
        Self::load_master(&**self.store()?, id)
    }

    pub fn master_key_by_alias(&self, alias: &str) -> Result<Option<MasterKey>> {
        self.store()?.master_key_by_alias(alias)
    }

    pub fn list_master_keys(&self) -> Result<Vec<MasterKey>> {
        self.store()?.list_master_keys()
    }

    pub fn data_key(&self, id: &str) -> Result<Option<DataKey>> {
        self.store()?.data_key(id)
    }

    pub fn data_keys_for_master(&self, master_key_id: &str) -> Result<Vec<DataKey>> {
        self.store()?.data_keys_for_master(master_key_id)
    }

    /// The active key for an alias or id, following successors from a
    /// retired key.
    pub fn resolve_active_key(&self, alias_or_id: &str) -> Result<MasterKey> {
        let store = self.store()?;
        let mut key = match store.master_key_by_alias(alias_or_id)? {
            Some(key) => key,
            None => Self::load_master(&**store, alias_or_id)?,
        };
        for _ in 0..MAX_SUPERSESSION_DEPTH {
            if key.status == KeyStatus::Active {
                return Ok(key);
            }
            let Some(successor_id) = key.successor_id.clone() else {
                break;
            };
            key = Self::load_master(&**store, &successor_id)?;
        }
        Err(custody_err(
            ErrorKind::InvalidStateTransition,
            format!(
                "no active key for {} (latest is {})",
                alias_or_id,
                key.status.as_str()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use ed25519_dalek::SigningKey;

    fn kms() -> Result<(KeyManagementService, Arc<AuditLog>, Arc<ManualClock>)> {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let audit = Arc::new(AuditLog::in_memory(SigningKey::from_bytes(&[1u8; 32]))?);
        let kms = KeyManagementService::new(
            Box::new(InMemoryKeyStore::new()),
            RootKey::from_seed("root:test")?,
            audit.clone(),
            clock.clone(),
            KmsSettings {
                data_key_max_uses: 2,
                ..KmsSettings::default()
            },
        );
        Ok((kms, audit, clock))
    }

    fn admin() -> ActorContext {
        ActorContext::new("alice", "admin")
    }

    fn new_key(alias: &str) -> NewMasterKey {
        NewMasterKey {
            alias: alias.to_string(),
            purpose: KeyPurpose::General,
            algorithm: Algorithm::Aes256Gcm,
            rotation_interval_days: 30,
            access_policy: AccessPolicy::roles(["admin"]),
        }
    }

    #[test]
    fn duplicate_alias_is_rejected_and_audited() -> Result<()> {
        let (kms, audit, _) = kms()?;
        kms.create_master_key(new_key("general"), &admin())?;
        let err = kms.create_master_key(new_key("general"), &admin()).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::DuplicateAlias));
        let entries = audit.entries(&crate::audit::AuditFilter::default())?;
        assert_eq!(entries.len(), 2);
        assert!(!entries[1].success);
        Ok(())
    }

    #[test]
    fn data_key_is_reused_until_usage_limit() -> Result<()> {
        let (kms, _, _) = kms()?;
        let key = kms.create_master_key(new_key("general"), &admin())?;
        let a = kms.encrypt_data(&key.id, b"a", b"", &admin())?;
        let b = kms.encrypt_data(&key.id, b"b", b"", &admin())?;
        let c = kms.encrypt_data(&key.id, b"c", b"", &admin())?;
        assert_eq!(a.data_key_id, b.data_key_id);
        assert_ne!(b.data_key_id, c.data_key_id);
        Ok(())
    }

    #[test]
    fn concurrent_encryption_keeps_usage_limits() -> Result<()> {
        let (kms, _, _) = kms()?;
        let key = kms.create_master_key(new_key("general"), &admin())?;
        let (shared, master_id) = (&kms, key.id.as_str());
        let payloads = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4u8)
                .map(|t| {
                    scope.spawn(move || -> Result<Vec<(u8, EncryptedPayload)>> {
                        (0..8u8)
                            .map(|n| {
                                let byte = t * 8 + n;
                                Ok((byte, shared.encrypt_data(master_id, &[byte; 32], b"", &admin())?))
                            })
                            .collect()
                    })
                })
                .collect();
            let mut all = Vec::new();
            for worker in workers {
                all.extend(worker.join().map_err(|_| anyhow!("worker panicked"))??);
            }
            Ok::<_, anyhow::Error>(all)
        })?;
        assert_eq!(payloads.len(), 32);

        let data_keys = kms.data_keys_for_master(&key.id)?;
        assert!(data_keys.iter().all(|dk| dk.usage_count <= 2));
        assert_eq!(data_keys.iter().map(|dk| dk.usage_count).sum::<u64>(), 32);
        for (byte, payload) in &payloads {
            assert_eq!(kms.decrypt_data(payload, b"", &admin())?.as_slice(), &[*byte; 32][..]);
        }
        Ok(())
    }

    #[test]
    fn role_outside_policy_cannot_decrypt() -> Result<()> {
        let (kms, _, _) = kms()?;
        let key = kms.create_master_key(new_key("general"), &admin())?;
        let payload = kms.encrypt_data(&key.id, b"secret", b"ctx", &admin())?;
        let viewer = ActorContext::new("eve", "viewer");
        let err = kms.decrypt_data(&payload, b"ctx", &viewer).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::UnauthorizedAccess));
        Ok(())
    }

    #[test]
    fn rotation_renames_retired_alias_and_keeps_old_payloads_readable() -> Result<()> {
        let (kms, _, _) = kms()?;
        let key = kms.create_master_key(new_key("general"), &admin())?;
        let payload = kms.encrypt_data(&key.id, b"before", b"", &admin())?;
        let summary = kms.rotate_master_key(&key.id, &admin())?;
        assert_eq!(summary.rotated_count, 1);
        assert!(!summary.requires_migration);

        let retired = kms.master_key(&key.id)?;
        assert_eq!(retired.alias, "general:v1");
        assert_eq!(retired.status, KeyStatus::Deactivated);
        let active = kms.resolve_active_key("general")?;
        assert_eq!(active.id, summary.new_key_id);
        assert_eq!(active.version, 2);

        let clear = kms.decrypt_data(&payload, b"", &admin())?;
        assert_eq!(clear.as_slice(), b"before");
        Ok(())
    }

    #[test]
    fn deleted_key_gets_minimum_grace_and_is_skipped_by_scheduler() -> Result<()> {
        let (kms, _, clock) = kms()?;
        let key = kms.create_master_key(new_key("general"), &admin())?;
        let pending = kms.delete_key(&key.id, 1, &admin())?;
        assert_eq!(
            pending.deletion_date,
            Some(clock.now_s() + 7 * SECS_PER_DAY)
        );
        clock.advance(60 * SECS_PER_DAY);
        assert!(kms.get_keys_requiring_rotation()?.is_empty());

        let report = kms.destroy_expired_keys(&|_| Ok(1), &admin())?;
        assert_eq!(report.deferred.len(), 1);
        let report = kms.destroy_expired_keys(&|_| Ok(0), &admin())?;
        assert_eq!(report.destroyed, vec![key.id.clone()]);
        assert_eq!(kms.master_key(&key.id)?.status, KeyStatus::Destroyed);
        Ok(())
    }

    #[test]
    fn cancelled_deletion_restores_key_to_rotation_schedule() -> Result<()> {
        let (kms, _, clock) = kms()?;
        let key = kms.create_master_key(new_key("general"), &admin())?;
        kms.delete_key(&key.id, 7, &admin())?;
        let restored = kms.cancel_key_deletion(&key.id, &admin())?;
        assert_eq!(restored.status, KeyStatus::Active);
        assert_eq!(restored.deletion_date, None);

        let err = kms.cancel_key_deletion(&key.id, &admin()).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::InvalidStateTransition));

        clock.advance(31 * SECS_PER_DAY);
        let due = kms.get_keys_requiring_rotation()?;
        assert_eq!(due.len(), 1);
        let report = kms.schedule_key_rotation(&ActorContext::system())?;
        assert_eq!(report.rotated.len(), 1);
        assert!(kms.get_keys_requiring_rotation()?.is_empty());
        Ok(())
    }

    #[test]
    fn lifecycle_requires_admin_role() -> Result<()> {
        let (kms, _, _) = kms()?;
        let err = kms
            .create_master_key(new_key("general"), &ActorContext::new("bob", "viewer"))
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::UnauthorizedAccess));
        Ok(())
    }
}
