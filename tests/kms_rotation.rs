use anyhow::{anyhow, Result};
use ed25519_dalek::SigningKey;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use custody_kernel::audit::{ActorContext, AuditAction, AuditFilter, AuditLog, ResourceType};
use custody_kernel::clock::{ManualClock, SECS_PER_DAY};
use custody_kernel::crypto::aead::Algorithm;
use custody_kernel::crypto::RootKey;
use custody_kernel::kms::{
    AccessPolicy, DataKey, InMemoryKeyStore, KeyManagementService, KeyPurpose, KeyStatus,
    KeyStore, KmsSettings, MasterKey, NewMasterKey, SqliteKeyStore,
};
use custody_kernel::{error_kind, ErrorKind};

/// Delegating store that refuses to supersede selected data keys.
struct FlakyKeyStore {
    inner: InMemoryKeyStore,
    refuse: Arc<Mutex<HashSet<String>>>,
}

impl KeyStore for FlakyKeyStore {
    fn insert_master_key(&mut self, key: &MasterKey) -> Result<()> {
        self.inner.insert_master_key(key)
    }

    fn update_master_key(&mut self, key: &MasterKey) -> Result<()> {
        self.inner.update_master_key(key)
    }

    fn commit_rotation(&mut self, retired: &MasterKey, successor: &MasterKey) -> Result<()> {
        self.inner.commit_rotation(retired, successor)
    }

    fn master_key(&self, id: &str) -> Result<Option<MasterKey>> {
        self.inner.master_key(id)
    }

    fn master_key_by_alias(&self, alias: &str) -> Result<Option<MasterKey>> {
        self.inner.master_key_by_alias(alias)
    }

    fn list_master_keys(&self) -> Result<Vec<MasterKey>> {
        self.inner.list_master_keys()
    }

    fn insert_data_key(&mut self, key: &DataKey) -> Result<()> {
        self.inner.insert_data_key(key)
    }

    fn update_data_key(&mut self, key: &DataKey) -> Result<()> {
        self.inner.update_data_key(key)
    }

    fn supersede_data_key(&mut self, old_id: &str, replacement: &DataKey) -> Result<()> {
        let refused = self
            .refuse
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .contains(old_id);
        if refused {
            return Err(anyhow!("disk full while re-wrapping {}", old_id));
        }
        self.inner.supersede_data_key(old_id, replacement)
    }

    fn data_key(&self, id: &str) -> Result<Option<DataKey>> {
        self.inner.data_key(id)
    }

    fn data_keys_for_master(&self, master_key_id: &str) -> Result<Vec<DataKey>> {
        self.inner.data_keys_for_master(master_key_id)
    }
}

fn admin() -> ActorContext {
    ActorContext::new("alice", "admin")
}

fn evidence_key() -> NewMasterKey {
    NewMasterKey {
        alias: "evidence-key".to_string(),
        purpose: KeyPurpose::Evidence,
        algorithm: Algorithm::Aes256Gcm,
        rotation_interval_days: 365,
        access_policy: AccessPolicy::roles(["admin"]),
    }
}

fn audit() -> Result<Arc<AuditLog>> {
    Ok(Arc::new(AuditLog::in_memory(SigningKey::from_bytes(&[5u8; 32]))?))
}

#[test]
fn failed_rewrap_is_isolated_and_finished_by_the_scheduler() -> Result<()> {
    let refuse = Arc::new(Mutex::new(HashSet::new()));
    let audit = audit()?;
    let kms = KeyManagementService::new(
        Box::new(FlakyKeyStore {
            inner: InMemoryKeyStore::new(),
            refuse: refuse.clone(),
        }),
        RootKey::from_seed("root:rotation")?,
        audit.clone(),
        Arc::new(ManualClock::new(1_700_000_000)),
        KmsSettings {
            data_key_max_uses: 1,
            ..KmsSettings::default()
        },
    );
    let master = kms.create_master_key(evidence_key(), &admin())?;

    let mut payloads = Vec::new();
    for n in 0..3u8 {
        payloads.push(kms.encrypt_data(&master.id, &[n; 64], b"aad", &admin())?);
    }
    assert_eq!(kms.data_keys_for_master(&master.id)?.len(), 3);
    refuse
        .lock()
        .map_err(|_| anyhow!("poisoned"))?
        .insert(payloads[1].data_key_id.clone());

    let summary = kms.rotate_master_key(&master.id, &admin())?;
    assert_eq!(summary.rotated_count, 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].id, payloads[1].data_key_id);
    assert!(summary.requires_migration);

    let old = kms.master_key(&master.id)?;
    assert_eq!(old.status, KeyStatus::Rotating);
    assert_eq!(old.alias, "evidence-key:v1");
    assert_eq!(kms.resolve_active_key("evidence-key")?.id, summary.new_key_id);

    let err = kms.delete_key(&master.id, 30, &admin()).unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::InvalidStateTransition));
    assert_eq!(kms.master_key(&master.id)?.status, KeyStatus::Rotating);

    for (n, payload) in payloads.iter().enumerate() {
        let clear = kms.decrypt_data(payload, b"aad", &admin())?;
        assert_eq!(clear.as_slice(), &[n as u8; 64][..]);
    }

    refuse.lock().map_err(|_| anyhow!("poisoned"))?.clear();
    let report = kms.schedule_key_rotation(&ActorContext::system())?;
    assert_eq!(report.rotated.len(), 1);
    assert_eq!(report.rotated[0].rotated_count, 1);
    assert!(!report.rotated[0].requires_migration);
    assert_eq!(kms.master_key(&master.id)?.status, KeyStatus::Deactivated);
    assert_eq!(
        kms.delete_key(&master.id, 30, &admin())?.status,
        KeyStatus::PendingDeletion
    );

    let rotations = audit.entries(&AuditFilter {
        action: Some(AuditAction::Rotate),
        resource_type: Some(ResourceType::MasterKey),
        ..AuditFilter::default()
    })?;
    assert_eq!(rotations.len(), 2);
    assert_eq!(rotations[0].metadata.get("failed_count").map(String::as_str), Some("1"));
    Ok(())
}

#[test]
fn keys_survive_reopen_only_under_the_same_root() -> Result<()> {
    let dir = TempDir::new()?;
    let db = dir.path().join("keys.db").to_string_lossy().into_owned();
    let clock = Arc::new(ManualClock::new(1_700_000_000));

    let payload = {
        let kms = KeyManagementService::new(
            Box::new(SqliteKeyStore::open(&db)?),
            RootKey::from_seed("root:one")?,
            audit()?,
            clock.clone(),
            KmsSettings::default(),
        );
        let master = kms.create_master_key(evidence_key(), &admin())?;
        kms.encrypt_data(&master.id, b"chain of custody", b"aad", &admin())?
    };

    let reopened = KeyManagementService::new(
        Box::new(SqliteKeyStore::open(&db)?),
        RootKey::from_seed("root:one")?,
        audit()?,
        clock.clone(),
        KmsSettings::default(),
    );
    let clear = reopened.decrypt_data(&payload, b"aad", &admin())?;
    assert_eq!(clear.as_slice(), b"chain of custody");
    assert!(reopened.decrypt_data(&payload, b"other aad", &admin()).is_err());

    let wrong_root = KeyManagementService::new(
        Box::new(SqliteKeyStore::open(&db)?),
        RootKey::from_seed("root:two")?,
        audit()?,
        clock,
        KmsSettings::default(),
    );
    assert!(wrong_root.decrypt_data(&payload, b"aad", &admin()).is_err());
    Ok(())
}

#[test]
fn destruction_waits_for_grace_and_dependents() -> Result<()> {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let kms = KeyManagementService::new(
        Box::new(InMemoryKeyStore::new()),
        RootKey::from_seed("root:deletion")?,
        audit()?,
        clock.clone(),
        KmsSettings::default(),
    );
    let master = kms.create_master_key(evidence_key(), &admin())?;
    let payload = kms.encrypt_data(&master.id, b"exhibit", b"aad", &admin())?;

    let pending = kms.delete_key(&master.id, 1, &admin())?;
    assert_eq!(pending.status, KeyStatus::PendingDeletion);
    assert_eq!(
        pending.deletion_date,
        Some(1_700_000_000 + 7 * SECS_PER_DAY)
    );

    let none_due = kms.destroy_expired_keys(&|_| Ok(0), &admin())?;
    assert!(none_due.destroyed.is_empty());
    assert!(none_due.deferred.is_empty());

    // The payload's data key is still wrapped only under this master.
    clock.advance(8 * SECS_PER_DAY);
    let live = kms.destroy_expired_keys(&|_| Ok(0), &admin())?;
    assert!(live.destroyed.is_empty());
    assert_eq!(live.deferred.len(), 1);
    assert!(live.deferred[0].error.contains("1 data keys"));
    assert_eq!(kms.master_key(&master.id)?.status, KeyStatus::PendingDeletion);
    assert_eq!(kms.decrypt_data(&payload, b"aad", &admin())?.as_slice(), b"exhibit");

    kms.cancel_key_deletion(&master.id, &admin())?;
    let summary = kms.rotate_master_key(&master.id, &admin())?;
    assert_eq!(summary.rotated_count, 1);
    kms.delete_key(&master.id, 7, &admin())?;
    clock.advance(8 * SECS_PER_DAY);

    let held = kms.destroy_expired_keys(&|_| Ok(2), &admin())?;
    assert_eq!(held.deferred.len(), 1);
    assert!(held.deferred[0].error.contains("2 dependents"));

    let done = kms.destroy_expired_keys(&|_| Ok(0), &admin())?;
    assert_eq!(done.destroyed, vec![master.id.clone()]);
    assert_eq!(kms.master_key(&master.id)?.status, KeyStatus::Destroyed);
    assert_eq!(kms.decrypt_data(&payload, b"aad", &admin())?.as_slice(), b"exhibit");
    Ok(())
}
