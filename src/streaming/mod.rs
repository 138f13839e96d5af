//! Per-stream HLS key lifecycle.
//!
//! Each live stream owns one slot behind an async mutex: every rotation,
//! segment tick and stop for that stream runs under it, while different
//! streams proceed in parallel. Raw keys are sealed through the KMS before
//! they are stored; the service keeps an in-process cache of unsealed keys
//! for key delivery.

use anyhow::{anyhow, Result};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use zeroize::Zeroizing;

use crate::audit::{ActorContext, AuditAction, AuditLog, AuditRecord, ResourceType};
use crate::clock::Clock;
use crate::crypto::random_id;
use crate::error::{custody_err, error_kind, ErrorKind};
use crate::kms::{AccessPolicy, KeyManagementService, KeyPurpose, MasterKey, NewMasterKey};
use crate::validate::validate_identifier;

pub mod cdn;
pub mod store;
pub mod types;

pub use cdn::{CdnKeyDistributor, CdnKeyPush, CdnSyncPolicy, LoggingCdnDistributor};
#[cfg(feature = "cdn-http")]
pub use cdn::HttpCdnDistributor;
pub use store::{InMemoryStreamKeyStore, SqliteStreamKeyStore, StoredHlsKey, StreamKeyStore};
pub use types::{
    CdnSyncResults, HlsKey, HlsKeyStatus, KeyMethod, KeyResponse, KeyRotationEvent,
    PlaylistEntry, RotationConfig, RotationType, StreamEncryptionState, StreamStart,
    HLS_IV_LEN, HLS_KEY_LEN,
};

#[derive(Clone, Debug)]
pub struct StreamingSettings {
    pub master_key_alias: String,
    pub master_key_rotation_days: u32,
    /// Prefix of the key delivery URI; the key id is appended.
    pub key_base_url: String,
    /// How long a replaced key stays servable after a rotation.
    pub grace_period: Duration,
    pub segment_duration_s: f64,
    pub cdn: CdnSyncPolicy,
    pub default_rotation: RotationConfig,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            master_key_alias: "streaming-key".to_string(),
            master_key_rotation_days: 90,
            key_base_url: "https://keys.localhost/hls/keys".to_string(),
            grace_period: Duration::from_secs(300),
            segment_duration_s: 6.0,
            cdn: CdnSyncPolicy::default(),
            default_rotation: RotationConfig::default(),
        }
    }
}

struct StreamSlot {
    state: StreamEncryptionState,
    timer: Option<JoinHandle<()>>,
    stopped: bool,
}

struct PreparedRotation {
    state: StreamEncryptionState,
    updated: Vec<HlsKey>,
    created: Vec<StoredHlsKey>,
    old: HlsKey,
    current: HlsKey,
}

struct Inner {
    kms: Arc<KeyManagementService>,
    audit: Arc<AuditLog>,
    store: Mutex<Box<dyn StreamKeyStore + Send>>,
    cdn: Arc<dyn CdnKeyDistributor>,
    clock: Arc<dyn Clock>,
    settings: StreamingSettings,
    streams: RwLock<HashMap<String, Arc<AsyncMutex<StreamSlot>>>>,
    keys: RwLock<HashMap<String, HlsKey>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(streams) = self.streams.get_mut() {
            for slot in streams.values() {
                if let Ok(mut slot) = slot.try_lock() {
                    if let Some(timer) = slot.timer.take() {
                        timer.abort();
                    }
                }
            }
        }
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Cheap to clone; clones share the same streams and key cache.
#[derive(Clone)]
pub struct StreamKeyRotationService {
    inner: Arc<Inner>,
}

fn hls_aad(key_id: &str) -> Vec<u8> {
    format!("hls-key:{}", key_id).into_bytes()
}

fn stream_not_found(stream_id: &str) -> anyhow::Error {
    custody_err(
        ErrorKind::StreamNotFound,
        format!("stream {} is not active", stream_id),
    )
}

fn segment_uri(playlist_url: &str, segment_number: u64) -> String {
    match playlist_url.rsplit_once('/') {
        Some((base, _)) => format!("{}/segment_{}.ts", base, segment_number),
        None => format!("segment_{}.ts", segment_number),
    }
}

impl StreamKeyRotationService {
    pub fn new(
        kms: Arc<KeyManagementService>,
        audit: Arc<AuditLog>,
        store: Box<dyn StreamKeyStore + Send>,
        cdn: Arc<dyn CdnKeyDistributor>,
        clock: Arc<dyn Clock>,
        settings: StreamingSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kms,
                audit,
                store: Mutex::new(store),
                cdn,
                clock,
                settings,
                streams: RwLock::new(HashMap::new()),
                keys: RwLock::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn settings(&self) -> &StreamingSettings {
        &self.inner.settings
    }

    fn store(&self) -> Result<MutexGuard<'_, Box<dyn StreamKeyStore + Send>>> {
        self.inner
            .store
            .lock()
            .map_err(|_| anyhow!("stream key store lock poisoned"))
    }

    fn slot(&self, stream_id: &str) -> Result<Arc<AsyncMutex<StreamSlot>>> {
        self.inner
            .streams
            .read()
            .map_err(|_| anyhow!("stream map lock poisoned"))?
            .get(stream_id)
            .cloned()
            .ok_or_else(|| stream_not_found(stream_id))
    }

    fn cache_keys<'a>(&self, keys: impl IntoIterator<Item = &'a HlsKey>) -> Result<()> {
        let mut cache = self
            .inner
            .keys
            .write()
            .map_err(|_| anyhow!("key cache lock poisoned"))?;
        for key in keys {
            match cache.get_mut(&key.id) {
                // Status updates arrive without material; keep what is cached.
                Some(cached) if key.key.is_empty() => {
                    let material = std::mem::replace(&mut cached.key, Zeroizing::new(Vec::new()));
                    *cached = key.clone();
                    cached.key = material;
                }
                _ => {
                    cache.insert(key.id.clone(), key.clone());
                }
            }
        }
        Ok(())
    }

    fn evict_cached(&self, ids: &[String]) -> Result<()> {
        let mut cache = self
            .inner
            .keys
            .write()
            .map_err(|_| anyhow!("key cache lock poisoned"))?;
        for id in ids {
            cache.remove(id);
        }
        Ok(())
    }

    /// The active streaming master key, created on first use.
    fn streaming_master_key(&self) -> Result<MasterKey> {
        let settings = &self.inner.settings;
        if self
            .inner
            .kms
            .master_key_by_alias(&settings.master_key_alias)?
            .is_some()
        {
            return self.inner.kms.resolve_active_key(&settings.master_key_alias);
        }
        let key = self.inner.kms.create_master_key(
            NewMasterKey {
                alias: settings.master_key_alias.clone(),
                purpose: KeyPurpose::StreamingEncryption,
                algorithm: Default::default(),
                rotation_interval_days: settings.master_key_rotation_days,
                access_policy: AccessPolicy::roles(["admin", "system"]),
            },
            &ActorContext::system(),
        )?;
        log::info!("created streaming master key {}", key.id);
        Ok(key)
    }

    fn generate_key(
        &self,
        master: &MasterKey,
        stream_id: &str,
        method: KeyMethod,
        status: HlsKeyStatus,
    ) -> Result<StoredHlsKey> {
        let id = random_id("hls");
        let mut material = Zeroizing::new(vec![0u8; HLS_KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut material[..]);
        let mut iv = [0u8; HLS_IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let sealed = self.inner.kms.encrypt_data(
            &master.id,
            &material,
            &hls_aad(&id),
            &ActorContext::system(),
        )?;
        let key = HlsKey {
            key_uri: format!(
                "{}/{}",
                self.inner.settings.key_base_url.trim_end_matches('/'),
                id
            ),
            id,
            key: material,
            iv,
            method,
            stream_id: stream_id.to_string(),
            status,
            created_at: self.inner.clock.now_s(),
            expires_at: None,
        };
        Ok(StoredHlsKey { key, sealed })
    }

    /// A key with its raw material, from the cache or unsealed from the
    /// store.
    fn key_with_material(&self, key_id: &str) -> Result<HlsKey> {
        {
            let cache = self
                .inner
                .keys
                .read()
                .map_err(|_| anyhow!("key cache lock poisoned"))?;
            if let Some(key) = cache.get(key_id) {
                if !key.key.is_empty() {
                    return Ok(key.clone());
                }
            }
        }
        let stored = self.store()?.key(key_id)?.ok_or_else(|| {
            custody_err(
                ErrorKind::KeyNotFound,
                format!("stream key {} not found", key_id),
            )
        })?;
        let material = self.inner.kms.decrypt_data(
            &stored.sealed,
            &hls_aad(key_id),
            &ActorContext::system(),
        )?;
        let mut key = stored.key;
        key.key = material;
        Ok(key)
    }

    // -------------------- Lifecycle --------------------

    /// Start key management for a stream: one active key, the configured
    /// number of pending keys, a recurring rotation timer and an initial CDN
    /// push.
    pub async fn initialize_stream(
        &self,
        stream_id: &str,
        playlist_url: &str,
        cdn_endpoints: Vec<String>,
        config: Option<RotationConfig>,
        actor: &ActorContext,
    ) -> Result<StreamStart> {
        let record = AuditRecord::new(
            actor,
            AuditAction::Create,
            ResourceType::Stream,
            stream_id,
            "initialize stream encryption",
        )
        .meta("playlist_url", playlist_url)
        .meta("cdn_endpoints", cdn_endpoints.len());
        let result = self
            .initialize_stream_inner(stream_id, playlist_url, cdn_endpoints, config)
            .await;
        self.inner.audit.record_outcome(record, result, |r, start| {
            r.meta("current_key_id", &start.state.current_key_id)
                .meta("pending_keys", start.state.pending_key_ids.len())
                .meta("cdn_failed", start.cdn_sync.failed_endpoints().len())
        })
    }

    async fn initialize_stream_inner(
        &self,
        stream_id: &str,
        playlist_url: &str,
        cdn_endpoints: Vec<String>,
        config: Option<RotationConfig>,
    ) -> Result<StreamStart> {
        validate_identifier("stream", stream_id)?;
        let config = config.unwrap_or_else(|| self.inner.settings.default_rotation.clone());
        config.validate()?;
        if self.slot(stream_id).is_ok() {
            return Err(custody_err(
                ErrorKind::InvalidStateTransition,
                format!("stream {} is already active", stream_id),
            ));
        }

        let master = self.streaming_master_key()?;
        let current = self.generate_key(&master, stream_id, config.key_method, HlsKeyStatus::Active)?;
        let mut created = vec![current.clone()];
        for _ in 0..config.pre_generate_count {
            created.push(self.generate_key(
                &master,
                stream_id,
                config.key_method,
                HlsKeyStatus::Pending,
            )?);
        }

        let now = self.inner.clock.now_s();
        let state = StreamEncryptionState {
            stream_id: stream_id.to_string(),
            current_key_id: current.key.id.clone(),
            pending_key_ids: created[1..].iter().map(|s| s.key.id.clone()).collect(),
            segment_count: 0,
            total_segments: 0,
            rotation_count: 0,
            started_at: now,
            last_rotation_at: now,
            config: config.clone(),
            playlist_url: playlist_url.to_string(),
            cdn_endpoints,
            key_line: current.key.key_line(),
        };

        let slot = {
            let mut streams = self
                .inner
                .streams
                .write()
                .map_err(|_| anyhow!("stream map lock poisoned"))?;
            if streams.contains_key(stream_id) {
                return Err(custody_err(
                    ErrorKind::InvalidStateTransition,
                    format!("stream {} is already active", stream_id),
                ));
            }
            self.store()?.commit_state(&state, &[], &created)?;
            let slot = Arc::new(AsyncMutex::new(StreamSlot {
                state: state.clone(),
                timer: None,
                stopped: false,
            }));
            streams.insert(stream_id.to_string(), slot.clone());
            slot
        };
        self.cache_keys(created.iter().map(|s| &s.key))?;

        let timer = self.spawn_rotation_timer(stream_id.to_string(), config.rotation_interval_minutes);
        slot.lock().await.timer = Some(timer);

        let cdn_sync = if config.cdn_sync && !state.cdn_endpoints.is_empty() {
            cdn::push_to_all(
                &self.inner.cdn,
                &state.cdn_endpoints,
                &self.inner.settings.cdn,
                &current.key,
            )
            .await
        } else {
            CdnSyncResults::default()
        };
        if let Some(failure) = cdn_sync.failure() {
            log::warn!("stream {} initial key sync: {}", stream_id, failure);
        }
        log::info!(
            "stream {} initialized with key {} and {} pending",
            stream_id,
            state.current_key_id,
            state.pending_key_ids.len()
        );
        Ok(StreamStart { state, cdn_sync })
    }

    fn spawn_rotation_timer(&self, stream_id: String, interval_minutes: u32) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = Duration::from_secs(u64::from(interval_minutes) * 60);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let service = StreamKeyRotationService { inner };
                let outcome = service
                    .rotate_stream_key(&stream_id, RotationType::Scheduled, &ActorContext::system())
                    .await;
                match outcome {
                    Ok(event) => log::debug!(
                        "scheduled rotation of {} to {:?}",
                        stream_id,
                        event.new_key_id
                    ),
                    Err(e) if error_kind(&e) == Some(ErrorKind::StreamNotFound) => break,
                    Err(e) => log::warn!("scheduled rotation of {} failed: {:#}", stream_id, e),
                }
            }
        })
    }

    /// Rotate a stream's key now. Emergency rotation revokes the current key
    /// immediately instead of granting it the grace window.
    pub async fn rotate_stream_key(
        &self,
        stream_id: &str,
        rotation_type: RotationType,
        actor: &ActorContext,
    ) -> Result<KeyRotationEvent> {
        let slot = match self.slot(stream_id) {
            Ok(slot) => slot,
            Err(e) => {
                let record = AuditRecord::new(
                    actor,
                    AuditAction::Rotate,
                    ResourceType::Stream,
                    stream_id,
                    format!("{} key rotation", rotation_type.as_str()),
                );
                self.inner.audit.log_action(record.failed(&e))?;
                return Err(e);
            }
        };
        let mut slot = slot.lock().await;
        self.rotate_locked(&mut slot, rotation_type, actor).await
    }

    async fn rotate_locked(
        &self,
        slot: &mut StreamSlot,
        rotation_type: RotationType,
        actor: &ActorContext,
    ) -> Result<KeyRotationEvent> {
        let stream_id = slot.state.stream_id.clone();
        let old_key_id = slot.state.current_key_id.clone();
        let affected_segments = slot.state.segment_count;
        let now = self.inner.clock.now_s();
        let record = AuditRecord::new(
            actor,
            AuditAction::Rotate,
            ResourceType::Stream,
            stream_id.clone(),
            format!("{} key rotation", rotation_type.as_str()),
        )
        .meta("rotation_type", rotation_type.as_str())
        .meta("old_key_id", &old_key_id)
        .meta("affected_segments", affected_segments);

        let prepared = if slot.stopped {
            Err(stream_not_found(&stream_id))
        } else {
            self.prepare_rotation(&slot.state, rotation_type, now)
        };
        let committed = prepared.and_then(|p| {
            self.store()?.commit_state(&p.state, &p.updated, &p.created)?;
            Ok(p)
        });
        let prepared = match committed {
            Ok(p) => p,
            Err(e) => {
                let event = KeyRotationEvent {
                    id: random_id("rot"),
                    stream_id: stream_id.clone(),
                    old_key_id: Some(old_key_id),
                    new_key_id: None,
                    rotation_type,
                    timestamp: now,
                    success: false,
                    error: Some(format!("{:#}", e)),
                    affected_segments,
                    cdn_sync: CdnSyncResults::default(),
                };
                let appended = self.store().and_then(|mut s| s.append_event(&event));
                if let Err(store_err) = appended {
                    log::error!(
                        "could not record failed rotation of {}: {:#}",
                        stream_id,
                        store_err
                    );
                }
                log::warn!("rotation of stream {} rolled back: {:#}", stream_id, e);
                self.inner.audit.log_action(record.failed(&e))?;
                return Err(e);
            }
        };

        let mut cached: Vec<&HlsKey> = prepared.updated.iter().collect();
        cached.extend(prepared.created.iter().map(|s| &s.key));
        cached.push(&prepared.current);
        self.cache_keys(cached)?;
        slot.state = prepared.state;

        let endpoints = slot.state.cdn_endpoints.clone();
        let sync_enabled = slot.state.config.cdn_sync && !endpoints.is_empty();
        if rotation_type == RotationType::Emergency {
            log::warn!(
                "emergency rotation on stream {}: key {} revoked",
                stream_id,
                prepared.old.id
            );
            if sync_enabled {
                let evicted = cdn::evict_from_all(
                    &self.inner.cdn,
                    &endpoints,
                    &self.inner.settings.cdn,
                    &stream_id,
                    &prepared.old.id,
                )
                .await;
                if let Some(failure) = evicted.failure() {
                    log::error!("revoked key {} eviction: {}", prepared.old.id, failure);
                }
            }
        }
        let cdn_sync = if sync_enabled {
            cdn::push_to_all(
                &self.inner.cdn,
                &endpoints,
                &self.inner.settings.cdn,
                &prepared.current,
            )
            .await
        } else {
            CdnSyncResults::default()
        };

        let event = KeyRotationEvent {
            id: random_id("rot"),
            stream_id: stream_id.clone(),
            old_key_id: Some(prepared.old.id.clone()),
            new_key_id: Some(prepared.current.id.clone()),
            rotation_type,
            timestamp: now,
            success: true,
            error: None,
            affected_segments,
            cdn_sync,
        };
        self.store()?.append_event(&event)?;

        let mut record = record
            .meta("new_key_id", &prepared.current.id)
            .meta("cdn_endpoints", event.cdn_sync.endpoints.len());
        if let Some(failure) = event.partial_sync_failure() {
            log::warn!("stream {} rotation: {}", stream_id, failure);
            record = record.meta("partial_sync_failure", failure);
        }
        self.inner.audit.log_action(record)?;
        log::info!(
            "stream {} rotated {} -> {} ({})",
            stream_id,
            prepared.old.id,
            prepared.current.id,
            rotation_type.as_str()
        );
        Ok(event)
    }

    fn prepare_rotation(
        &self,
        state: &StreamEncryptionState,
        rotation_type: RotationType,
        now: u64,
    ) -> Result<PreparedRotation> {
        if rotation_type == RotationType::Emergency && !state.config.emergency_rotation {
            return Err(custody_err(
                ErrorKind::InvalidStateTransition,
                format!("emergency rotation is disabled for stream {}", state.stream_id),
            ));
        }
        let master = self.streaming_master_key()?;
        let mut next = state.clone();

        let mut old = self.key_with_material(&state.current_key_id)?;
        if rotation_type == RotationType::Emergency {
            old.status = HlsKeyStatus::Revoked;
            old.expires_at = Some(now);
        } else {
            let grace = self.inner.settings.grace_period.as_secs();
            old.expires_at = Some(now + grace);
        }

        let mut updated = vec![old.clone()];
        let mut created = Vec::new();
        let current = match next.pending_key_ids.pop_front() {
            Some(next_id) => {
                let mut key = self.key_with_material(&next_id)?;
                key.status = HlsKeyStatus::Active;
                key.expires_at = None;
                updated.push(key.clone());
                key
            }
            None => {
                let stored =
                    self.generate_key(&master, &state.stream_id, state.config.key_method, HlsKeyStatus::Active)?;
                let key = stored.key.clone();
                created.push(stored);
                key
            }
        };
        while next.pending_key_ids.len() < state.config.pre_generate_count {
            let stored = self.generate_key(
                &master,
                &state.stream_id,
                state.config.key_method,
                HlsKeyStatus::Pending,
            )?;
            next.pending_key_ids.push_back(stored.key.id.clone());
            created.push(stored);
        }

        next.current_key_id = current.id.clone();
        next.segment_count = 0;
        next.rotation_count += 1;
        next.last_rotation_at = now;
        next.key_line = current.key_line();
        Ok(PreparedRotation {
            state: next,
            updated,
            created,
            old,
            current,
        })
    }

    /// Count one delivered segment. Reaching `segments_per_key` rotates the
    /// key and returns the rotation event.
    pub async fn update_segment_count(&self, stream_id: &str) -> Result<Option<KeyRotationEvent>> {
        let slot = self.slot(stream_id)?;
        let mut slot = slot.lock().await;
        if slot.stopped {
            return Err(stream_not_found(stream_id));
        }
        let mut next = slot.state.clone();
        next.segment_count += 1;
        next.total_segments += 1;
        let due = next.segment_count >= next.config.segments_per_key;
        if !due {
            self.store()?.commit_state(&next, &[], &[])?;
        }
        slot.state = next;
        if due {
            let event = self
                .rotate_locked(&mut slot, RotationType::SegmentCount, &ActorContext::system())
                .await?;
            return Ok(Some(event));
        }
        Ok(None)
    }

    /// Stop a stream: cancel its timer, expire all of its keys, evict them
    /// from the CDNs and drop its state.
    pub async fn stop_stream(&self, stream_id: &str, actor: &ActorContext) -> Result<()> {
        let record = AuditRecord::new(
            actor,
            AuditAction::Delete,
            ResourceType::Stream,
            stream_id,
            "stop stream encryption",
        );
        let result = self.stop_stream_inner(stream_id).await;
        self.inner
            .audit
            .record_outcome(record, result, |r, expired| r.meta("expired_keys", expired))
            .map(|_| ())
    }

    async fn stop_stream_inner(&self, stream_id: &str) -> Result<usize> {
        let slot = self.slot(stream_id)?;
        let mut slot = slot.lock().await;
        if slot.stopped {
            return Err(stream_not_found(stream_id));
        }
        let now = self.inner.clock.now_s();
        let keys = self.store()?.keys_for_stream(stream_id)?;
        let mut updated = Vec::new();
        let mut resident = Vec::new();
        for mut key in keys {
            match key.status {
                HlsKeyStatus::Active => {
                    resident.push(key.id.clone());
                    key.status = HlsKeyStatus::Expired;
                    key.expires_at = Some(key.expires_at.map_or(now, |t| t.min(now)));
                    updated.push(key);
                }
                HlsKeyStatus::Pending => {
                    key.status = HlsKeyStatus::Expired;
                    key.expires_at = Some(now);
                    updated.push(key);
                }
                HlsKeyStatus::Expired | HlsKeyStatus::Revoked => {}
            }
        }
        self.store()?.close_stream(stream_id, &updated)?;

        slot.stopped = true;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        self.inner
            .streams
            .write()
            .map_err(|_| anyhow!("stream map lock poisoned"))?
            .remove(stream_id);
        let ids: Vec<String> = updated.iter().map(|k| k.id.clone()).collect();
        self.evict_cached(&ids)?;

        if slot.state.config.cdn_sync && !slot.state.cdn_endpoints.is_empty() {
            for key_id in &resident {
                let evicted = cdn::evict_from_all(
                    &self.inner.cdn,
                    &slot.state.cdn_endpoints,
                    &self.inner.settings.cdn,
                    stream_id,
                    key_id,
                )
                .await;
                if let Some(failure) = evicted.failure() {
                    log::warn!("stream {} key {} eviction: {}", stream_id, key_id, failure);
                }
            }
        }
        log::info!("stream {} stopped; {} keys expired", stream_id, updated.len());
        Ok(updated.len())
    }

    /// Mark every active key whose expiry has passed as expired, whether or
    /// not its stream is still live.
    pub fn cleanup_expired_keys(&self) -> Result<usize> {
        let now = self.inner.clock.now_s();
        let mut expired = self.store()?.expired_active_keys(now)?;
        if expired.is_empty() {
            return Ok(0);
        }
        for key in &mut expired {
            key.status = HlsKeyStatus::Expired;
        }
        self.store()?.update_keys(&expired)?;
        let ids: Vec<String> = expired.iter().map(|k| k.id.clone()).collect();
        self.evict_cached(&ids)?;
        log::info!("expired {} stream keys", ids.len());
        self.inner.audit.log_action(
            AuditRecord::new(
                &ActorContext::system(),
                AuditAction::Update,
                ResourceType::StreamKey,
                "expired",
                format!("expired {} stream keys past their grace window", ids.len()),
            )
            .meta("count", ids.len()),
        )?;
        Ok(ids.len())
    }

    /// Run `cleanup_expired_keys` on the blocking pool every `interval`
    /// until aborted or the service is dropped.
    pub fn spawn_cleanup_task(&self, interval: Duration) -> Result<AbortHandle> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let service = StreamKeyRotationService { inner };
                match tokio::task::spawn_blocking(move || service.cleanup_expired_keys()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => log::warn!("stream key cleanup failed: {:#}", e),
                    Err(e) => log::error!("stream key cleanup panicked: {}", e),
                }
            }
        });
        let abort = handle.abort_handle();
        self.inner
            .tasks
            .lock()
            .map_err(|_| anyhow!("task list lock poisoned"))?
            .push(handle);
        Ok(abort)
    }

    // -------------------- Delivery --------------------

    /// Header lines and segment reference for one playlist segment under the
    /// stream's current key.
    pub async fn generate_playlist_entry(
        &self,
        stream_id: &str,
        segment_number: u64,
    ) -> Result<PlaylistEntry> {
        let slot = self.slot(stream_id)?;
        let slot = slot.lock().await;
        if slot.stopped {
            return Err(stream_not_found(stream_id));
        }
        Ok(PlaylistEntry {
            key_line: slot.state.key_line.clone(),
            extinf_line: format!("#EXTINF:{:.3},", self.inner.settings.segment_duration_s),
            segment_uri: segment_uri(&slot.state.playlist_url, segment_number),
        })
    }

    /// Raw key bytes for an active, unexpired key; `None` for anything else,
    /// including pending, expired, revoked and unknown keys.
    pub fn get_key_for_playlist(&self, key_id: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let now = self.inner.clock.now_s();
        {
            let cache = self
                .inner
                .keys
                .read()
                .map_err(|_| anyhow!("key cache lock poisoned"))?;
            if let Some(key) = cache.get(key_id) {
                if !key.is_servable(now) {
                    return Ok(None);
                }
                if !key.key.is_empty() {
                    return Ok(Some(key.key.clone()));
                }
            }
        }

        let Some(stored) = self.store()?.key(key_id)? else {
            return Ok(None);
        };
        if !stored.key.is_servable(now) {
            return Ok(None);
        }
        let key = self.key_with_material(key_id)?;
        let material = key.key.clone();
        self.cache_keys([&key])?;
        Ok(Some(material))
    }

    /// Player-facing key fetch: 200 with the raw key and no-cache headers,
    /// or 404.
    pub fn serve_key_request(&self, key_id: &str) -> Result<KeyResponse> {
        if validate_identifier("key", key_id).is_err() {
            return Ok(KeyResponse::not_found());
        }
        match self.get_key_for_playlist(key_id)? {
            Some(material) => Ok(KeyResponse::ok(material.to_vec())),
            None => {
                log::debug!("key request for unavailable key {}", key_id);
                Ok(KeyResponse::not_found())
            }
        }
    }

    // -------------------- Queries --------------------

    pub async fn stream_state(&self, stream_id: &str) -> Result<StreamEncryptionState> {
        let slot = self.slot(stream_id)?;
        let slot = slot.lock().await;
        if slot.stopped {
            return Err(stream_not_found(stream_id));
        }
        Ok(slot.state.clone())
    }

    pub fn rotation_history(&self, stream_id: &str) -> Result<Vec<KeyRotationEvent>> {
        self.store()?.events(stream_id)
    }

    pub fn active_streams(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .inner
            .streams
            .read()
            .map_err(|_| anyhow!("stream map lock poisoned"))?
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Stored record of a stream key, without material.
    pub fn stream_key(&self, key_id: &str) -> Result<Option<HlsKey>> {
        Ok(self.store()?.key(key_id)?.map(|stored| stored.key))
    }

    pub fn stream_keys(&self, stream_id: &str) -> Result<Vec<HlsKey>> {
        self.store()?.keys_for_stream(stream_id)
    }
}
