use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use custody_kernel::audit::{ActorContext, AuditAction, AuditFilter, AuditLog, ResourceType};
use custody_kernel::clock::{ManualClock, SECS_PER_DAY};
use custody_kernel::crypto::RootKey;
use custody_kernel::kms::{
    InMemoryKeyStore, KeyManagementService, KeyStatus, KmsSettings, SqliteKeyStore,
};
use custody_kernel::streaming::{
    CdnKeyDistributor, CdnKeyPush, CdnSyncPolicy, HlsKey, HlsKeyStatus, InMemoryStreamKeyStore,
    KeyRotationEvent, LoggingCdnDistributor, RotationConfig, RotationType, SqliteStreamKeyStore,
    StoredHlsKey, StreamEncryptionState, StreamKeyRotationService, StreamKeyStore,
    StreamingSettings,
};
use custody_kernel::{error_kind, ErrorKind};

const T0: u64 = 1_700_000_000;

/// Delegating store whose state commits can be made to fail.
struct FlakyStreamStore {
    inner: InMemoryStreamKeyStore,
    fail_commits: Arc<AtomicBool>,
}

impl StreamKeyStore for FlakyStreamStore {
    fn commit_state(
        &mut self,
        state: &StreamEncryptionState,
        updated: &[HlsKey],
        created: &[StoredHlsKey],
    ) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(anyhow!("database is locked"));
        }
        self.inner.commit_state(state, updated, created)
    }

    fn close_stream(&mut self, stream_id: &str, updated: &[HlsKey]) -> Result<()> {
        self.inner.close_stream(stream_id, updated)
    }

    fn update_keys(&mut self, updated: &[HlsKey]) -> Result<()> {
        self.inner.update_keys(updated)
    }

    fn key(&self, id: &str) -> Result<Option<StoredHlsKey>> {
        self.inner.key(id)
    }

    fn keys_for_stream(&self, stream_id: &str) -> Result<Vec<HlsKey>> {
        self.inner.keys_for_stream(stream_id)
    }

    fn expired_active_keys(&self, now_s: u64) -> Result<Vec<HlsKey>> {
        self.inner.expired_active_keys(now_s)
    }

    fn state(&self, stream_id: &str) -> Result<Option<StreamEncryptionState>> {
        self.inner.state(stream_id)
    }

    fn append_event(&mut self, event: &KeyRotationEvent) -> Result<()> {
        self.inner.append_event(event)
    }

    fn events(&self, stream_id: &str) -> Result<Vec<KeyRotationEvent>> {
        self.inner.events(stream_id)
    }
}

/// Records pushes and evictions; endpoints named `*-down` always fail.
#[derive(Default)]
struct RecordingCdn {
    pushed: Mutex<Vec<(String, String)>>,
    evicted: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl CdnKeyDistributor for RecordingCdn {
    async fn push_key(&self, endpoint: &str, push: &CdnKeyPush) -> Result<()> {
        if endpoint.ends_with("-down") {
            return Err(anyhow!("connection refused by {}", endpoint));
        }
        self.pushed
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .push((endpoint.to_string(), push.key_id.clone()));
        Ok(())
    }

    async fn evict_key(&self, endpoint: &str, _stream_id: &str, key_id: &str) -> Result<()> {
        self.evicted
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .push((endpoint.to_string(), key_id.to_string()));
        Ok(())
    }
}

/// Every push and eviction takes `delay` of tokio time.
struct SlowCdn {
    delay: Duration,
}

#[async_trait]
impl CdnKeyDistributor for SlowCdn {
    async fn push_key(&self, _endpoint: &str, _push: &CdnKeyPush) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn evict_key(&self, _endpoint: &str, _stream_id: &str, _key_id: &str) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

fn settings() -> StreamingSettings {
    StreamingSettings {
        cdn: CdnSyncPolicy {
            retries: 0,
            ..CdnSyncPolicy::default()
        },
        ..StreamingSettings::default()
    }
}

fn service(
    store: Box<dyn StreamKeyStore + Send>,
    cdn: Arc<dyn CdnKeyDistributor>,
    clock: Arc<ManualClock>,
) -> Result<(StreamKeyRotationService, Arc<AuditLog>)> {
    let audit = Arc::new(AuditLog::in_memory(SigningKey::from_bytes(&[8u8; 32]))?);
    let kms = Arc::new(KeyManagementService::new(
        Box::new(InMemoryKeyStore::new()),
        RootKey::from_seed("root:streams")?,
        audit.clone(),
        clock.clone(),
        KmsSettings::default(),
    ));
    let svc = StreamKeyRotationService::new(kms, audit.clone(), store, cdn, clock, settings());
    Ok((svc, audit))
}

fn operator() -> ActorContext {
    ActorContext::new("ops-1", "admin")
}

#[tokio::test]
async fn segment_count_drives_rotation_on_sqlite() -> Result<()> {
    let dir = TempDir::new()?;
    let db = dir.path().join("streams.db").to_string_lossy().into_owned();
    let clock = Arc::new(ManualClock::new(T0));
    let audit = Arc::new(AuditLog::in_memory(SigningKey::from_bytes(&[8u8; 32]))?);
    let kms = Arc::new(KeyManagementService::new(
        Box::new(SqliteKeyStore::open(&db)?),
        RootKey::from_seed("root:streams")?,
        audit.clone(),
        clock.clone(),
        KmsSettings::default(),
    ));
    let svc = StreamKeyRotationService::new(
        kms,
        audit,
        Box::new(SqliteStreamKeyStore::open(&db)?),
        Arc::new(LoggingCdnDistributor),
        clock,
        settings(),
    );
    let config = RotationConfig {
        segments_per_key: 10,
        ..RotationConfig::default()
    };
    svc.initialize_stream("cam-12", "https://cdn/cam-12/index.m3u8", vec![], Some(config), &operator())
        .await?;

    let mut rotations = 0;
    for _ in 0..100 {
        if let Some(event) = svc.update_segment_count("cam-12").await? {
            assert_eq!(event.rotation_type, RotationType::SegmentCount);
            assert_eq!(event.affected_segments, 10);
            rotations += 1;
        }
    }
    assert_eq!(rotations, 10);

    let state = svc.stream_state("cam-12").await?;
    assert_eq!(state.rotation_count, 10);
    assert_eq!(state.total_segments, 100);
    assert_eq!(state.segment_count, 0);
    assert_eq!(state.pending_key_ids.len(), 3);

    let history = svc.rotation_history("cam-12")?;
    assert_eq!(history.len(), 10);
    assert!(history.iter().all(|e| e.success));

    let entry = svc.generate_playlist_entry("cam-12", 101).await?;
    assert_eq!(entry.key_line, state.key_line);
    assert_eq!(entry.segment_uri, "https://cdn/cam-12/segment_101.ts");
    assert_eq!(entry.extinf_line, "#EXTINF:6.000,");
    svc.stop_stream("cam-12", &operator()).await?;
    Ok(())
}

#[tokio::test]
async fn replaced_key_is_served_through_the_grace_window() -> Result<()> {
    let clock = Arc::new(ManualClock::new(T0));
    let (svc, _audit) = service(
        Box::new(InMemoryStreamKeyStore::new()),
        Arc::new(LoggingCdnDistributor),
        clock.clone(),
    )?;
    let start = svc
        .initialize_stream("s1", "p.m3u8", vec![], None, &operator())
        .await?;
    let old = start.state.current_key_id.clone();

    svc.rotate_stream_key("s1", RotationType::Manual, &operator())
        .await?;
    assert_eq!(svc.stream_key(&old)?.and_then(|k| k.expires_at), Some(T0 + 300));
    assert_eq!(svc.serve_key_request(&old)?.status, 200);

    clock.advance(299);
    assert_eq!(svc.serve_key_request(&old)?.status, 200);
    assert_eq!(svc.cleanup_expired_keys()?, 0);

    clock.advance(1);
    assert_eq!(svc.serve_key_request(&old)?.status, 404);
    assert_eq!(svc.cleanup_expired_keys()?, 1);
    assert_eq!(
        svc.stream_key(&old)?.map(|k| k.status),
        Some(HlsKeyStatus::Expired)
    );

    let current = svc.stream_state("s1").await?.current_key_id;
    assert_eq!(svc.serve_key_request(&current)?.status, 200);
    Ok(())
}

#[tokio::test]
async fn emergency_rotation_revokes_and_evicts_immediately() -> Result<()> {
    let clock = Arc::new(ManualClock::new(T0));
    let cdn = Arc::new(RecordingCdn::default());
    let (svc, _audit) = service(
        Box::new(InMemoryStreamKeyStore::new()),
        cdn.clone(),
        clock,
    )?;
    let start = svc
        .initialize_stream("s1", "p.m3u8", vec!["edge-a".to_string()], None, &operator())
        .await?;
    let old = start.state.current_key_id.clone();
    assert_eq!(svc.serve_key_request(&old)?.status, 200);

    let event = svc
        .rotate_stream_key("s1", RotationType::Emergency, &operator())
        .await?;
    assert!(event.success);
    assert_eq!(svc.serve_key_request(&old)?.status, 404);
    assert_eq!(
        svc.stream_key(&old)?.map(|k| k.status),
        Some(HlsKeyStatus::Revoked)
    );

    let evicted = cdn.evicted.lock().map_err(|_| anyhow!("poisoned"))?.clone();
    assert_eq!(evicted, vec![("edge-a".to_string(), old)]);
    let pushed = cdn.pushed.lock().map_err(|_| anyhow!("poisoned"))?.clone();
    assert!(pushed.contains(&(
        "edge-a".to_string(),
        event.new_key_id.clone().unwrap_or_default()
    )));
    Ok(())
}

#[tokio::test]
async fn failed_commit_rolls_back_and_records_the_attempt() -> Result<()> {
    let fail = Arc::new(AtomicBool::new(false));
    let (svc, audit) = service(
        Box::new(FlakyStreamStore {
            inner: InMemoryStreamKeyStore::new(),
            fail_commits: fail.clone(),
        }),
        Arc::new(LoggingCdnDistributor),
        Arc::new(ManualClock::new(T0)),
    )?;
    let start = svc
        .initialize_stream("s1", "p.m3u8", vec![], None, &operator())
        .await?;

    fail.store(true, Ordering::SeqCst);
    let err = svc
        .rotate_stream_key("s1", RotationType::Manual, &operator())
        .await
        .err()
        .map(|e| format!("{:#}", e));
    assert!(err.unwrap_or_default().contains("database is locked"));

    let state = svc.stream_state("s1").await?;
    assert_eq!(state.current_key_id, start.state.current_key_id);
    assert_eq!(state.pending_key_ids, start.state.pending_key_ids);
    assert_eq!(state.rotation_count, 0);
    assert_eq!(svc.serve_key_request(&state.current_key_id)?.status, 200);

    let history = svc.rotation_history("s1")?;
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert!(history[0].new_key_id.is_none());

    let rotations = audit.entries(&AuditFilter {
        action: Some(AuditAction::Rotate),
        resource_type: Some(ResourceType::Stream),
        ..AuditFilter::default()
    })?;
    assert_eq!(rotations.len(), 1);
    assert!(!rotations[0].success);

    fail.store(false, Ordering::SeqCst);
    let event = svc
        .rotate_stream_key("s1", RotationType::Manual, &operator())
        .await?;
    assert_eq!(event.new_key_id, start.state.pending_key_ids.front().cloned());
    Ok(())
}

#[tokio::test]
async fn unreachable_cdn_endpoint_is_a_partial_sync_failure() -> Result<()> {
    let cdn = Arc::new(RecordingCdn::default());
    let (svc, audit) = service(
        Box::new(InMemoryStreamKeyStore::new()),
        cdn.clone(),
        Arc::new(ManualClock::new(T0)),
    )?;
    let endpoints = vec!["edge-a".to_string(), "edge-b-down".to_string()];
    let start = svc
        .initialize_stream("s1", "p.m3u8", endpoints, None, &operator())
        .await?;
    assert_eq!(start.cdn_sync.failed_endpoints(), vec!["edge-b-down"]);

    let event = svc
        .rotate_stream_key("s1", RotationType::Manual, &operator())
        .await?;
    assert!(event.success);
    assert_eq!(event.cdn_sync.endpoints.get("edge-a"), Some(&true));
    assert_eq!(event.cdn_sync.endpoints.get("edge-b-down"), Some(&false));
    let failure = event.partial_sync_failure();
    assert_eq!(failure.as_ref().map(|f| f.kind), Some(ErrorKind::PartialSyncFailure));

    let rotations = audit.entries(&AuditFilter {
        action: Some(AuditAction::Rotate),
        ..AuditFilter::default()
    })?;
    assert!(rotations
        .last()
        .map_or(false, |e| e.metadata.contains_key("partial_sync_failure")));
    Ok(())
}

#[tokio::test]
async fn key_delivery_headers_and_unknown_keys() -> Result<()> {
    let (svc, _audit) = service(
        Box::new(InMemoryStreamKeyStore::new()),
        Arc::new(LoggingCdnDistributor),
        Arc::new(ManualClock::new(T0)),
    )?;
    let start = svc
        .initialize_stream("s1", "p.m3u8", vec![], None, &operator())
        .await?;

    let ok = svc.serve_key_request(&start.state.current_key_id)?;
    assert_eq!(ok.status, 200);
    assert_eq!(ok.body.len(), 16);
    assert_eq!(ok.header("content-type"), Some("application/octet-stream"));
    assert_eq!(
        ok.header("Cache-Control"),
        Some("no-cache, no-store, must-revalidate")
    );

    let pending = start.state.pending_key_ids[0].clone();
    assert_eq!(svc.serve_key_request(&pending)?.status, 404);
    assert_eq!(svc.serve_key_request("hls_missing")?.status, 404);
    assert_eq!(svc.serve_key_request("../etc/passwd")?.status, 404);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rotation_timer_fires_after_interval() -> Result<()> {
    let (svc, _audit) = service(
        Box::new(InMemoryStreamKeyStore::new()),
        Arc::new(LoggingCdnDistributor),
        Arc::new(ManualClock::new(T0)),
    )?;
    svc.initialize_stream("s1", "p.m3u8", vec![], None, &operator())
        .await?;

    tokio::time::sleep(Duration::from_secs(29 * 60)).await;
    assert!(svc.rotation_history("s1")?.is_empty());

    tokio::time::sleep(Duration::from_secs(60 + 1)).await;
    for _ in 0..100 {
        if !svc.rotation_history("s1")?.is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    let history = svc.rotation_history("s1")?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].rotation_type, RotationType::Scheduled);
    assert_eq!(svc.stream_state("s1").await?.rotation_count, 1);

    svc.stop_stream("s1", &operator()).await?;
    let err = svc
        .rotate_stream_key("s1", RotationType::Manual, &operator())
        .await
        .err();
    assert_eq!(err.as_ref().and_then(error_kind), Some(ErrorKind::StreamNotFound));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scheduled_rotation_queues_behind_manual_rotation() -> Result<()> {
    let (svc, _audit) = service(
        Box::new(InMemoryStreamKeyStore::new()),
        Arc::new(SlowCdn {
            delay: Duration::from_secs(4),
        }),
        Arc::new(ManualClock::new(T0)),
    )?;
    let start = svc
        .initialize_stream("s1", "p.m3u8", vec!["edge-a".to_string()], None, &operator())
        .await?;

    // Start-up push ends at 0:04. The timer is due at 30:00; the manual
    // rotation holds the stream from 29:58 until its push ends at 30:02.
    tokio::time::sleep(Duration::from_secs(29 * 60 + 54)).await;
    let manual = {
        let svc = svc.clone();
        tokio::spawn(async move {
            svc.rotate_stream_key("s1", RotationType::Manual, &operator())
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(60)).await;
    let manual = manual.await??;

    for _ in 0..100 {
        if svc.rotation_history("s1")?.len() >= 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    let history = svc.rotation_history("s1")?;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|e| e.success));
    assert_eq!(history[0].rotation_type, RotationType::Manual);
    assert_eq!(history[1].rotation_type, RotationType::Scheduled);
    assert_eq!(history[0].new_key_id, manual.new_key_id);
    assert_eq!(history[0].old_key_id, Some(start.state.current_key_id.clone()));
    assert_eq!(history[1].old_key_id, history[0].new_key_id);
    assert_ne!(history[0].new_key_id, history[1].new_key_id);

    let state = svc.stream_state("s1").await?;
    assert_eq!(state.rotation_count, 2);
    assert_eq!(state.pending_key_ids.len(), 3);
    assert_eq!(Some(state.current_key_id), history[1].new_key_id.clone());
    Ok(())
}

#[tokio::test]
async fn stop_records_expired_key_count() -> Result<()> {
    let (svc, audit) = service(
        Box::new(InMemoryStreamKeyStore::new()),
        Arc::new(LoggingCdnDistributor),
        Arc::new(ManualClock::new(T0)),
    )?;
    svc.initialize_stream("s1", "p.m3u8", vec![], None, &operator())
        .await?;
    svc.rotate_stream_key("s1", RotationType::Manual, &operator())
        .await?;
    svc.stop_stream("s1", &operator()).await?;

    let stops = audit.entries(&AuditFilter {
        action: Some(AuditAction::Delete),
        resource_type: Some(ResourceType::Stream),
        ..AuditFilter::default()
    })?;
    assert_eq!(stops.len(), 1);
    assert!(stops[0].success);
    // Current, three pending and the replaced key still in its grace window.
    assert_eq!(
        stops[0].metadata.get("expired_keys").map(String::as_str),
        Some("5")
    );

    let err = svc.stop_stream("s1", &operator()).await.err();
    assert_eq!(err.as_ref().and_then(error_kind), Some(ErrorKind::StreamNotFound));
    Ok(())
}

#[tokio::test]
async fn sealed_stream_keys_hold_back_master_destruction() -> Result<()> {
    let clock = Arc::new(ManualClock::new(T0));
    let audit = Arc::new(AuditLog::in_memory(SigningKey::from_bytes(&[8u8; 32]))?);
    let kms = Arc::new(KeyManagementService::new(
        Box::new(InMemoryKeyStore::new()),
        RootKey::from_seed("root:streams")?,
        audit.clone(),
        clock.clone(),
        KmsSettings::default(),
    ));
    let svc = StreamKeyRotationService::new(
        kms.clone(),
        audit,
        Box::new(InMemoryStreamKeyStore::new()),
        Arc::new(LoggingCdnDistributor),
        clock.clone(),
        settings(),
    );
    let start = svc
        .initialize_stream("s1", "p.m3u8", vec![], None, &operator())
        .await?;
    let master = kms.resolve_active_key("streaming-key")?;
    svc.stop_stream("s1", &operator()).await?;

    kms.delete_key(&master.id, 7, &operator())?;
    clock.advance(8 * SECS_PER_DAY);
    let report = kms.destroy_expired_keys(&|_| Ok(0), &operator())?;
    assert!(report.destroyed.is_empty());
    assert_eq!(report.deferred.len(), 1);
    assert_eq!(report.deferred[0].id, master.id);
    assert_eq!(kms.master_key(&master.id)?.status, KeyStatus::PendingDeletion);
    assert!(svc.stream_key(&start.state.current_key_id)?.is_some());
    Ok(())
}

#[tokio::test]
async fn cleanup_task_expires_keys_past_grace() -> Result<()> {
    let clock = Arc::new(ManualClock::new(T0));
    let (svc, _audit) = service(
        Box::new(InMemoryStreamKeyStore::new()),
        Arc::new(LoggingCdnDistributor),
        clock.clone(),
    )?;
    let start = svc
        .initialize_stream("s1", "p.m3u8", vec![], None, &operator())
        .await?;
    let old = start.state.current_key_id.clone();
    svc.rotate_stream_key("s1", RotationType::Manual, &operator())
        .await?;
    clock.advance(301);

    let cleanup = svc.spawn_cleanup_task(Duration::from_millis(10))?;
    let mut status = None;
    for _ in 0..200 {
        status = svc.stream_key(&old)?.map(|k| k.status);
        if status == Some(HlsKeyStatus::Expired) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cleanup.abort();
    assert_eq!(status, Some(HlsKeyStatus::Expired));
    assert_eq!(svc.serve_key_request(&old)?.status, 404);
    Ok(())
}
