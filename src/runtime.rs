//! Wiring of stores and services from a [`CustodyConfig`].

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::audit::{AuditLog, LogComplianceReporter, SqliteAuditStore};
use crate::clock::{Clock, SystemClock};
use crate::config::CustodyConfig;
use crate::crypto::{load_or_create_seed, random_id, signing_key_from_seed, RootKey};
use crate::envelope::{EnvelopeEncryptionService, SqliteEnvelopeStore};
use crate::kms::{KeyManagementService, SqliteKeyStore};
use crate::streaming::{CdnKeyDistributor, SqliteStreamKeyStore, StreamKeyRotationService};

const ROOT_SEED_ENV: &str = "CUSTODY_ROOT_KEY_SEED";
const SIGNING_SEED_ENV: &str = "CUSTODY_SIGNING_SEED";

pub struct CustodyRuntime {
    pub config: CustodyConfig,
    pub audit: Arc<AuditLog>,
    pub kms: Arc<KeyManagementService>,
    pub envelopes: Arc<EnvelopeEncryptionService>,
    pub streams: StreamKeyRotationService,
}

fn is_memory_db(db_path: &str) -> bool {
    db_path == ":memory:" || db_path.contains("mode=memory")
}

/// Seed from the configured file, pinned by `env` when set. In-memory
/// databases without a configured seed file get an ephemeral seed.
fn resolve_seed(
    configured: Option<&PathBuf>,
    default_path: impl FnOnce() -> Result<PathBuf>,
    memory: bool,
    env: &str,
    prefix: &str,
) -> Result<String> {
    let provided = std::env::var(env).ok().filter(|s| !s.trim().is_empty());
    let path = match configured {
        Some(path) => path.clone(),
        None if memory => {
            return Ok(provided.unwrap_or_else(|| random_id(prefix)));
        }
        None => default_path()?,
    };
    load_or_create_seed(&path, provided.as_deref(), prefix)
}

/// The audit log of `config`'s database, opened with the persistent signing
/// key. Fails if the database was sealed by a different key.
pub fn open_audit_log(config: &CustodyConfig, clock: Arc<dyn Clock>) -> Result<Arc<AuditLog>> {
    let db_path = effective_db_path(config);
    let seed = resolve_seed(
        config.audit.signing_seed_path.as_ref(),
        || config.signing_seed_path(),
        is_memory_db(&config.db_path),
        SIGNING_SEED_ENV,
        "audit",
    )?;
    let audit = AuditLog::open(
        Arc::new(SqliteAuditStore::open(&db_path)?),
        signing_key_from_seed(&seed)?,
        clock,
        Arc::new(LogComplianceReporter),
    )?;
    Ok(Arc::new(audit))
}

fn effective_db_path(config: &CustodyConfig) -> String {
    if config.db_path == ":memory:" {
        crate::shared_memory_uri()
    } else {
        config.db_path.clone()
    }
}

/// Run `tick` every `period` on the blocking pool, skipping the immediate
/// first tick. Errors are logged and the loop keeps going.
pub fn spawn_periodic<F>(period: Duration, name: &'static str, tick: F) -> JoinHandle<()>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    let tick = Arc::new(tick);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let work = tick.clone();
            match tokio::task::spawn_blocking(move || work()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("{} failed: {:#}", name, e),
                Err(e) => log::error!("{} panicked: {}", name, e),
            }
        }
    })
}

impl CustodyRuntime {
    pub fn open(config: CustodyConfig, cdn: Arc<dyn CdnKeyDistributor>) -> Result<Self> {
        let mut config = config;
        config.db_path = effective_db_path(&config);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let memory = is_memory_db(&config.db_path);

        let audit = open_audit_log(&config, clock.clone())?;
        let root_seed = resolve_seed(
            config.kms.root_seed_path.as_ref(),
            || config.root_seed_path(),
            memory,
            ROOT_SEED_ENV,
            "root",
        )?;
        let kms = Arc::new(KeyManagementService::new(
            Box::new(SqliteKeyStore::open(&config.db_path)?),
            RootKey::from_seed(&root_seed)?,
            audit.clone(),
            clock.clone(),
            config.kms.settings.clone(),
        ));
        let envelopes = Arc::new(EnvelopeEncryptionService::new(
            kms.clone(),
            audit.clone(),
            Box::new(SqliteEnvelopeStore::open(&config.db_path)?),
            clock.clone(),
            config.envelope.clone(),
        ));
        let streams = StreamKeyRotationService::new(
            kms.clone(),
            audit.clone(),
            Box::new(SqliteStreamKeyStore::open(&config.db_path)?),
            cdn,
            clock,
            config.streaming.settings.clone(),
        );
        log::info!("custody runtime opened on {}", config.db_path);
        Ok(Self {
            config,
            audit,
            kms,
            envelopes,
            streams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    #[tokio::test]
    async fn periodic_work_runs_off_the_runtime_thread_and_survives_errors() -> Result<()> {
        let runtime_thread = std::thread::current().id();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let seen = seen.clone();
            spawn_periodic(Duration::from_millis(10), "test tick", move || {
                let mut seen = seen.lock().map_err(|_| anyhow!("poisoned"))?;
                seen.push(std::thread::current().id());
                if seen.len() == 1 {
                    return Err(anyhow!("first tick fails"));
                }
                Ok(())
            })
        };
        for _ in 0..200 {
            if seen.lock().map_err(|_| anyhow!("poisoned"))?.len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        let seen = seen.lock().map_err(|_| anyhow!("poisoned"))?;
        assert!(seen.len() >= 3, "only {} ticks ran", seen.len());
        assert!(seen.iter().all(|id| *id != runtime_thread));
        Ok(())
    }
}
