//! custodyd - custody kernel daemon
//!
//! Opens the stores and services, creates the default per-purpose master
//! keys, and runs the background maintenance loops: scheduled master key
//! rotation with purge of keys past their deletion date, expiry of stream
//! keys past their grace window, and audit retention. Stops on Ctrl-C.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use custody_kernel::audit::ActorContext;
use custody_kernel::streaming::CdnKeyDistributor;
use custody_kernel::runtime::spawn_periodic;
use custody_kernel::{CustodyConfig, CustodyRuntime};

#[derive(Parser, Debug)]
#[command(name = "custodyd", about = "Custody kernel daemon")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "CUSTODY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verify the audit chain once at startup
    #[arg(long)]
    verify_on_start: bool,
}

fn cdn_distributor() -> Arc<dyn CdnKeyDistributor> {
    #[cfg(feature = "cdn-http")]
    {
        Arc::new(custody_kernel::streaming::HttpCdnDistributor::new())
    }
    #[cfg(not(feature = "cdn-http"))]
    {
        Arc::new(custody_kernel::streaming::LoggingCdnDistributor)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = CustodyConfig::load_from(args.config.as_deref())?;
    let runtime = CustodyRuntime::open(config, cdn_distributor())?;
    let system = ActorContext::system();
    log::info!(
        "custodyd: db={} audit_key={}",
        runtime.config.db_path,
        hex::encode(runtime.audit.verifying_key().to_bytes())
    );

    if args.verify_on_start {
        let report = runtime
            .audit
            .verify_integrity(custody_kernel::audit::VerifyRange::all(), &system)?;
        if report.is_valid() {
            log::info!("audit chain intact ({} entries)", report.checked);
        } else {
            log::error!(
                "audit chain broken at sequence {:?}; {} entries invalid",
                report.first_broken_sequence,
                report.invalid_entries.len()
            );
        }
    }

    let created = runtime.envelopes.bootstrap_default_keys(&system)?;
    for key in &created {
        log::info!("bootstrapped master key {} ({})", key.alias, key.id);
    }

    let mut tasks = Vec::new();
    {
        let kms = runtime.kms.clone();
        let envelopes = runtime.envelopes.clone();
        let system = system.clone();
        tasks.push(spawn_periodic(
            runtime.config.kms.rotation_scan_interval,
            "key maintenance",
            move || {
                let report = kms.schedule_key_rotation(&system)?;
                for summary in report.rotated.iter().filter(|s| s.requires_migration) {
                    log::warn!(
                        "master key {} rotated with {} data keys left to migrate",
                        summary.old_key_id,
                        summary.failed.len()
                    );
                }
                let destroyed = envelopes.purge_deleted_keys(&system)?;
                if !destroyed.deferred.is_empty() {
                    log::warn!(
                        "{} master keys past deletion date still protect data",
                        destroyed.deferred.len()
                    );
                }
                Ok(())
            },
        ));
    }
    let cleanup = runtime
        .streams
        .spawn_cleanup_task(runtime.config.streaming.cleanup_interval)?;
    if let Some(retention) = runtime.config.audit.retention {
        let audit = runtime.audit.clone();
        let system = system.clone();
        tasks.push(spawn_periodic(
            runtime.config.audit.retention_scan_interval,
            "audit retention",
            move || audit.enforce_retention(retention, &system).map(|_| ()),
        ));
    }

    log::info!("custodyd running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    log::info!("custodyd shutting down");

    cleanup.abort();
    for task in tasks {
        task.abort();
    }
    for stream_id in runtime.streams.active_streams()? {
        if let Err(e) = runtime.streams.stop_stream(&stream_id, &system).await {
            log::warn!("failed to stop stream {}: {:#}", stream_id, e);
        }
    }
    Ok(())
}
