//! audit_export - filtered export of the custody audit log
//!
//! Renders matching entries as JSON, CSV or XML. The export is itself an
//! audited action: the document is written only after the export entry has
//! been appended to the chain, so this tool needs the database's signing
//! seed.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use custody_kernel::audit::{ActorContext, AuditAction, AuditFilter, ExportFormat, ResourceType};
use custody_kernel::clock::SystemClock;
use custody_kernel::runtime::open_audit_log;
use custody_kernel::ui::{Ui, UiMode};
use custody_kernel::CustodyConfig;

#[derive(Parser, Debug)]
#[command(name = "audit_export", about = "Export custody audit entries (json|csv|xml)")]
struct Args {
    /// Config file; its db_path and seed paths are used
    #[arg(long, env = "CUSTODY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "json")]
    format: ExportFormat,

    /// Write to this file instead of stdout
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Only entries at or after this unix timestamp
    #[arg(long)]
    from: Option<u64>,

    /// Only entries at or before this unix timestamp
    #[arg(long)]
    to: Option<u64>,

    #[arg(long)]
    actor_id: Option<String>,

    #[arg(long)]
    action: Option<AuditAction>,

    #[arg(long)]
    resource_type: Option<ResourceType>,

    #[arg(long)]
    resource_id: Option<String>,

    #[arg(long)]
    limit: Option<usize>,

    /// Identity recorded as the exporting actor
    #[arg(long, default_value = "audit_export")]
    export_actor: String,

    /// Role recorded for the exporting actor
    #[arg(long, default_value = "auditor")]
    export_role: String,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = Ui::new(args.ui);

    let config = CustodyConfig::load_from(args.config.as_deref())?;
    if config.db_path == ":memory:" {
        return Err(anyhow!("audit_export needs a persistent db_path"));
    }
    let audit = {
        let _stage = ui.stage("Open audit log");
        open_audit_log(&config, Arc::new(SystemClock))?
    };

    let filter = AuditFilter {
        from_timestamp: args.from,
        to_timestamp: args.to,
        actor_id: args.actor_id.clone(),
        action: args.action,
        resource_type: args.resource_type,
        resource_id: args.resource_id.clone(),
        limit: args.limit,
        ..AuditFilter::default()
    };
    let actor = ActorContext::new(args.export_actor.clone(), args.export_role.clone());
    let document = {
        let _stage = ui.stage(&format!("Export as {}", args.format.as_str()));
        audit.export(args.format, &filter, &actor)?
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, document.as_bytes())
                .map_err(|e| anyhow!("failed to write {}: {}", path.display(), e))?;
            eprintln!("wrote {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(document.as_bytes())?;
            stdout.write_all(b"\n")?;
        }
    }
    Ok(())
}
