//! audit_verify - external verifier for the custody audit chain
//!
//! Replays the stored chain from genesis or from the latest retention
//! checkpoint, checking every Ed25519 signature, chain link and sequence
//! number. Read-only: nothing is appended to the log being verified.
//!
//! Exits non-zero when any entry fails to verify.

use anyhow::{anyhow, Result};
use clap::Parser;
use ed25519_dalek::VerifyingKey;

use custody_kernel::audit::{verify_chain, AuditFilter, AuditStore, SqliteAuditStore, VerifyRange};
use custody_kernel::crypto::signatures::{verifying_key_from_bytes, verifying_key_from_hex};
use custody_kernel::ui::{Ui, UiMode};

#[derive(Parser, Debug)]
#[command(
    name = "audit_verify",
    about = "Verify custody audit log integrity (hash chain + signatures)"
)]
struct Args {
    /// Path to the custody SQLite DB
    #[arg(long, default_value = "custody.db", env = "CUSTODY_DB_PATH")]
    db: String,

    /// Audit public key (hex-encoded Ed25519 verifying key)
    #[arg(long, value_name = "HEX", conflicts_with = "public_key_file")]
    public_key: Option<String>,

    /// Path to file containing the hex-encoded audit public key
    #[arg(long, value_name = "PATH", conflicts_with = "public_key")]
    public_key_file: Option<String>,

    /// First sequence number to report on
    #[arg(long)]
    from_sequence: Option<u64>,

    /// Last sequence number to report on
    #[arg(long)]
    to_sequence: Option<u64>,

    /// Print every invalid entry
    #[arg(short, long)]
    verbose: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: UiMode,
}

fn load_verifying_key(store: &SqliteAuditStore, args: &Args) -> Result<VerifyingKey> {
    if let Some(hex_key) = &args.public_key {
        return verifying_key_from_hex(hex_key);
    }
    if let Some(path) = &args.public_key_file {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read public key file {}: {}", path, e))?;
        return verifying_key_from_hex(raw.trim());
    }
    let stored = store
        .verifying_key()?
        .ok_or_else(|| anyhow!("no audit public key stored; pass --public-key"))?;
    verifying_key_from_bytes(&stored)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = Ui::new(args.ui);

    let store = {
        let _stage = ui.stage("Open database");
        SqliteAuditStore::open(&args.db)?
    };
    let verifying_key = {
        let _stage = ui.stage("Load verifying key");
        load_verifying_key(&store, &args)?
    };
    let report = {
        let mut stage = ui.stage("Verify audit chain");
        let checkpoint = store.latest_checkpoint()?;
        let entries = store.entries(&AuditFilter::default())?;
        let report = verify_chain(
            &entries,
            checkpoint.as_ref(),
            &verifying_key,
            VerifyRange {
                from_sequence: args.from_sequence,
                to_sequence: args.to_sequence,
            },
        );
        if !report.is_valid() {
            stage.fail();
        }
        report
    };

    println!("audit_verify: {}", args.db);
    println!("public key: {}", hex::encode(verifying_key.to_bytes()));
    if report.from_checkpoint {
        println!("replay: from retention checkpoint");
    } else {
        println!("replay: from genesis");
    }
    println!("checked: {} entries", report.checked);

    if report.is_valid() {
        println!("OK: chain intact");
        return Ok(());
    }

    println!(
        "FAILED: {} invalid entries, chain broken at sequence {}",
        report.invalid_entries.len(),
        report
            .first_broken_sequence
            .map_or_else(|| "-".to_string(), |s| s.to_string())
    );
    if args.verbose {
        for entry in &report.invalid_entries {
            println!("  #{} {}: {}", entry.sequence, entry.id, entry.reason);
        }
    }
    Err(anyhow!("audit chain verification failed"))
}
