use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use custody_kernel::config::CustodyConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CUSTODY_CONFIG",
        "CUSTODY_DB_PATH",
        "CUSTODY_ROOT_SEED_PATH",
        "CUSTODY_SIGNING_SEED_PATH",
        "CUSTODY_ADMIN_ROLES",
        "CUSTODY_AUDIT_RETENTION_DAYS",
        "CUSTODY_KEY_BASE_URL",
        "CUSTODY_STREAM_GRACE_SECS",
        "CUSTODY_CDN_FANOUT",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "/var/lib/custody/prod.db",
        "audit": { "retention_days": 2555 },
        "kms": {
            "data_key_max_uses": 5000,
            "admin_roles": ["admin", "custodian"]
        },
        "streaming": {
            "key_base_url": "https://keys.example/hls",
            "grace_secs": 600,
            "cdn_retries": 4,
            "rotation": { "segments_per_key": 250, "rotation_interval_minutes": 15 }
        },
        "envelope": { "compression_level": 9 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("CUSTODY_CONFIG", file.path());
    std::env::set_var("CUSTODY_ADMIN_ROLES", "admin, security_officer ,system");
    std::env::set_var("CUSTODY_STREAM_GRACE_SECS", "120");

    let cfg = CustodyConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "/var/lib/custody/prod.db");
    assert_eq!(
        cfg.audit.retention,
        Some(Duration::from_secs(2555 * 24 * 60 * 60))
    );
    assert_eq!(cfg.kms.settings.data_key_max_uses, 5000);
    let roles: Vec<&str> = cfg.kms.settings.admin_roles.iter().map(String::as_str).collect();
    assert_eq!(roles, vec!["admin", "security_officer", "system"]);
    assert_eq!(cfg.streaming.settings.key_base_url, "https://keys.example/hls");
    assert_eq!(cfg.streaming.settings.grace_period, Duration::from_secs(120));
    assert_eq!(cfg.streaming.settings.cdn.retries, 4);
    assert_eq!(cfg.streaming.settings.default_rotation.segments_per_key, 250);
    assert_eq!(
        cfg.streaming.settings.default_rotation.rotation_interval_minutes,
        15
    );
    assert_eq!(cfg.streaming.settings.default_rotation.pre_generate_count, 3);
    assert_eq!(cfg.envelope.compression_level, 9);
    assert_eq!(
        cfg.root_seed_path().unwrap(),
        PathBuf::from("/var/lib/custody/prod.root.seed")
    );

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
db_path = "custody_staging.db"

[audit]
signing_seed_path = "/etc/custody/audit.seed"

[streaming]
segment_duration_s = 4.0
cdn_fanout = 2
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    std::env::set_var("CUSTODY_DB_PATH", "custody_override.db");
    let cfg = CustodyConfig::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.db_path, "custody_override.db");
    assert_eq!(
        cfg.signing_seed_path().unwrap(),
        PathBuf::from("/etc/custody/audit.seed")
    );
    assert_eq!(cfg.streaming.settings.segment_duration_s, 4.0);
    assert_eq!(cfg.streaming.settings.cdn.fanout, 2);
    assert_eq!(cfg.audit.retention, None);
    assert_eq!(cfg.kms.rotation_scan_interval, Duration::from_secs(3600));

    clear_env();
}

#[test]
fn defaults_apply_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CustodyConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "custody.db");
    assert_eq!(cfg.streaming.settings.grace_period, Duration::from_secs(300));
    assert_eq!(cfg.streaming.cleanup_interval, Duration::from_secs(60));
    assert!(cfg.kms.settings.admin_roles.contains("system"));
    assert_eq!(
        cfg.signing_seed_path().unwrap(),
        PathBuf::from("custody.ed25519.seed")
    );
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "streaming": { "rotation": { "segments_per_key": 0 } } }"#)
        .expect("write config");
    let err = CustodyConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("segments_per_key"));

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "envelope": { "compression_level": 11 } }"#)
        .expect("write config");
    assert!(CustodyConfig::load_from(Some(file.path())).is_err());

    std::env::set_var("CUSTODY_CDN_FANOUT", "many");
    let err = CustodyConfig::load().unwrap_err();
    assert!(err.to_string().contains("CUSTODY_CDN_FANOUT"));

    std::env::set_var("CUSTODY_CDN_FANOUT", "0");
    assert!(CustodyConfig::load().is_err());

    clear_env();
    std::env::set_var("CUSTODY_AUDIT_RETENTION_DAYS", "0");
    assert!(CustodyConfig::load().is_err());

    clear_env();
}
