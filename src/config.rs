use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::{seed_path_for_db, ROOT_SEED_EXTENSION, SIGNING_SEED_EXTENSION};
use crate::envelope::EnvelopeSettings;
use crate::kms::KmsSettings;
use crate::streaming::{CdnSyncPolicy, RotationConfig, StreamingSettings};

const DEFAULT_DB_PATH: &str = "custody.db";
const DEFAULT_ROTATION_SCAN_SECS: u64 = 60 * 60;
const DEFAULT_STREAM_CLEANUP_SECS: u64 = 60;
const DEFAULT_RETENTION_SCAN_SECS: u64 = 60 * 60 * 24;

#[derive(Debug, Deserialize, Default)]
struct CustodyConfigFile {
    db_path: Option<String>,
    audit: Option<AuditConfigFile>,
    kms: Option<KmsConfigFile>,
    streaming: Option<StreamingConfigFile>,
    envelope: Option<EnvelopeConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct AuditConfigFile {
    signing_seed_path: Option<PathBuf>,
    retention_days: Option<u32>,
    retention_scan_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct KmsConfigFile {
    root_seed_path: Option<PathBuf>,
    data_key_max_uses: Option<u64>,
    min_deletion_grace_days: Option<u32>,
    admin_roles: Option<Vec<String>>,
    rotation_scan_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamingConfigFile {
    master_key_alias: Option<String>,
    key_base_url: Option<String>,
    grace_secs: Option<u64>,
    segment_duration_s: Option<f64>,
    cleanup_interval_secs: Option<u64>,
    cdn_fanout: Option<usize>,
    cdn_timeout_ms: Option<u64>,
    cdn_retries: Option<u32>,
    cdn_backoff_ms: Option<u64>,
    rotation: Option<RotationConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct EnvelopeConfigFile {
    compression_level: Option<u8>,
    default_key_roles: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct CustodyConfig {
    pub db_path: String,
    pub audit: AuditConfig,
    pub kms: KmsConfig,
    pub streaming: StreamingConfig,
    pub envelope: EnvelopeSettings,
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub signing_seed_path: Option<PathBuf>,
    /// Entries older than this are checkpointed and pruned; `None` keeps
    /// everything.
    pub retention: Option<Duration>,
    pub retention_scan_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct KmsConfig {
    pub root_seed_path: Option<PathBuf>,
    pub rotation_scan_interval: Duration,
    pub settings: KmsSettings,
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub cleanup_interval: Duration,
    pub settings: StreamingSettings,
}

impl CustodyConfig {
    /// Defaults, then the file named by `CUSTODY_CONFIG` (JSON, or TOML for
    /// a `.toml` path), then `CUSTODY_*` environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = env_nonempty("CUSTODY_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like [`load`](Self::load) with an explicit config file.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CustodyConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let audit_file = file.audit.unwrap_or_default();
        let audit = AuditConfig {
            signing_seed_path: audit_file.signing_seed_path,
            retention: audit_file
                .retention_days
                .map(|days| Duration::from_secs(u64::from(days) * crate::clock::SECS_PER_DAY)),
            retention_scan_interval: Duration::from_secs(
                audit_file
                    .retention_scan_secs
                    .unwrap_or(DEFAULT_RETENTION_SCAN_SECS),
            ),
        };

        let kms_file = file.kms.unwrap_or_default();
        let kms_defaults = KmsSettings::default();
        let kms = KmsConfig {
            root_seed_path: kms_file.root_seed_path,
            rotation_scan_interval: Duration::from_secs(
                kms_file.rotation_scan_secs.unwrap_or(DEFAULT_ROTATION_SCAN_SECS),
            ),
            settings: KmsSettings {
                data_key_max_uses: kms_file
                    .data_key_max_uses
                    .unwrap_or(kms_defaults.data_key_max_uses),
                min_deletion_grace_days: kms_file
                    .min_deletion_grace_days
                    .unwrap_or(kms_defaults.min_deletion_grace_days),
                admin_roles: kms_file
                    .admin_roles
                    .map(|roles| roles.into_iter().collect())
                    .unwrap_or(kms_defaults.admin_roles),
            },
        };

        let stream_file = file.streaming.unwrap_or_default();
        let stream_defaults = StreamingSettings::default();
        let cdn_defaults = CdnSyncPolicy::default();
        let streaming = StreamingConfig {
            cleanup_interval: Duration::from_secs(
                stream_file
                    .cleanup_interval_secs
                    .unwrap_or(DEFAULT_STREAM_CLEANUP_SECS),
            ),
            settings: StreamingSettings {
                master_key_alias: stream_file
                    .master_key_alias
                    .unwrap_or(stream_defaults.master_key_alias),
                master_key_rotation_days: stream_defaults.master_key_rotation_days,
                key_base_url: stream_file
                    .key_base_url
                    .unwrap_or(stream_defaults.key_base_url),
                grace_period: stream_file
                    .grace_secs
                    .map(Duration::from_secs)
                    .unwrap_or(stream_defaults.grace_period),
                segment_duration_s: stream_file
                    .segment_duration_s
                    .unwrap_or(stream_defaults.segment_duration_s),
                cdn: CdnSyncPolicy {
                    fanout: stream_file.cdn_fanout.unwrap_or(cdn_defaults.fanout),
                    timeout: stream_file
                        .cdn_timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(cdn_defaults.timeout),
                    retries: stream_file.cdn_retries.unwrap_or(cdn_defaults.retries),
                    backoff: stream_file
                        .cdn_backoff_ms
                        .map(Duration::from_millis)
                        .unwrap_or(cdn_defaults.backoff),
                },
                default_rotation: stream_file
                    .rotation
                    .unwrap_or(stream_defaults.default_rotation),
            },
        };

        let envelope_file = file.envelope.unwrap_or_default();
        let envelope_defaults = EnvelopeSettings::default();
        let envelope = EnvelopeSettings {
            compression_level: envelope_file
                .compression_level
                .unwrap_or(envelope_defaults.compression_level),
            default_key_roles: envelope_file
                .default_key_roles
                .map(|roles| roles.into_iter().collect())
                .unwrap_or(envelope_defaults.default_key_roles),
        };

        Self {
            db_path,
            audit,
            kms,
            streaming,
            envelope,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("CUSTODY_DB_PATH") {
            self.db_path = path;
        }
        if let Some(path) = env_nonempty("CUSTODY_ROOT_SEED_PATH") {
            self.kms.root_seed_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_nonempty("CUSTODY_SIGNING_SEED_PATH") {
            self.audit.signing_seed_path = Some(PathBuf::from(path));
        }
        if let Some(roles) = env_nonempty("CUSTODY_ADMIN_ROLES") {
            let parsed: BTreeSet<String> = split_csv(&roles).into_iter().collect();
            if !parsed.is_empty() {
                self.kms.settings.admin_roles = parsed;
            }
        }
        if let Some(days) = env_nonempty("CUSTODY_AUDIT_RETENTION_DAYS") {
            let days: u64 = days.parse().map_err(|_| {
                anyhow!("CUSTODY_AUDIT_RETENTION_DAYS must be an integer number of days")
            })?;
            self.audit.retention = Some(Duration::from_secs(days * crate::clock::SECS_PER_DAY));
        }
        if let Some(url) = env_nonempty("CUSTODY_KEY_BASE_URL") {
            self.streaming.settings.key_base_url = url;
        }
        if let Some(grace) = env_nonempty("CUSTODY_STREAM_GRACE_SECS") {
            let seconds: u64 = grace.parse().map_err(|_| {
                anyhow!("CUSTODY_STREAM_GRACE_SECS must be an integer number of seconds")
            })?;
            self.streaming.settings.grace_period = Duration::from_secs(seconds);
        }
        if let Some(fanout) = env_nonempty("CUSTODY_CDN_FANOUT") {
            self.streaming.settings.cdn.fanout = fanout
                .parse()
                .map_err(|_| anyhow!("CUSTODY_CDN_FANOUT must be a positive integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.kms.settings.data_key_max_uses == 0 {
            return Err(anyhow!("kms.data_key_max_uses must be greater than zero"));
        }
        if self.kms.settings.admin_roles.is_empty() {
            return Err(anyhow!("kms.admin_roles must name at least one role"));
        }
        if self.kms.rotation_scan_interval.is_zero() {
            return Err(anyhow!("kms.rotation_scan_secs must be greater than zero"));
        }
        if matches!(self.audit.retention, Some(r) if r.is_zero()) {
            return Err(anyhow!("audit.retention_days must be greater than zero"));
        }
        if self.audit.retention_scan_interval.is_zero() {
            return Err(anyhow!("audit.retention_scan_secs must be greater than zero"));
        }
        let streaming = &self.streaming.settings;
        if self.streaming.cleanup_interval.is_zero() {
            return Err(anyhow!("streaming.cleanup_interval_secs must be greater than zero"));
        }
        if streaming.cdn.fanout == 0 {
            return Err(anyhow!("streaming.cdn_fanout must be greater than zero"));
        }
        if streaming.cdn.timeout.is_zero() {
            return Err(anyhow!("streaming.cdn_timeout_ms must be greater than zero"));
        }
        if !(streaming.segment_duration_s > 0.0) {
            return Err(anyhow!("streaming.segment_duration_s must be positive"));
        }
        if streaming.key_base_url.trim().is_empty() {
            return Err(anyhow!("streaming.key_base_url must not be empty"));
        }
        streaming.default_rotation.validate()?;
        if self.envelope.compression_level > 10 {
            return Err(anyhow!("envelope.compression_level must be between 0 and 10"));
        }
        Ok(())
    }

    /// Root key seed file; next to the database unless configured.
    pub fn root_seed_path(&self) -> Result<PathBuf> {
        match &self.kms.root_seed_path {
            Some(path) => Ok(path.clone()),
            None => seed_path_for_db(&self.db_path, ROOT_SEED_EXTENSION),
        }
    }

    /// Audit signing seed file; next to the database unless configured.
    pub fn signing_seed_path(&self) -> Result<PathBuf> {
        match &self.audit.signing_seed_path {
            Some(path) => Ok(path.clone()),
            None => seed_path_for_db(&self.db_path, SIGNING_SEED_EXTENSION),
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<CustodyConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
