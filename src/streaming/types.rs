use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use zeroize::Zeroizing;

use crate::error::{CustodyError, ErrorKind};

pub const HLS_KEY_LEN: usize = 16;
pub const HLS_IV_LEN: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyMethod {
    #[default]
    #[serde(rename = "AES-128")]
    Aes128,
    #[serde(rename = "SAMPLE-AES")]
    SampleAes,
}

impl KeyMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyMethod::Aes128 => "AES-128",
            KeyMethod::SampleAes => "SAMPLE-AES",
        }
    }
}

impl std::str::FromStr for KeyMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AES-128" => Ok(KeyMethod::Aes128),
            "SAMPLE-AES" => Ok(KeyMethod::SampleAes),
            other => Err(anyhow!("unknown key method: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HlsKeyStatus {
    /// Pre-generated, never served.
    Pending,
    Active,
    Expired,
    Revoked,
}

impl HlsKeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HlsKeyStatus::Pending => "pending",
            HlsKeyStatus::Active => "active",
            HlsKeyStatus::Expired => "expired",
            HlsKeyStatus::Revoked => "revoked",
        }
    }
}

fn no_key_material() -> Zeroizing<Vec<u8>> {
    Zeroizing::new(Vec::new())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HlsKey {
    pub id: String,
    /// Raw AES-128 key. Persisted only sealed through the KMS.
    #[serde(skip, default = "no_key_material")]
    pub key: Zeroizing<Vec<u8>>,
    pub key_uri: String,
    #[serde(with = "hex::serde")]
    pub iv: [u8; HLS_IV_LEN],
    pub method: KeyMethod,
    pub stream_id: String,
    pub status: HlsKeyStatus,
    pub created_at: u64,
    pub expires_at: Option<u64>,
}

impl HlsKey {
    /// Servable: active and, if an expiry is set, not yet past it.
    pub fn is_servable(&self, now_s: u64) -> bool {
        self.status == HlsKeyStatus::Active && self.expires_at.map_or(true, |t| now_s < t)
    }

    pub fn iv_hex(&self) -> String {
        hex::encode(self.iv)
    }

    /// The `#EXT-X-KEY` tag announcing this key.
    pub fn key_line(&self) -> String {
        format!(
            "#EXT-X-KEY:METHOD={},URI=\"{}\",IV=0x{}",
            self.method.as_str(),
            self.key_uri,
            self.iv_hex()
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationType {
    Scheduled,
    SegmentCount,
    Manual,
    Emergency,
}

impl RotationType {
    pub fn as_str(self) -> &'static str {
        match self {
            RotationType::Scheduled => "scheduled",
            RotationType::SegmentCount => "segment_count",
            RotationType::Manual => "manual",
            RotationType::Emergency => "emergency",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub rotation_interval_minutes: u32,
    pub key_method: KeyMethod,
    pub segments_per_key: u64,
    pub pre_generate_count: usize,
    pub cdn_sync: bool,
    pub emergency_rotation: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            rotation_interval_minutes: 30,
            key_method: KeyMethod::Aes128,
            segments_per_key: 1000,
            pre_generate_count: 3,
            cdn_sync: true,
            emergency_rotation: true,
        }
    }
}

impl RotationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rotation_interval_minutes == 0 {
            return Err(anyhow!("rotation_interval_minutes must be > 0"));
        }
        if self.segments_per_key == 0 {
            return Err(anyhow!("segments_per_key must be > 0"));
        }
        if self.pre_generate_count == 0 {
            return Err(anyhow!("pre_generate_count must be > 0"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEncryptionState {
    pub stream_id: String,
    pub current_key_id: String,
    /// Pre-generated keys; the front is promoted on the next rotation.
    pub pending_key_ids: VecDeque<String>,
    pub segment_count: u64,
    pub total_segments: u64,
    pub rotation_count: u64,
    pub started_at: u64,
    pub last_rotation_at: u64,
    pub config: RotationConfig,
    pub playlist_url: String,
    pub cdn_endpoints: Vec<String>,
    pub key_line: String,
}

impl StreamEncryptionState {
    pub fn next_key_id(&self) -> Option<&str> {
        self.pending_key_ids.front().map(String::as_str)
    }
}

/// Per-endpoint outcome of one CDN fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdnSyncResults {
    pub endpoints: BTreeMap<String, bool>,
    pub errors: BTreeMap<String, String>,
}

impl CdnSyncResults {
    pub fn all_ok(&self) -> bool {
        self.endpoints.values().all(|ok| *ok)
    }

    pub fn failed_endpoints(&self) -> Vec<&str> {
        self.endpoints
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(endpoint, _)| endpoint.as_str())
            .collect()
    }

    /// `PartialSyncFailure` describing the failed endpoints, if any.
    pub fn failure(&self) -> Option<CustodyError> {
        let failed = self.failed_endpoints();
        if failed.is_empty() {
            return None;
        }
        Some(CustodyError::new(
            ErrorKind::PartialSyncFailure,
            format!(
                "{} of {} CDN endpoints failed: {}",
                failed.len(),
                self.endpoints.len(),
                failed.join(", ")
            ),
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRotationEvent {
    pub id: String,
    pub stream_id: String,
    pub old_key_id: Option<String>,
    pub new_key_id: Option<String>,
    pub rotation_type: RotationType,
    pub timestamp: u64,
    pub success: bool,
    pub error: Option<String>,
    pub affected_segments: u64,
    pub cdn_sync: CdnSyncResults,
}

impl KeyRotationEvent {
    pub fn partial_sync_failure(&self) -> Option<CustodyError> {
        self.cdn_sync.failure()
    }
}

/// Returned by `initialize_stream`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamStart {
    pub state: StreamEncryptionState,
    pub cdn_sync: CdnSyncResults,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub key_line: String,
    pub extinf_line: String,
    pub segment_uri: String,
}

impl std::fmt::Display for PlaylistEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}\n{}", self.key_line, self.extinf_line, self.segment_uri)
    }
}

/// Response to a player's key fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl KeyResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: vec![
                ("Content-Type".into(), "application/octet-stream".into()),
                (
                    "Cache-Control".into(),
                    "no-cache, no-store, must-revalidate".into(),
                ),
                ("Pragma".into(), "no-cache".into()),
                ("Expires".into(), "0".into()),
            ],
            body,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            headers: vec![(
                "Cache-Control".into(),
                "no-cache, no-store, must-revalidate".into(),
            )],
            body: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(status: HlsKeyStatus, expires_at: Option<u64>) -> HlsKey {
        HlsKey {
            id: "hls_1".into(),
            key: Zeroizing::new(vec![7u8; HLS_KEY_LEN]),
            key_uri: "https://keys.example/hls/hls_1".into(),
            iv: [0xab; HLS_IV_LEN],
            method: KeyMethod::Aes128,
            stream_id: "s1".into(),
            status,
            created_at: 0,
            expires_at,
        }
    }

    #[test]
    fn only_active_unexpired_keys_are_servable() {
        assert!(key(HlsKeyStatus::Active, None).is_servable(10));
        assert!(key(HlsKeyStatus::Active, Some(11)).is_servable(10));
        assert!(!key(HlsKeyStatus::Active, Some(10)).is_servable(10));
        assert!(!key(HlsKeyStatus::Pending, None).is_servable(10));
        assert!(!key(HlsKeyStatus::Revoked, None).is_servable(10));
    }

    #[test]
    fn key_line_carries_method_uri_and_iv() {
        let line = key(HlsKeyStatus::Active, None).key_line();
        assert_eq!(
            line,
            format!(
                "#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example/hls/hls_1\",IV=0x{}",
                "ab".repeat(16)
            )
        );
    }

    #[test]
    fn key_material_is_not_serialized() -> Result<()> {
        let json = serde_json::to_string(&key(HlsKeyStatus::Active, None))?;
        assert!(!json.contains("\"key\""));
        let back: HlsKey = serde_json::from_str(&json)?;
        assert!(back.key.is_empty());
        assert_eq!(back.iv, [0xab; HLS_IV_LEN]);
        Ok(())
    }

    #[test]
    fn failed_endpoints_surface_as_partial_sync() {
        let mut sync = CdnSyncResults::default();
        sync.endpoints.insert("edge-a".into(), true);
        sync.endpoints.insert("edge-b".into(), false);
        let err = sync.failure().expect("partial failure");
        assert_eq!(err.kind, ErrorKind::PartialSyncFailure);
        assert!(err.message.contains("edge-b"));
    }
}
