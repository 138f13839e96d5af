use anyhow::{anyhow, Result};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub mod aead;
pub mod signatures;

pub const ROOT_SEED_EXTENSION: &str = "root.seed";
pub const SIGNING_SEED_EXTENSION: &str = "ed25519.seed";

const DOMAIN_ROOT_KEY: &str = "custody:root-key:v1";

/// Resolve a seed file path that lives next to a SQLite database path.
pub fn seed_path_for_db(db_path: &str, extension: &str) -> Result<PathBuf> {
    if db_path == ":memory:" {
        return Err(anyhow!(
            "seed file requires a persistent db_path (got :memory:)"
        ));
    }

    let path_str = db_path
        .strip_prefix("file:")
        .map(|s| s.split('?').next().unwrap_or(s))
        .unwrap_or(db_path);
    if path_str.is_empty() {
        return Err(anyhow!("seed file path is empty"));
    }

    Ok(Path::new(path_str).with_extension(extension))
}

/// Load the seed stored at `path`, or create it from `pinned` or fresh
/// randomness. A pinned seed that disagrees with the stored one is rejected.
pub fn load_or_create_seed(path: &Path, pinned: Option<&str>, prefix: &str) -> Result<String> {
    let pinned = pinned.map(str::trim);
    if pinned == Some("") {
        return Err(anyhow!("provided seed is empty"));
    }
    let seed = match read_seed_file(path)? {
        Some(stored) => stored,
        None => {
            let seed = match pinned {
                Some(p) => p.to_string(),
                None => {
                    let mut bytes = Zeroizing::new([0u8; 32]);
                    rand::rngs::OsRng.fill_bytes(&mut bytes[..]);
                    format!("{}:{}", prefix, hex::encode(&bytes[..]))
                }
            };
            match write_seed_file(path, &seed)? {
                true => seed,
                // Lost a creation race; the winner's seed is authoritative.
                false => read_seed_file(path)?
                    .ok_or_else(|| anyhow!("seed {} vanished after creation", path.display()))?,
            }
        }
    };
    if pinned.map_or(false, |p| p != seed) {
        return Err(anyhow!(
            "seed mismatch: provided seed does not match stored seed at {}",
            path.display()
        ));
    }
    Ok(seed)
}

fn read_seed_file(path: &Path) -> Result<Option<String>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(anyhow!("failed to read seed {}: {}", path.display(), e)),
    };
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("seed file {} is empty", path.display()));
    }
    Ok(Some(trimmed.to_string()))
}

/// Create the seed file with owner-only permissions. `false` if it already
/// exists.
fn write_seed_file(path: &Path, seed: &str) -> Result<bool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| anyhow!("failed to create seed directory {}: {}", parent.display(), e))?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = match options.open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(anyhow!("failed to create seed {}: {}", path.display(), e)),
    };
    writeln!(file, "{}", seed)
        .and_then(|_| file.sync_all())
        .map_err(|e| anyhow!("failed to write seed {}: {}", path.display(), e))?;
    Ok(true)
}

/// Derive the Ed25519 audit signing key from a seed string.
pub fn signing_key_from_seed(seed: &str) -> Result<SigningKey> {
    let trimmed = seed.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("signing seed is required"));
    }
    let digest: [u8; 32] = Sha256::digest(trimmed.as_bytes()).into();
    Ok(SigningKey::from_bytes(&digest))
}

/// Root key sealing master-key material at rest.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey([u8; 32]);

impl RootKey {
    pub fn from_seed(seed: &str) -> Result<Self> {
        let trimmed = seed.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("root key seed is required"));
        }
        let mut hasher = Sha256::new();
        hasher.update((DOMAIN_ROOT_KEY.len() as u32).to_le_bytes());
        hasher.update(DOMAIN_ROOT_KEY.as_bytes());
        hasher.update(trimmed.as_bytes());
        Ok(Self(hasher.finalize().into()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootKey([REDACTED])")
    }
}

/// Random identifier with a readable type prefix, e.g. `mk_3f9a...`.
pub fn random_id(prefix: &str) -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}_{}", prefix, hex::encode(bytes))
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_path_strips_uri_prefix() -> Result<()> {
        let path = seed_path_for_db("file:/var/lib/custody.db?mode=rwc", ROOT_SEED_EXTENSION)?;
        assert_eq!(path, PathBuf::from("/var/lib/custody.root.seed"));
        assert!(seed_path_for_db(":memory:", ROOT_SEED_EXTENSION).is_err());
        Ok(())
    }

    #[test]
    fn seed_is_created_once_and_reused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("custody.root.seed");
        let first = load_or_create_seed(&path, None, "root")?;
        assert!(first.starts_with("root:"));
        let second = load_or_create_seed(&path, None, "root")?;
        assert_eq!(first, second);
        assert!(load_or_create_seed(&path, Some("root:other"), "root").is_err());
        assert_eq!(load_or_create_seed(&path, Some(&first), "root")?, first);
        Ok(())
    }

    #[test]
    fn pinned_seed_is_written_on_first_use() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("keys").join("custody.ed25519.seed");
        assert_eq!(load_or_create_seed(&path, Some(" audit:pinned \n"), "audit")?, "audit:pinned");
        assert_eq!(load_or_create_seed(&path, None, "audit")?, "audit:pinned");
        assert!(load_or_create_seed(&path, Some(""), "audit").is_err());
        Ok(())
    }

    #[test]
    fn root_key_is_domain_separated_from_signing_key() -> Result<()> {
        let root = RootKey::from_seed("seed:test")?;
        let signing = signing_key_from_seed("seed:test")?;
        assert_ne!(root.as_bytes(), &signing.to_bytes());
        Ok(())
    }
}
