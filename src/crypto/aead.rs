//! Authenticated encryption primitives shared by the KMS and the envelope layer.
//!
//! Payloads are sealed with detached tags so the envelope can store ciphertext,
//! IV and tag as separate fields. Wrapped keys use the compact
//! `nonce || tag || ciphertext` layout.

use aes_gcm::Aes256Gcm;
use anyhow::{anyhow, Result};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{custody_err, ErrorKind};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

const WRAP_AAD_PREFIX: &[u8] = b"custody-wrap";

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "aes-256-gcm",
            Algorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" => Ok(Algorithm::Aes256Gcm),
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Algorithm::ChaCha20Poly1305),
            other => Err(anyhow!("unknown aead algorithm: {}", other)),
        }
    }
}

pub fn random_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::thread_rng().fill_bytes(&mut key[..]);
    key
}

pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `buffer` in place and return the detached tag.
pub fn seal_in_place(
    alg: Algorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; TAG_LEN]> {
    check_lengths(key, nonce)?;
    let tag = match alg {
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("invalid aes key"))?;
            cipher
                .encrypt_in_place_detached(aes_gcm::Nonce::from_slice(nonce), aad, buffer)
                .map_err(|_| anyhow!("aes-256-gcm encryption failed"))?
        }
        Algorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| anyhow!("invalid chacha20 key"))?;
            cipher
                .encrypt_in_place_detached(chacha20poly1305::Nonce::from_slice(nonce), aad, buffer)
                .map_err(|_| anyhow!("chacha20-poly1305 encryption failed"))?
        }
    };
    Ok(tag.into())
}

/// Decrypt `buffer` in place. Any authentication failure is an
/// `IntegrityViolation` and leaves the buffer contents unspecified.
pub fn open_in_place(
    alg: Algorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8],
) -> Result<()> {
    check_lengths(key, nonce)?;
    if tag.len() != TAG_LEN {
        return Err(custody_err(
            ErrorKind::IntegrityViolation,
            format!("auth tag must be {} bytes, got {}", TAG_LEN, tag.len()),
        ));
    }
    let verified = match alg {
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("invalid aes key"))?;
            cipher.decrypt_in_place_detached(
                aes_gcm::Nonce::from_slice(nonce),
                aad,
                buffer,
                aes_gcm::Tag::from_slice(tag),
            )
        }
        Algorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| anyhow!("invalid chacha20 key"))?;
            cipher.decrypt_in_place_detached(
                chacha20poly1305::Nonce::from_slice(nonce),
                aad,
                buffer,
                chacha20poly1305::Tag::from_slice(tag),
            )
        }
    };
    verified.map_err(|_| {
        custody_err(
            ErrorKind::IntegrityViolation,
            format!("{} authentication failed", alg),
        )
    })
}

/// Wrap key material under a key-encryption key.
pub fn wrap_key(alg: Algorithm, kek: &[u8], context: &str, key: &[u8]) -> Result<Vec<u8>> {
    let nonce = random_nonce();
    let mut ciphertext = key.to_vec();
    let aad = wrap_aad(context);
    let tag = seal_in_place(alg, kek, &nonce, &aad, &mut ciphertext)?;
    let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn unwrap_key(
    alg: Algorithm,
    kek: &[u8],
    context: &str,
    wrapped: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if wrapped.len() < NONCE_LEN + TAG_LEN + 1 {
        return Err(custody_err(
            ErrorKind::IntegrityViolation,
            "wrapped key truncated",
        ));
    }
    let nonce = &wrapped[..NONCE_LEN];
    let tag = &wrapped[NONCE_LEN..NONCE_LEN + TAG_LEN];
    let mut clear = Zeroizing::new(wrapped[NONCE_LEN + TAG_LEN..].to_vec());
    let aad = wrap_aad(context);
    open_in_place(alg, kek, nonce, &aad, clear.as_mut_slice(), tag)?;
    Ok(clear)
}

fn wrap_aad(context: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(WRAP_AAD_PREFIX.len() + 4 + context.len());
    aad.extend_from_slice(WRAP_AAD_PREFIX);
    aad.extend_from_slice(&(context.len() as u32).to_le_bytes());
    aad.extend_from_slice(context.as_bytes());
    aad
}

fn check_lengths(key: &[u8], nonce: &[u8]) -> Result<()> {
    if key.len() != KEY_LEN {
        return Err(anyhow!("aead key must be {} bytes", KEY_LEN));
    }
    if nonce.len() != NONCE_LEN {
        return Err(custody_err(
            ErrorKind::IntegrityViolation,
            format!("nonce must be {} bytes, got {}", NONCE_LEN, nonce.len()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_kind;

    #[test]
    fn both_algorithms_round_trip_with_aad() -> Result<()> {
        for alg in [Algorithm::Aes256Gcm, Algorithm::ChaCha20Poly1305] {
            let key = random_key();
            let nonce = random_nonce();
            let mut buf = b"chain of custody".to_vec();
            let tag = seal_in_place(alg, &key[..], &nonce, b"env-1", &mut buf)?;
            assert_ne!(buf, b"chain of custody");
            open_in_place(alg, &key[..], &nonce, b"env-1", &mut buf, &tag)?;
            assert_eq!(buf, b"chain of custody");
        }
        Ok(())
    }

    #[test]
    fn wrong_aad_is_integrity_violation() -> Result<()> {
        let key = random_key();
        let nonce = random_nonce();
        let mut buf = b"payload".to_vec();
        let tag = seal_in_place(Algorithm::Aes256Gcm, &key[..], &nonce, b"a", &mut buf)?;
        let err = open_in_place(Algorithm::Aes256Gcm, &key[..], &nonce, b"b", &mut buf, &tag)
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::IntegrityViolation));
        Ok(())
    }

    #[test]
    fn wrapped_key_is_bound_to_context() -> Result<()> {
        let kek = random_key();
        let dek = random_key();
        let wrapped = wrap_key(Algorithm::ChaCha20Poly1305, &kek[..], "dk_1", &dek[..])?;
        let clear = unwrap_key(Algorithm::ChaCha20Poly1305, &kek[..], "dk_1", &wrapped)?;
        assert_eq!(clear.as_slice(), &dek[..]);
        assert!(unwrap_key(Algorithm::ChaCha20Poly1305, &kek[..], "dk_2", &wrapped).is_err());
        Ok(())
    }

    #[test]
    fn algorithm_parses_from_config_strings() -> Result<()> {
        assert_eq!("AES-256-GCM".parse::<Algorithm>()?, Algorithm::Aes256Gcm);
        assert_eq!(
            "chacha20poly1305".parse::<Algorithm>()?,
            Algorithm::ChaCha20Poly1305
        );
        assert!("rot13".parse::<Algorithm>().is_err());
        Ok(())
    }
}
