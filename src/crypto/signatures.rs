use anyhow::{anyhow, Result};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

pub const ED25519_SCHEME_ID: &str = "ed25519";

pub const DOMAIN_AUDIT_ENTRY: &str = "custody:audit-entry:v1";
pub const DOMAIN_AUDIT_CHECKPOINT: &str = "custody:audit-checkpoint:v1";

/// Sign a 32-byte digest under a domain tag so signatures cannot be replayed
/// across record types.
pub fn sign_with_domain(domain: &str, signing_key: &SigningKey, digest: &[u8; 32]) -> [u8; 64] {
    let signing_hash = domain_separated_hash(domain, digest);
    signing_key.sign(&signing_hash).to_bytes()
}

pub fn verify_with_domain(
    domain: &str,
    verifying_key: &VerifyingKey,
    digest: &[u8; 32],
    signature: &[u8],
) -> Result<()> {
    let signature = signature_array(signature)?;
    let signing_hash = domain_separated_hash(domain, digest);
    let sig = ed25519_dalek::Signature::from_bytes(&signature);
    verifying_key
        .verify(&signing_hash, &sig)
        .map_err(|e| anyhow!("signature verification failed: {}", e))
}

pub fn signature_array(signature: &[u8]) -> Result<[u8; 64]> {
    if signature.len() != 64 {
        return Err(anyhow!(
            "invalid ed25519 signature length: expected 64 bytes, got {}",
            signature.len()
        ));
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(signature);
    Ok(out)
}

pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey> {
    if bytes.len() != 32 {
        return Err(anyhow!(
            "invalid verifying key bytes: expected 32 bytes, got {}",
            bytes.len()
        ));
    }
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(bytes);
    VerifyingKey::from_bytes(&key_bytes).map_err(|e| anyhow!("invalid verifying key: {}", e))
}

pub fn verifying_key_from_hex(hex_str: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_str.trim()).map_err(|e| anyhow!("invalid hex: {}", e))?;
    verifying_key_from_bytes(&bytes)
}

fn domain_separated_hash(domain: &str, digest: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    let domain_bytes = domain.as_bytes();
    hasher.update((domain_bytes.len() as u32).to_le_bytes());
    hasher.update(domain_bytes);
    hasher.update(digest);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_bound_to_domain() -> Result<()> {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let digest = [3u8; 32];
        let sig = sign_with_domain(DOMAIN_AUDIT_ENTRY, &key, &digest);
        verify_with_domain(DOMAIN_AUDIT_ENTRY, &key.verifying_key(), &digest, &sig)?;
        assert!(
            verify_with_domain(DOMAIN_AUDIT_CHECKPOINT, &key.verifying_key(), &digest, &sig)
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn rejects_truncated_signature() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        assert!(verify_with_domain(DOMAIN_AUDIT_ENTRY, &key.verifying_key(), &[0u8; 32], &[1u8; 10]).is_err());
    }
}
