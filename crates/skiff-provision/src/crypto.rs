use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::ProvisionError;

pub const KEY_BITS: usize = 2048;

/// OAEP with SHA-256 spends 2·32+2 bytes of every block on padding.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

pub fn generate_keypair() -> Result<(RsaPrivateKey, RsaPublicKey), ProvisionError> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| ProvisionError::Crypto(e.to_string()))?;
    let public = RsaPublicKey::from(&private);
    Ok((private, public))
}

pub fn public_key_pem(key: &RsaPublicKey) -> Result<String, ProvisionError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| ProvisionError::Crypto(e.to_string()))
}

pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, ProvisionError> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| ProvisionError::Protocol(format!("bad cloud public key: {e}")))
}

/// RSA-OAEP caps plaintext at modulus − overhead bytes (190 for 2048-bit
/// keys); registration payloads are longer, so they are encrypted in blocks
/// and the ciphertext blocks concatenated.
pub fn encrypt_chunked(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, ProvisionError> {
    let mut rng = rand::thread_rng();
    let block = key.size() - OAEP_OVERHEAD;
    let mut out = Vec::with_capacity(plaintext.len() + key.size());
    for chunk in plaintext.chunks(block) {
        let ciphertext = key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), chunk)
            .map_err(|e| ProvisionError::Crypto(e.to_string()))?;
        out.extend_from_slice(&ciphertext);
    }
    Ok(out)
}

pub fn decrypt_chunked(
    key: &RsaPrivateKey,
    ciphertext: &[u8],
) -> Result<Vec<u8>, ProvisionError> {
    let block = key.size();
    if ciphertext.is_empty() || ciphertext.len() % block != 0 {
        return Err(ProvisionError::Crypto(format!(
            "ciphertext length {} is not a multiple of the key size {}",
            ciphertext.len(),
            block
        )));
    }
    let mut out = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks(block) {
        let plaintext = key
            .decrypt(Oaep::new::<Sha256>(), chunk)
            .map_err(|e| ProvisionError::Crypto(e.to_string()))?;
        out.extend_from_slice(&plaintext);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_short_payloads() {
        let (private, public) = generate_keypair().unwrap();
        let payload = b"hello";
        let ct = encrypt_chunked(&public, payload).unwrap();
        assert_eq!(decrypt_chunked(&private, &ct).unwrap(), payload);
    }

    #[test]
    fn round_trips_payloads_larger_than_one_block() {
        let (private, public) = generate_keypair().unwrap();
        // well past the 190-byte single-block limit
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let ct = encrypt_chunked(&public, &payload).unwrap();
        assert_eq!(ct.len() % 256, 0);
        assert!(ct.len() >= 256 * 6);
        assert_eq!(decrypt_chunked(&private, &ct).unwrap(), payload);
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        let (private, public) = generate_keypair().unwrap();
        let ct = encrypt_chunked(&public, b"payload").unwrap();
        assert!(decrypt_chunked(&private, &ct[..ct.len() - 1]).is_err());
    }

    #[test]
    fn pem_round_trip() {
        let (_, public) = generate_keypair().unwrap();
        let pem = public_key_pem(&public).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(parse_public_key_pem(&pem).unwrap(), public);
    }
}
