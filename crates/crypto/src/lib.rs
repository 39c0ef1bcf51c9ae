//! ed25519 helpers used to sign and verify Harmony session tokens.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey, SECRET_KEY_LENGTH};

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn verifying_key_from(signing_key: &SigningKey) -> VerifyingKey {
    signing_key.verifying_key()
}

pub fn sign_message(signing_key: &SigningKey, message: &[u8]) -> Signature {
    use ed25519_dalek::Signer;
    signing_key.sign(message)
}

pub fn verify_signature(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<()> {
    verifying_key
        .verify_strict(message, signature)
        .map_err(|err| anyhow!(err))
}

/// Restores a signing key from the URL-safe base64 of its 32-byte seed.
pub fn signing_key_from_base64(encoded: &str) -> Result<SigningKey> {
    let decoded = URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .map_err(|err| anyhow!("signing key is not URL-safe base64: {err}"))?;
    let seed: [u8; SECRET_KEY_LENGTH] = decoded
        .try_into()
        .map_err(|_| anyhow!("signing key must be {SECRET_KEY_LENGTH} bytes"))?;
    Ok(SigningKey::from_bytes(&seed))
}

pub fn signature_from_base64(encoded: &str) -> Result<Signature> {
    let decoded = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|err| anyhow!("signature is not URL-safe base64: {err}"))?;
    Signature::from_slice(&decoded).map_err(|err| anyhow!(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_verify_only_for_the_signed_message() {
        let key = generate_signing_key();
        let signature = sign_message(&key, b"payload");
        let verifying = verifying_key_from(&key);

        assert!(verify_signature(&verifying, b"payload", &signature).is_ok());
        assert!(verify_signature(&verifying, b"tampered", &signature).is_err());
        let other = verifying_key_from(&generate_signing_key());
        assert!(verify_signature(&other, b"payload", &signature).is_err());
    }

    #[test]
    fn signing_key_round_trips_through_base64() {
        let key = generate_signing_key();
        let encoded = URL_SAFE_NO_PAD.encode(key.to_bytes());
        let restored = signing_key_from_base64(&encoded).unwrap();
        assert_eq!(restored.to_bytes(), key.to_bytes());

        assert!(signing_key_from_base64("c2hvcnQ").is_err());
        assert!(signing_key_from_base64("***").is_err());
    }

    #[test]
    fn signature_decoding_rejects_wrong_lengths() {
        let signature = sign_message(&generate_signing_key(), b"x");
        let encoded = URL_SAFE_NO_PAD.encode(signature.to_bytes());
        assert_eq!(signature_from_base64(&encoded).unwrap(), signature);
        assert!(signature_from_base64("AAAA").is_err());
    }
}
