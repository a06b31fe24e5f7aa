use agentmesh_core::{MeshError, MeshResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::sha2::{Digest, Sha256};
use rsa::signature::Verifier;
use rsa::RsaPublicKey;

/// Stateless RSA signature checks.
///
/// The signing contract is fixed: the client signs the UTF-8 bytes of the
/// challenge with RSASSA-PKCS1-v1.5 over SHA-256 (the signer hashes, the
/// signature carries the SHA-256 DigestInfo), and sends the result base64
/// encoded with the standard alphabet.
pub struct SignatureVerifier;

impl SignatureVerifier {
    /// Parse a PEM public key, accepting SPKI (`PUBLIC KEY`) or PKCS#1
    /// (`RSA PUBLIC KEY`) encodings.
    pub fn parse_public_key(pem: &str) -> MeshResult<RsaPublicKey> {
        let pem = pem.trim();
        RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| MeshError::AuthenticationFailed(format!("Invalid public key: {e}")))
    }

    /// Verify `signature_b64` over `message` with the PEM public key.
    pub fn verify(public_key_pem: &str, message: &str, signature_b64: &str) -> MeshResult<()> {
        let public_key = Self::parse_public_key(public_key_pem)?;
        Self::verify_with_key(public_key, message, signature_b64)
    }

    /// Verify with an already parsed key.
    pub fn verify_with_key(
        public_key: RsaPublicKey,
        message: &str,
        signature_b64: &str,
    ) -> MeshResult<()> {
        let raw = STANDARD
            .decode(signature_b64.trim())
            .map_err(|e| MeshError::AuthenticationFailed(format!("Signature is not base64: {e}")))?;
        let signature = Signature::try_from(raw.as_slice())
            .map_err(|e| MeshError::AuthenticationFailed(format!("Malformed signature: {e}")))?;

        VerifyingKey::<Sha256>::new(public_key)
            .verify(message.as_bytes(), &signature)
            .map_err(|_| MeshError::AuthenticationFailed("Signature mismatch".into()))
    }

    /// Hex SHA-256 over the DER (SPKI) encoding of a public key.
    pub fn fingerprint(public_key_pem: &str) -> MeshResult<String> {
        let public_key = Self::parse_public_key(public_key_pem)?;
        let der = public_key
            .to_public_key_der()
            .map_err(|e| MeshError::AuthenticationFailed(format!("Cannot encode key: {e}")))?;
        Ok(hex::encode(Sha256::digest(der.as_bytes())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs1v15::SigningKey;
    use rsa::pkcs8::LineEnding;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
    }

    fn sign(key: &RsaPrivateKey, message: &str) -> String {
        let signing_key = SigningKey::<Sha256>::new(key.clone());
        STANDARD.encode(signing_key.sign(message.as_bytes()).to_bytes())
    }

    fn spki_pem(key: &RsaPrivateKey) -> String {
        key.to_public_key().to_public_key_pem(LineEnding::LF).unwrap()
    }

    #[test]
    fn test_valid_signature() {
        let key = test_key();
        let sig = sign(key, "deadbeef");
        assert!(SignatureVerifier::verify(&spki_pem(key), "deadbeef", &sig).is_ok());
    }

    #[test]
    fn test_pkcs1_pem_accepted() {
        let key = test_key();
        let pem = key.to_public_key().to_pkcs1_pem(LineEnding::LF).unwrap();
        let sig = sign(key, "abc");
        assert!(SignatureVerifier::verify(&pem, "abc", &sig).is_ok());
    }

    #[test]
    fn test_wrong_message_rejected() {
        let key = test_key();
        let sig = sign(key, "challenge-a");
        let err = SignatureVerifier::verify(&spki_pem(key), "challenge-b", &sig).unwrap_err();
        assert!(matches!(err, MeshError::AuthenticationFailed(_)));
    }

    #[test]
    fn test_garbage_inputs_rejected() {
        let key = test_key();
        assert!(SignatureVerifier::verify(&spki_pem(key), "x", "not base64!").is_err());
        assert!(SignatureVerifier::verify(&spki_pem(key), "x", "AAAA").is_err());
        assert!(SignatureVerifier::verify("not a pem", "x", "AAAA").is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_across_encodings() {
        let key = test_key();
        let spki = spki_pem(key);
        let pkcs1 = key.to_public_key().to_pkcs1_pem(LineEnding::LF).unwrap();
        let a = SignatureVerifier::fingerprint(&spki).unwrap();
        let b = SignatureVerifier::fingerprint(&pkcs1).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
