use crate::block::sha256d;
use hex;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, ecdsa::Signature};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("private key is not valid hex")]
    Encoding,
    #[error("private key is not a valid secp256k1 scalar")]
    Invalid,
}

/// Sign/verify over raw payload bytes.
///
/// Implementations must hash the exact bytes they are given; callers never
/// re-encode a payload before verifying it.
pub trait SignatureEngine: Send + Sync {
    fn verify(&self, pubkey_hex: &str, payload: &[u8], signature: &[u8]) -> bool;

    fn sign(&self, private_key: &str, payload: &[u8]) -> Result<Vec<u8>, KeyError>;

    fn validate_private_key(&self, private_key: &str) -> bool;

    /// Public key string matching `private_key`, in the form `verify` expects.
    fn public_key_for(&self, private_key: &str) -> Result<String, KeyError>;
}

/// ECDSA over secp256k1. Digest is sha256d(payload), signatures are DER,
/// public keys are compressed hex, private keys are 32-byte hex.
pub struct Secp256k1Engine {
    secp: Secp256k1<secp256k1::All>,
}

impl Secp256k1Engine {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    fn decode_secret(private_key: &str) -> Result<SecretKey, KeyError> {
        let bytes = hex::decode(private_key.trim()).map_err(|_| KeyError::Encoding)?;
        SecretKey::from_slice(&bytes).map_err(|_| KeyError::Invalid)
    }

    fn digest(payload: &[u8]) -> Message {
        Message::from_digest(sha256d(payload))
    }
}

impl Default for Secp256k1Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureEngine for Secp256k1Engine {
    fn verify(&self, pubkey_hex: &str, payload: &[u8], signature: &[u8]) -> bool {
        let pk_bytes = match hex::decode(pubkey_hex) {
            Ok(b) => b,
            Err(_) => return false,
        };
        let pubkey = match PublicKey::from_slice(&pk_bytes) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig = match Signature::from_der(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.secp
            .verify_ecdsa(&Self::digest(payload), &sig, &pubkey)
            .is_ok()
    }

    fn sign(&self, private_key: &str, payload: &[u8]) -> Result<Vec<u8>, KeyError> {
        let sk = Self::decode_secret(private_key)?;
        let sig = self.secp.sign_ecdsa(&Self::digest(payload), &sk);
        Ok(sig.serialize_der().to_vec())
    }

    fn validate_private_key(&self, private_key: &str) -> bool {
        Self::decode_secret(private_key).is_ok()
    }

    fn public_key_for(&self, private_key: &str) -> Result<String, KeyError> {
        let sk = Self::decode_secret(private_key)?;
        let pk = PublicKey::from_secret_key(&self.secp, &sk);
        Ok(hex::encode(pk.serialize()))
    }
}
