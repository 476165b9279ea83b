use super::CheckpointError;
use crate::block::BlockHash;
use crate::crypto::SignatureEngine;
use bincode::{Decode, Encode};

/// Version tag of the unsigned payload.
pub const CHECKPOINT_VERSION: i32 = 1;

fn payload_config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// The signed part of a checkpoint message.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct UnsignedCheckpoint {
    pub version: i32,
    pub hash: BlockHash,
}

impl UnsignedCheckpoint {
    pub fn new(hash: BlockHash) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            hash,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        bincode::encode_to_vec(self, payload_config())
            .map_err(|e| CheckpointError::MalformedMessage(e.to_string()))
    }

    /// Strict decode: unknown versions and trailing bytes are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let (unsigned, read): (UnsignedCheckpoint, usize) =
            bincode::decode_from_slice(bytes, payload_config())
                .map_err(|e| CheckpointError::MalformedMessage(e.to_string()))?;
        if read != bytes.len() {
            return Err(CheckpointError::MalformedMessage(format!(
                "{} trailing bytes after payload",
                bytes.len() - read
            )));
        }
        if unsigned.version < 1 || unsigned.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::MalformedMessage(format!(
                "unsupported checkpoint version {}",
                unsigned.version
            )));
        }
        Ok(unsigned)
    }
}

/// A checkpoint hash together with the exact payload bytes and signature it
/// arrived with. `hash` is only meaningful once the signature has been
/// checked; messages built from wire bytes start out unverified.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointMessage {
    hash: BlockHash,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl CheckpointMessage {
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.hash.is_zero() && self.signature.is_empty()
    }

    /// Wrap bytes received from a peer.
    pub fn unverified(payload: Vec<u8>, signature: Vec<u8>) -> Self {
        Self {
            hash: BlockHash::ZERO,
            payload,
            signature,
        }
    }

    pub(crate) fn signed(hash: BlockHash, payload: Vec<u8>, signature: Vec<u8>) -> Self {
        Self {
            hash,
            payload,
            signature,
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Verify the signature over the received payload bytes, then decode
    /// them. The returned message carries the decoded hash.
    pub fn verify(
        self,
        engine: &dyn SignatureEngine,
        master_pubkey: &str,
    ) -> Result<CheckpointMessage, CheckpointError> {
        if !engine.verify(master_pubkey, &self.payload, &self.signature) {
            return Err(CheckpointError::BadSignature);
        }
        let unsigned = UnsignedCheckpoint::from_bytes(&self.payload)?;
        Ok(CheckpointMessage {
            hash: unsigned.hash,
            payload: self.payload,
            signature: self.signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Secp256k1Engine;

    const KEY: &str = "1111111111111111111111111111111111111111111111111111111111111111";

    fn signed_wire(hash: BlockHash) -> (Vec<u8>, Vec<u8>) {
        let engine = Secp256k1Engine::new();
        let payload = UnsignedCheckpoint::new(hash).to_bytes().unwrap();
        let sig = engine.sign(KEY, &payload).unwrap();
        (payload, sig)
    }

    #[test]
    fn payload_layout_is_version_then_hash() {
        let bytes = UnsignedCheckpoint::new(BlockHash([0xaa; 32]))
            .to_bytes()
            .unwrap();
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[..4], &1i32.to_le_bytes());
        assert_eq!(&bytes[4..], &[0xaa; 32]);
    }

    #[test]
    fn strict_decoding() {
        let mut bytes = UnsignedCheckpoint::new(BlockHash([1; 32])).to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(
            UnsignedCheckpoint::from_bytes(&bytes),
            Err(CheckpointError::MalformedMessage(_))
        ));

        let future = UnsignedCheckpoint {
            version: CHECKPOINT_VERSION + 1,
            hash: BlockHash([1; 32]),
        };
        let bytes = bincode::encode_to_vec(&future, payload_config()).unwrap();
        assert!(matches!(
            UnsignedCheckpoint::from_bytes(&bytes),
            Err(CheckpointError::MalformedMessage(_))
        ));

        assert!(UnsignedCheckpoint::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn verify_fills_in_hash() {
        let engine = Secp256k1Engine::new();
        let pubkey = engine.public_key_for(KEY).unwrap();
        let (payload, sig) = signed_wire(BlockHash([5; 32]));

        let msg = CheckpointMessage::unverified(payload, sig);
        assert!(msg.hash().is_zero());
        let verified = msg.verify(&engine, &pubkey).unwrap();
        assert_eq!(verified.hash(), BlockHash([5; 32]));
        assert!(!verified.is_null());
    }

    #[test]
    fn flipped_bit_fails_signature() {
        let engine = Secp256k1Engine::new();
        let pubkey = engine.public_key_for(KEY).unwrap();
        let (mut payload, sig) = signed_wire(BlockHash([5; 32]));
        payload[10] ^= 0x01;

        let err = CheckpointMessage::unverified(payload, sig)
            .verify(&engine, &pubkey)
            .unwrap_err();
        assert!(matches!(err, CheckpointError::BadSignature));
    }

    #[test]
    fn signed_garbage_is_malformed() {
        let engine = Secp256k1Engine::new();
        let pubkey = engine.public_key_for(KEY).unwrap();
        let payload = vec![9u8; 7];
        let sig = engine.sign(KEY, &payload).unwrap();
        let err = CheckpointMessage::unverified(payload, sig)
            .verify(&engine, &pubkey)
            .unwrap_err();
        assert!(matches!(err, CheckpointError::MalformedMessage(_)));
    }

    #[test]
    fn null_message() {
        assert!(CheckpointMessage::null().is_null());
        assert!(CheckpointMessage::null().payload().is_empty());
    }
}
