// node/src/p2p/messages.rs

use bincode::{Decode, Encode};
use syncpoint_core::block::{BlockHash, BlockHeader};
use syncpoint_core::checkpoint::CheckpointMessage;

/// Frames larger than this are dropped by the codec.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard()
}

/// message type
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum P2pMessage {
    Version {
        version: String,
        height: u64,
    },
    VerAck,
    GetHeaders {
        locator_hashes: Vec<BlockHash>,
        stop_hash: Option<BlockHash>,
    },
    Headers {
        headers: Vec<BlockHeader>,
    },
    /// Signed sync checkpoint: payload bytes exactly as signed by the master.
    Checkpoint {
        payload: Vec<u8>,
        signature: Vec<u8>,
    },
    Ping(u64),
    Pong(u64),
}

impl P2pMessage {
    pub fn checkpoint(message: &CheckpointMessage) -> Self {
        P2pMessage::Checkpoint {
            payload: message.payload().to_vec(),
            signature: message.signature().to_vec(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, wire_config())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (msg, _) = bincode::decode_from_slice(bytes, wire_config())?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_frame_keeps_signed_bytes() {
        let payload = vec![1, 0, 0, 0, 0xab, 0xcd];
        let signature = vec![0x30, 0x44, 0x02];
        let msg = P2pMessage::checkpoint(&CheckpointMessage::unverified(
            payload.clone(),
            signature.clone(),
        ));
        let decoded = P2pMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, P2pMessage::Checkpoint { payload, signature });
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(P2pMessage::decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
