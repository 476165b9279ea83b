use crate::p2p::messages::MAX_FRAME_LEN;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Peers are keyed by their socket address string.
pub type PeerId = String;

/// A connected peer's framed halves.
pub struct Peer {
    pub id: PeerId,
    pub reader: FramedRead<ReadHalf<TcpStream>, LengthDelimitedCodec>,
    pub writer: FramedWrite<WriteHalf<TcpStream>, LengthDelimitedCodec>,
}

impl Peer {
    pub fn new(id: PeerId, stream: TcpStream) -> Self {
        let (r, w) = tokio::io::split(stream);
        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec()
        };
        Self {
            id,
            reader: FramedRead::new(r, codec()),
            writer: FramedWrite::new(w, codec()),
        }
    }
}
