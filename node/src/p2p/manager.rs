use crate::p2p::messages::P2pMessage;
use crate::p2p::peer::{Peer, PeerId};
use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use futures::future;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use syncpoint_core::block::{BlockHash, BlockHeader};
use syncpoint_core::checkpoint::{CheckpointMessage, CheckpointRelay};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

pub const MAX_OUTBOUND: usize = 8;

type Shared<T> = Arc<Mutex<T>>;
type Callback<F> = Shared<Option<Arc<F>>>;

type GetHeadersFn = dyn Fn(Vec<BlockHash>, Option<BlockHash>) -> Vec<BlockHeader> + Send + Sync;
type HeadersFn = dyn Fn(PeerId, Vec<BlockHeader>) + Send + Sync;
type CheckpointFn = dyn Fn(PeerId, CheckpointMessage) + Send + Sync;
type CurrentCheckpointFn = dyn Fn() -> Option<CheckpointMessage> + Send + Sync;

pub struct PeerManager {
    peers: Shared<HashMap<PeerId, UnboundedSender<P2pMessage>>>,
    peer_heights: Shared<HashMap<PeerId, u64>>,
    my_height: Arc<Mutex<u64>>,
    on_getheaders: Callback<GetHeadersFn>,
    /// callback when a batch of headers is received
    on_headers: Callback<HeadersFn>,
    /// callback when a checkpoint message is received
    on_checkpoint: Callback<CheckpointFn>,
    /// active checkpoint handed to peers during the handshake
    current_checkpoint: Callback<CurrentCheckpointFn>,
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerManager {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            peer_heights: Arc::new(Mutex::new(HashMap::new())),
            my_height: Arc::new(Mutex::new(0)),
            on_getheaders: Arc::new(Mutex::new(None)),
            on_headers: Arc::new(Mutex::new(None)),
            on_checkpoint: Arc::new(Mutex::new(None)),
            current_checkpoint: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_on_getheaders<F>(&self, cb: F)
    where
        F: Fn(Vec<BlockHash>, Option<BlockHash>) -> Vec<BlockHeader> + Send + Sync + 'static,
    {
        *self.on_getheaders.lock() = Some(Arc::new(cb));
    }

    pub fn set_on_headers<F>(&self, cb: F)
    where
        F: Fn(PeerId, Vec<BlockHeader>) + Send + Sync + 'static,
    {
        *self.on_headers.lock() = Some(Arc::new(cb));
    }

    pub fn set_on_checkpoint<F>(&self, cb: F)
    where
        F: Fn(PeerId, CheckpointMessage) + Send + Sync + 'static,
    {
        *self.on_checkpoint.lock() = Some(Arc::new(cb));
    }

    pub fn set_current_checkpoint<F>(&self, cb: F)
    where
        F: Fn() -> Option<CheckpointMessage> + Send + Sync + 'static,
    {
        *self.current_checkpoint.lock() = Some(Arc::new(cb));
    }

    pub fn set_my_height(&self, height: u64) {
        *self.my_height.lock() = height;
    }

    pub fn get_my_height(&self) -> u64 {
        *self.my_height.lock()
    }

    /// inbound connections accept loop (spawn)
    pub async fn start_listener(self: Arc<Self>, bind_addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!("P2P listener bound to {}", bind_addr);

        loop {
            let (socket, peer_addr) = listener.accept().await?;
            let peer_id = format!("{}", peer_addr);
            let manager_clone = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager_clone.spawn_peer_loop(socket, peer_id).await {
                    warn!("Incoming peer handling error: {:?}", e);
                }
            });
        }
    }

    /// outbound connection to peer
    pub async fn connect_peer(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        self.spawn_peer_loop(stream, addr.to_string()).await
    }

    /// Register the peer's outgoing channel and queue our handshake:
    /// version first, then the active checkpoint if we have a signed one.
    fn register(&self, peer_id: &PeerId, tx: UnboundedSender<P2pMessage>) {
        let _ = tx.send(P2pMessage::Version {
            version: env!("CARGO_PKG_VERSION").to_string(),
            height: self.get_my_height(),
        });
        let current = self.current_checkpoint.lock().clone();
        if let Some(msg) = current.and_then(|cb| (cb)()) {
            let _ = tx.send(P2pMessage::checkpoint(&msg));
        }
        self.peers.lock().insert(peer_id.clone(), tx);
        info!("Registered peer {}", peer_id);
    }

    fn unregister(&self, peer_id: &PeerId) {
        self.peers.lock().remove(peer_id);
        self.peer_heights.lock().remove(peer_id);
    }

    /// spawn peer read/write loops
    pub async fn spawn_peer_loop(
        self: Arc<Self>,
        stream: TcpStream,
        peer_id: PeerId,
    ) -> anyhow::Result<()> {
        let peer = Peer::new(peer_id, stream);
        let peer_id = peer.id.clone();
        let mut writer = peer.writer;
        let mut reader = peer.reader;

        // channel for sending outgoing messages to the write task
        let (tx, rx): (UnboundedSender<P2pMessage>, UnboundedReceiver<P2pMessage>) =
            mpsc::unbounded_channel();
        self.register(&peer_id, tx);

        // writer task: consumes rx and writes framed bytes to the socket
        let write_id = peer_id.clone();
        let write_handle = tokio::spawn(async move {
            let mut rx = rx;
            while let Some(msg) = rx.recv().await {
                match msg.encode() {
                    Ok(vec) => {
                        if let Err(e) = writer.send(Bytes::from(vec)).await {
                            log::warn!("write error to peer {}: {:?}", write_id, e);
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("bincode encode error for {}: {:?}", write_id, e);
                        break;
                    }
                }
            }
            // best-effort to close the sink
            let _ = SinkExt::<Bytes>::close(&mut writer).await;
        });

        // read task: read framed bytes, decode, and hand to manager
        let manager_clone = self.clone();
        let read_id = peer_id.clone();
        let read_handle = tokio::spawn(async move {
            loop {
                match reader.next().await {
                    Some(Ok(frame)) => match P2pMessage::decode(frame.as_ref()) {
                        Ok(msg) => manager_clone.handle_message(read_id.clone(), msg),
                        Err(e) => {
                            log::warn!("peer {} decode error: {:?}", read_id, e);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        log::warn!("peer {} read error: {:?}", read_id, e);
                        break;
                    }
                    None => {
                        log::info!("peer {} disconnected (reader ended)", read_id);
                        break;
                    }
                }
            }
        });

        match future::select(read_handle, write_handle).await {
            future::Either::Left((read_res, write_fut)) => {
                if let Err(e) = read_res {
                    log::warn!("read task error: {:?}", e);
                }
                self.unregister(&peer_id);
                let _ = write_fut.await; // sender dropped, writer drains and exits
            }
            future::Either::Right((write_res, read_fut)) => {
                if let Err(e) = write_res {
                    log::warn!("write task error: {:?}", e);
                }
                self.unregister(&peer_id);
                read_fut.abort();
            }
        }

        Ok(())
    }

    pub(crate) fn handle_message(&self, peer_id: PeerId, msg: P2pMessage) {
        use P2pMessage::*;
        match msg {
            Version { version, height } => {
                info!("{} sent version v{} height {}", peer_id, version, height);
                self.peer_heights.lock().insert(peer_id.clone(), height);
                self.send_to_peer(&peer_id, VerAck);
            }

            VerAck => {
                info!("{} verack", peer_id);
            }

            GetHeaders {
                locator_hashes,
                stop_hash,
            } => {
                log::debug!(
                    "{} requested headers ({} locator hashes)",
                    peer_id,
                    locator_hashes.len()
                );
                let cb = self.on_getheaders.lock().clone();
                let headers = match cb {
                    Some(cb) => (cb)(locator_hashes, stop_hash),
                    None => Vec::new(),
                };
                self.send_to_peer(&peer_id, Headers { headers });
            }

            Headers { headers } => {
                log::debug!("{} sent {} headers", peer_id, headers.len());
                if let Some(top) = headers.last() {
                    let mut heights = self.peer_heights.lock();
                    let known = heights.entry(peer_id.clone()).or_insert(0);
                    *known = (*known).max(top.height);
                }
                let cb = self.on_headers.lock().clone();
                if let (Some(cb), false) = (cb, headers.is_empty()) {
                    (cb)(peer_id, headers);
                }
            }

            Checkpoint { payload, signature } => {
                info!("{} sent checkpoint message", peer_id);
                let cb = self.on_checkpoint.lock().clone();
                if let Some(cb) = cb {
                    (cb)(peer_id, CheckpointMessage::unverified(payload, signature));
                }
            }

            Ping(nonce) => self.send_to_peer(&peer_id, Pong(nonce)),

            Pong(_) => {}
        }
    }

    pub fn send_to_peer(&self, peer_id: &PeerId, msg: P2pMessage) {
        if let Some(tx) = self.peers.lock().get(peer_id) {
            let _ = tx.send(msg);
        }
    }

    fn broadcast(&self, msg: &P2pMessage) {
        let peers = self.peers.lock().clone();
        for (_id, tx) in peers {
            let _ = tx.send(msg.clone());
        }
    }

    /// Request headers from all connected peers using a GetHeaders message.
    pub fn request_headers_from_peers(&self, locator_hashes: Vec<BlockHash>) {
        self.broadcast(&P2pMessage::GetHeaders {
            locator_hashes,
            stop_hash: None,
        });
    }

    pub fn request_headers_from(&self, peer_id: &PeerId, locator_hashes: Vec<BlockHash>) {
        self.send_to_peer(
            peer_id,
            P2pMessage::GetHeaders {
                locator_hashes,
                stop_hash: None,
            },
        );
    }

    pub fn get_peer_heights(&self) -> HashMap<PeerId, u64> {
        self.peer_heights.lock().clone()
    }
}

impl CheckpointRelay for PeerManager {
    fn broadcast_checkpoint(&self, message: &CheckpointMessage) {
        info!("Relaying checkpoint {} to {} peers", message.hash(), self.peer_count());
        self.broadcast(&P2pMessage::checkpoint(message));
    }

    fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach(manager: &PeerManager, id: &str) -> UnboundedReceiver<P2pMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.register(&id.to_string(), tx);
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<P2pMessage>) -> Vec<P2pMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn handshake_includes_active_checkpoint() {
        let manager = PeerManager::new();
        manager.set_my_height(7);
        let mut rx = attach(&manager, "a");
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [P2pMessage::Version { height: 7, .. }]
        ));

        let cp = CheckpointMessage::unverified(vec![1, 2], vec![3]);
        let handed = cp.clone();
        manager.set_current_checkpoint(move || Some(handed.clone()));
        let mut rx = attach(&manager, "b");
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], P2pMessage::checkpoint(&cp));
    }

    #[test]
    fn relay_reaches_every_peer() {
        let manager = PeerManager::new();
        let mut a = attach(&manager, "a");
        let mut b = attach(&manager, "b");
        drain(&mut a);
        drain(&mut b);
        assert_eq!(manager.peer_count(), 2);

        let cp = CheckpointMessage::unverified(vec![9], vec![8]);
        manager.broadcast_checkpoint(&cp);
        assert_eq!(drain(&mut a), vec![P2pMessage::checkpoint(&cp)]);
        assert_eq!(drain(&mut b), vec![P2pMessage::checkpoint(&cp)]);

        manager.unregister(&"a".to_string());
        assert_eq!(manager.peer_count(), 1);
    }

    #[test]
    fn inbound_messages_reach_callbacks() {
        let manager = PeerManager::new();
        let mut rx = attach(&manager, "p");
        drain(&mut rx);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        manager.set_on_checkpoint(move |peer, msg| {
            seen_cb.lock().push((peer, msg.payload().to_vec()));
        });

        manager.handle_message(
            "p".to_string(),
            P2pMessage::Checkpoint {
                payload: vec![5, 5],
                signature: vec![1],
            },
        );
        assert_eq!(*seen.lock(), vec![("p".to_string(), vec![5, 5])]);

        manager.handle_message("p".to_string(), P2pMessage::Ping(42));
        manager.handle_message(
            "p".to_string(),
            P2pMessage::Version {
                version: "x".into(),
                height: 3,
            },
        );
        assert_eq!(
            drain(&mut rx),
            vec![P2pMessage::Pong(42), P2pMessage::VerAck]
        );
        assert_eq!(manager.get_peer_heights().get("p"), Some(&3));

        // no provider registered: empty headers reply
        manager.handle_message(
            "p".to_string(),
            P2pMessage::GetHeaders {
                locator_hashes: vec![],
                stop_hash: None,
            },
        );
        assert_eq!(
            drain(&mut rx),
            vec![P2pMessage::Headers { headers: vec![] }]
        );
    }
}
