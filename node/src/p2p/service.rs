// node/src/p2p/service.rs
use crate::NodeHandle;
use crate::p2p::manager::{MAX_OUTBOUND, PeerManager};
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use syncpoint_core::blockchain::MAX_HEADERS_RESULTS;
use syncpoint_core::checkpoint::{CheckpointDepth, ReceiveOutcome, SendOutcome};
use tokio::time::{Duration, sleep};

pub const HEADER_SYNC_INTERVAL: Duration = Duration::from_secs(15);
pub const AUTO_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

pub struct P2PService {
    pub manager: Arc<PeerManager>,
}

impl P2PService {
    pub fn new(manager: Arc<PeerManager>) -> Self {
        Self { manager }
    }

    pub async fn start(
        &self,
        bind_addr: String,
        peers: Vec<String>,
        node_handle: NodeHandle,
    ) -> anyhow::Result<()> {
        self.register_handlers(node_handle.clone());
        self.start_listener(bind_addr);
        self.connect_initial_peers(peers);
        self.start_header_sync(node_handle.clone());
        self.start_auto_checkpoint(node_handle);

        Ok(())
    }

    fn start_listener(&self, addr: String) {
        let p2p = self.manager.clone();

        tokio::spawn(async move {
            if let Err(e) = p2p.start_listener(&addr).await {
                log::error!("P2P listener failed: {:?}", e);
            }
        });
    }

    fn connect_initial_peers(&self, peers: Vec<String>) {
        let unique: HashSet<String> = peers.into_iter().collect();
        for addr in unique.into_iter().take(MAX_OUTBOUND) {
            let p2p_clone = self.manager.clone();
            tokio::spawn(async move {
                if let Err(e) = p2p_clone.connect_peer(&addr).await {
                    warn!("Failed connect {}: {:?}", addr, e);
                }
            });
        }
    }

    fn register_handlers(&self, node_handle: NodeHandle) {
        let p2p = self.manager.clone();

        // getheaders handler
        let nh = node_handle.clone();
        p2p.set_on_getheaders(move |locator, _stop| {
            nh.index.read().headers_after(&locator, MAX_HEADERS_RESULTS)
        });

        // headers handler
        let nh = node_handle.clone();
        p2p.set_on_headers(move |peer_id, headers| {
            let full_batch = headers.len() >= MAX_HEADERS_RESULTS;
            match nh.accept_headers(&headers) {
                Ok(report) => {
                    if report.inserted > 0 {
                        info!(
                            "Indexed {} headers from {}, height {}",
                            report.inserted,
                            peer_id,
                            nh.height()
                        );
                    }
                    if let Some(hash) = report.promoted {
                        info!("Pending checkpoint {} is now active", hash);
                    }
                    if full_batch && report.refused.is_none() {
                        let locator = nh.index.read().locator();
                        nh.p2p.request_headers_from(&peer_id, locator);
                    }
                }
                Err(e) => log::error!("Failed to index headers from {}: {}", peer_id, e),
            }
        });

        // checkpoint handler
        let nh = node_handle.clone();
        p2p.set_on_checkpoint(move |peer_id, message| match nh.accept_checkpoint(message) {
            Ok((outcome, locator)) => {
                match outcome {
                    ReceiveOutcome::Applied => info!("Checkpoint from {} applied", peer_id),
                    ReceiveOutcome::Conflict => {
                        warn!("Checkpoint from {} conflicts with ours", peer_id)
                    }
                    other => log::debug!("Checkpoint from {}: {}", peer_id, other),
                }
                if let Some(locator) = locator {
                    nh.p2p.request_headers_from(&peer_id, locator);
                }
            }
            Err(e) if e.is_recoverable() => {
                warn!("Dropped checkpoint from {}: {}", peer_id, e)
            }
            Err(e) => log::error!("Checkpoint from {} failed: {}", peer_id, e),
        });

        // handshake: hand out the active signed checkpoint
        let nh = node_handle;
        p2p.set_current_checkpoint(move || nh.sync.current_message());
    }

    fn start_header_sync(&self, node_handle: NodeHandle) {
        let p2p = self.manager.clone();
        tokio::spawn(async move {
            loop {
                let locator = node_handle.index.read().locator();
                p2p.request_headers_from_peers(locator);
                sleep(HEADER_SYNC_INTERVAL).await;
            }
        });
    }

    /// Periodic checkpointing on master nodes with a non-negative depth.
    fn start_auto_checkpoint(&self, node_handle: NodeHandle) {
        if node_handle.depth == CheckpointDepth::Manual {
            return;
        }
        if !node_handle.sync.is_master() {
            warn!("checkpoint depth set without a master key, auto checkpointing disabled");
            return;
        }
        let p2p = self.manager.clone();
        tokio::spawn(async move {
            loop {
                sleep(AUTO_CHECKPOINT_INTERVAL).await;
                let result = {
                    let index = node_handle.index.read();
                    node_handle
                        .sync
                        .auto_checkpoint(&*index, node_handle.depth, p2p.as_ref())
                };
                match result {
                    Ok(SendOutcome::Sent(hash)) => info!("Auto checkpoint {} sent", hash),
                    Ok(outcome) => log::debug!("Auto checkpoint: {:?}", outcome),
                    Err(e) => warn!("Auto checkpoint failed: {}", e),
                }
            }
        });
    }
}
