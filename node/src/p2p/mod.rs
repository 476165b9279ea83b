pub mod manager;
pub mod messages;
pub mod peer;
pub mod service;

pub use manager::PeerManager;
pub use messages::P2pMessage;
