//! Interfaces for the systems this crate treats as external collaborators
//! rather than implementing itself (spec.md §6): the tracker client, the DHT
//! node, proxy transports, and the `.torrent` metadata loader. The embedder
//! supplies concrete implementations; the torrent coordinator only depends on
//! these traits.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::{store::StoreInfo, TorrentId};

/// Announce event, mirroring the tracker HTTP/UDP protocol's `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

/// Transfer counters reported on every announce.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Minimum interval, in seconds, before the next announce.
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("tracker error: {0}")]
    Tracker(String),

    #[error("dht error: {0}")]
    Dht(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("metadata error: {0}")]
    Metadata(String),
}

/// `announce(info_hash, port, stats) -> (interval, peer_list)` (spec.md §6).
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn announce(
        &self,
        info_hash: TorrentId,
        port: u16,
        event: Option<AnnounceEvent>,
        stats: AnnounceStats,
    ) -> Result<AnnounceResponse, CollaboratorError>;
}

/// `get_peers`/`announce_peer` per spec.md §6.
#[async_trait]
pub trait Dht: Send + Sync {
    async fn get_peers(&self, info_hash: TorrentId) -> Result<Vec<SocketAddr>, CollaboratorError>;
    async fn announce_peer(&self, info_hash: TorrentId, port: u16) -> Result<(), CollaboratorError>;
}

/// Stream-like outbound connector the core treats transparently, so a SOCKS4/5
/// or HTTP CONNECT proxy can be substituted for a direct `TcpStream::connect`.
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    async fn connect(&self, endpoint: SocketAddr) -> Result<tokio::net::TcpStream, CollaboratorError>;
}

/// `load(info_hash) -> torrent_info` (file list, piece length, piece hashes);
/// the bencoded `.torrent` parser itself is out of scope (spec.md Non-goals).
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn load(&self, info_hash: TorrentId) -> Result<(StoreInfo, Vec<[u8; 20]>), CollaboratorError>;
}
