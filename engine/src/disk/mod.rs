use tokio::{sync::mpsc, task};

use crate::block::{Block, BlockRequest};
use crate::peer::PeerTx;
use crate::storage::PoolError;
use crate::store::StoreInfo;
use crate::torrent::TorrentTx;
use crate::TorrentId;

mod cache;
mod disk;
mod fence;
mod piece;
#[cfg(test)]
mod tests;
mod torrent;

pub use cache::BlockCache;
pub use fence::Fence;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("io error: expected {expected} bytes, got {actual}")]
    IoSizeError { expected: usize, actual: usize },

    #[error("file pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("sync error: {0}")]
    SyncError(String),

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("torrent {0:?} not found")]
    TorrentNotFound(TorrentId),
}

/// Errors related to allocating a new torrent to disk.
#[derive(thiserror::Error, Debug)]
pub enum AllocationError {
    #[error("torrent already exists in disk task")]
    DuplicateTorrent,

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::SyncError(e.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for DiskError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        DiskError::ChannelError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;
pub type DiskTx = mpsc::UnboundedSender<DiskCommand>;
pub type DiskRx = mpsc::UnboundedReceiver<DiskCommand>;

/// Reply channel for a one-shot disk job.
pub type ReplyTx<T> = tokio::sync::oneshot::Sender<T>;

pub enum DiskCommand {
    /// Allocates a new torrent's storage: creates directories/files and
    /// checks any that already exist against their piece hashes.
    NewTorrent {
        id: TorrentId,
        info: StoreInfo,
        piece_hashes: Vec<[u8; 20]>,
        torrent_tx: TorrentTx,
        reply: ReplyTx<std::result::Result<crate::Bitfield, AllocationError>>,
    },

    WriteBlock {
        id: TorrentId,
        block: Block,
    },

    ReadBlock {
        id: TorrentId,
        block: BlockRequest,
        tx: PeerTx,
    },

    /// Moves a torrent's storage to a new directory. Fenced: waits for
    /// outstanding reads/writes on this torrent to drain first.
    MoveStorage {
        id: TorrentId,
        dest: std::path::PathBuf,
        reply: ReplyTx<Result<()>>,
    },

    /// Deletes every file belonging to a torrent's storage. Fenced.
    DeleteFiles {
        id: TorrentId,
        reply: ReplyTx<Result<()>>,
    },

    /// Drops a torrent's in-memory state and releases its file handles.
    ReleaseTorrent(TorrentId),

    Shutdown,
}

pub fn spawn_disk(file_pool_capacity: usize, cache_capacity: usize) -> (task::JoinHandle<Result<()>>, DiskTx) {
    tracing::info!("starting disk task");
    let (mut disk_task, disk_tx) = disk::Disk::new(file_pool_capacity, cache_capacity);
    let handle = task::spawn(async move { disk_task.run().await });
    (handle, disk_tx)
}
