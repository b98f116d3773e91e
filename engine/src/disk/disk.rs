use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::storage::FilePool;
use crate::TorrentId;

use super::*;

pub struct Disk {
    torrents: HashMap<TorrentId, RwLock<torrent::Torrent>>,
    pool: Arc<FilePool>,
    cache_capacity: usize,
    disk_rx: DiskRx,
}

impl Disk {
    pub fn new(file_pool_capacity: usize, cache_capacity: usize) -> (Self, DiskTx) {
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        (
            Disk {
                torrents: HashMap::new(),
                pool: Arc::new(FilePool::new(file_pool_capacity)),
                cache_capacity,
                disk_rx,
            },
            disk_tx,
        )
    }

    pub async fn run(&mut self) -> Result<()> {
        while let Some(cmd) = self.disk_rx.recv().await {
            match cmd {
                DiskCommand::NewTorrent { id, info, piece_hashes, torrent_tx, reply } => {
                    let msg = if self.torrents.contains_key(&id) {
                        Err(AllocationError::DuplicateTorrent)
                    } else {
                        match torrent::Torrent::new(
                            id,
                            info,
                            piece_hashes,
                            torrent_tx,
                            Arc::clone(&self.pool),
                            self.cache_capacity,
                        ) {
                            Ok(torrent) => {
                                let bf = torrent.check_existing_files();
                                self.torrents.insert(id, RwLock::new(torrent));
                                Ok(bf)
                            }
                            Err(e) => Err(e),
                        }
                    };

                    let _ = reply.send(msg);
                }

                DiskCommand::ReleaseTorrent(id) => {
                    if let Some(torrent) = self.torrents.remove(&id) {
                        // Wait for the write lock so pending reads/writes drain first.
                        let _ = torrent.write().await;
                        self.pool.release(id);
                    } else {
                        tracing::warn!("attempted to release non-existent torrent: {}", hex::encode(id));
                    }
                }

                DiskCommand::WriteBlock { id, block } => {
                    let Some(torrent) = self.torrents.get(&id) else {
                        tracing::warn!("torrent {} not found on disk", hex::encode(id));
                        continue;
                    };
                    if let Err(e) = torrent.write().await.write_block(block).await {
                        tracing::error!("write_block failed for {}: {}", hex::encode(id), e);
                    }
                }

                DiskCommand::ReadBlock { id, block, tx } => {
                    let Some(torrent) = self.torrents.get(&id) else {
                        tracing::warn!("torrent {} not found on disk", hex::encode(id));
                        continue;
                    };
                    if let Err(e) = torrent.read().await.read_block(block, tx).await {
                        tracing::error!("read_block failed for {}: {}", hex::encode(id), e);
                    }
                }

                DiskCommand::MoveStorage { id, dest, reply } => {
                    let result = match self.torrents.get(&id) {
                        Some(torrent) => torrent.write().await.move_storage(dest).await,
                        None => Err(DiskError::TorrentNotFound(id)),
                    };
                    let _ = reply.send(result);
                }

                DiskCommand::DeleteFiles { id, reply } => {
                    let result = match self.torrents.get(&id) {
                        Some(torrent) => torrent.write().await.delete_files().await,
                        None => Err(DiskError::TorrentNotFound(id)),
                    };
                    let _ = reply.send(result);
                }

                DiskCommand::Shutdown => break,
            }
        }

        Ok(())
    }
}
