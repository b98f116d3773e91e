use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sha1::Digest;

use crate::block::{block_len, Block, BlockData, BlockRequest};
use crate::peer::{PeerCommand, PeerTx};
use crate::storage::FilePool;
use crate::store::StoreInfo;
use crate::torrent::{CommandToTorrent, TorrentTx};
use crate::{Bitfield, TorrentId, BLOCK_SIZE};

use super::cache::BlockCache;
use super::fence::Fence;
use super::piece::{read_piece, PieceBuf};
use super::{AllocationError, Result};

/// Disk-side state shared across a torrent's blocking I/O jobs.
pub struct Ctx {
    pub torrent_tx: TorrentTx,
    pub pool: Arc<FilePool>,
    pub cache: Mutex<BlockCache>,
    pub fence: Fence,
}

/// Disk-side view of a torrent: piece geometry, the in-flight write buffer,
/// and the shared context its blocking jobs close over.
pub struct Torrent {
    pub id: TorrentId,
    pub info: StoreInfo,
    pub piece_hashes: Vec<[u8; 20]>,
    pub write_buf: HashMap<usize, PieceBuf>,
    pub ctx: Arc<Ctx>,
}

impl Torrent {
    pub fn new(
        id: TorrentId,
        info: StoreInfo,
        piece_hashes: Vec<[u8; 20]>,
        torrent_tx: TorrentTx,
        pool: Arc<FilePool>,
        cache_capacity: usize,
    ) -> std::result::Result<Self, AllocationError> {
        std::fs::create_dir_all(&info.output_dir)?;
        for file in &info.files {
            let path = info.output_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let f = std::fs::OpenOptions::new().create(true).read(true).write(true).open(&path)?;
            f.set_len(file.length as u64)?;
            tracing::info!("created file: {:?}", path);
        }

        Ok(Self {
            id,
            info,
            piece_hashes,
            write_buf: HashMap::new(),
            ctx: Arc::new(Ctx {
                torrent_tx,
                pool,
                cache: Mutex::new(BlockCache::new(cache_capacity)),
                fence: Fence::new(),
            }),
        })
    }

    /// Hashes every piece already on disk against `piece_hashes`, the
    /// fallback used when fastresume data is absent or rejected (spec.md §6).
    pub fn check_existing_files(&self) -> Bitfield {
        let mut bf = Bitfield::new();
        bf.resize(self.info.num_pieces as usize, false);

        for piece_idx in 0..self.info.num_pieces as usize {
            let offset = self.info.piece_byte_offset(piece_idx);
            let len = self.info.piece_length(piece_idx);
            let chunks = match read_piece(offset, len, &self.info, &self.ctx.pool, self.id) {
                Ok(chunks) => chunks,
                Err(_) => continue,
            };

            let mut hasher = sha1::Sha1::new();
            for chunk in &chunks {
                hasher.update(chunk.as_slice());
            }
            if hasher.finalize().as_slice() == self.piece_hashes[piece_idx] {
                bf.set(piece_idx, true);
            }
        }

        bf
    }

    pub async fn write_block(&mut self, block: Block) -> Result<()> {
        let _guard = self.ctx.fence.enter().await;

        let block_idx = block.offset / BLOCK_SIZE;
        self.ctx.cache.lock()?.insert_dirty(block.piece_idx, block_idx, block.data.as_ref().to_vec());

        let piece_idx = block.piece_idx;
        let piece_hashes = &self.piece_hashes;
        let info = &self.info;
        let piece = self.write_buf.entry(piece_idx).or_insert_with(|| {
            tracing::trace!("creating new piece {} in write buf", piece_idx);
            PieceBuf::new(
                piece_idx,
                piece_hashes[piece_idx],
                info.piece_length(piece_idx),
                info.piece_file_intersections(piece_idx),
            )
        });
        piece.add_block(&block);

        if !piece.is_complete() {
            return Ok(());
        }
        tracing::trace!("all blocks received for piece {} ... writing", piece_idx);

        let piece = self.write_buf.remove(&piece_idx).expect("just matched complete piece");
        let ctx = Arc::clone(&self.ctx);
        let info = self.info.clone();
        let id = self.id;

        let valid = tokio::task::spawn_blocking(move || -> Result<bool> {
            if !piece.verify_hash() {
                return Ok(false);
            }
            piece.write(&info, &ctx.pool, id)?;
            Ok(true)
        })
        .await
        .expect("write_block blocking task panicked")?;

        let mut cache = self.ctx.cache.lock()?;
        let dirty = cache.take_piece_dirty(piece_idx);
        if valid {
            for (block_idx, data) in dirty {
                cache.insert_read(piece_idx, block_idx, Arc::new(data));
            }
        } else {
            tracing::warn!("piece {} failed hash verification", piece_idx);
        }
        drop(cache);

        self.ctx.torrent_tx.send(CommandToTorrent::PieceWritten { idx: piece_idx, valid })?;
        Ok(())
    }

    pub async fn read_block(&self, request: BlockRequest, peer_tx: PeerTx) -> Result<()> {
        let _guard = self.ctx.fence.enter().await;

        let block_idx = request.idx_in_piece();
        if let Some(data) = self.ctx.cache.lock()?.get(request.piece_idx, block_idx) {
            tracing::trace!("cache hit for piece {} block {}", request.piece_idx, block_idx);
            peer_tx.send(PeerCommand::BlockRead(Block::from_block_request(&request, BlockData::Cached(data))))?;
            return Ok(());
        }

        let info = self.info.clone();
        let pool = Arc::clone(&self.ctx.pool);
        let id = self.id;
        let piece_idx = request.piece_idx;
        let piece_len = self.info.piece_length(piece_idx);
        let piece_offset = self.info.piece_byte_offset(piece_idx);

        let chunks = tokio::task::spawn_blocking(move || read_piece(piece_offset, piece_len, &info, &pool, id))
            .await
            .expect("read_block blocking task panicked")?;

        let mut cache = self.ctx.cache.lock()?;
        for (idx, chunk) in chunks.iter().enumerate() {
            cache.insert_read(piece_idx, idx, Arc::clone(chunk));
        }
        drop(cache);

        let data = Arc::clone(&chunks[block_idx]);
        debug_assert_eq!(data.len(), block_len(piece_len, block_idx));
        peer_tx.send(PeerCommand::BlockRead(Block::from_block_request(&request, BlockData::Cached(data))))?;
        Ok(())
    }

    /// Moves every file to `dest`. Fenced: waits for outstanding block I/O to
    /// drain and blocks new jobs until the move completes.
    pub async fn move_storage(&mut self, dest: PathBuf) -> Result<()> {
        let files: Vec<(PathBuf, PathBuf)> =
            self.info.files.iter().map(|f| (self.info.output_dir.join(&f.path), dest.join(&f.path))).collect();
        let id = self.id;
        let ctx = Arc::clone(&self.ctx);
        let dest_clone = dest.clone();

        ctx.fence
            .raise(|| async move {
                ctx.pool.release(id);
                std::fs::create_dir_all(&dest_clone)?;
                for (from, to) in &files {
                    if let Some(parent) = to.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::rename(from, to)?;
                }
                Ok::<(), super::DiskError>(())
            })
            .await?;

        self.info.output_dir = dest;
        Ok(())
    }

    /// Deletes every file belonging to this torrent's storage. Fenced.
    pub async fn delete_files(&mut self) -> Result<()> {
        let paths: Vec<PathBuf> = self.info.files.iter().map(|f| self.info.output_dir.join(&f.path)).collect();
        let id = self.id;
        let ctx = Arc::clone(&self.ctx);

        ctx.fence
            .raise(|| async move {
                ctx.pool.release(id);
                for path in &paths {
                    if path.exists() {
                        std::fs::remove_file(path)?;
                    }
                }
                Ok::<(), super::DiskError>(())
            })
            .await
    }
}
