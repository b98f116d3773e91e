use std::io::{Read, Seek, Write};
use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::block::Block;
use crate::storage::{FileMode, FilePool};
use crate::store::StoreInfo;
use crate::{TorrentId, BLOCK_SIZE};

use super::Result;

/// Accumulates blocks for a single piece until every block has arrived, then
/// hashes the whole piece before it's allowed to reach disk.
#[derive(Debug)]
pub struct PieceBuf {
    pub idx: usize,
    pub hash: [u8; 20],
    pub len: usize,
    pub data: Vec<u8>,
    pub blocks_received: Vec<bool>,
    pub num_blocks_received: u32,
    pub file_range: std::ops::Range<usize>,
}

impl PieceBuf {
    pub fn new(idx: usize, hash: [u8; 20], len: usize, file_range: std::ops::Range<usize>) -> Self {
        Self {
            idx,
            hash,
            len,
            data: vec![0; len],
            blocks_received: vec![false; crate::block::num_blocks(len) as usize],
            num_blocks_received: 0,
            file_range,
        }
    }

    pub fn add_block(&mut self, block: &Block) {
        let block_idx = block.offset / BLOCK_SIZE;
        if self.blocks_received[block_idx] {
            tracing::warn!("duplicate block in piece {} at offset {}", block.piece_idx, block.offset);
        } else {
            self.blocks_received[block_idx] = true;
            self.num_blocks_received += 1;
            self.data[block.offset..block.offset + block.data.len()].copy_from_slice(block.data.as_ref());
        }
    }

    pub fn is_complete(&self) -> bool {
        self.num_blocks_received == self.blocks_received.len() as u32
    }

    /// Hashes the piece and compares it against the hash given at torrent
    /// creation (computationally expensive, run off the async executor).
    pub fn verify_hash(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().as_slice() == self.hash
    }

    pub fn write(&self, info: &StoreInfo, pool: &FilePool, storage: TorrentId) -> Result<()> {
        let piece_offset = info.piece_byte_offset(self.idx);
        let mut total_offset = piece_offset;
        let mut bytes_written = 0;

        for file_idx in self.file_range.clone() {
            let file_info = &info.files[file_idx];
            let path = info.output_dir.join(&file_info.path);
            let handle = pool.acquire(storage, file_idx, &path, FileMode::Write)?;
            let mut file = handle.write().expect("file handle poisoned");

            let byte_range = file_info.byte_range();
            let file_offset = total_offset - byte_range.start;
            let piece_remaining = self.len - bytes_written;
            let file_remaining = byte_range.end - total_offset;
            let bytes_remaining = std::cmp::min(piece_remaining, file_remaining);

            file.seek(std::io::SeekFrom::Start(file_offset as u64))?;
            let n = file.write(&self.data[bytes_written..bytes_written + bytes_remaining])?;

            total_offset += n;
            bytes_written += n;
        }

        if bytes_written != self.len {
            return Err(super::DiskError::IoSizeError { expected: self.len, actual: bytes_written });
        }

        Ok(())
    }
}

/// Reads `len` contiguous bytes starting at `offset`, spanning however many
/// files they cross, and returns them chunked into block-sized `Arc`s ready
/// to seed the read cache.
pub fn read_piece(
    offset: usize,
    len: usize,
    info: &StoreInfo,
    pool: &FilePool,
    storage: TorrentId,
) -> Result<Vec<Arc<Vec<u8>>>> {
    let file_range = info.byte_range_file_intersections(offset, len);
    let mut bytes_read = 0;
    let mut total_offset = offset;
    let mut buf = vec![0; len];

    for file_idx in file_range {
        let file_info = &info.files[file_idx];
        let path = info.output_dir.join(&file_info.path);
        let handle = pool.acquire(storage, file_idx, &path, FileMode::Read)?;
        let mut file = handle.write().expect("file handle poisoned");

        let byte_range = file_info.byte_range();
        let file_offset = total_offset.checked_sub(byte_range.start).ok_or(super::DiskError::IoSizeError {
            expected: byte_range.start,
            actual: total_offset,
        })?;

        let piece_remaining = len - bytes_read;
        let file_remaining = byte_range.end - total_offset;
        let bytes_remaining = std::cmp::min(piece_remaining, file_remaining);

        file.seek(std::io::SeekFrom::Start(file_offset as u64))?;
        let n = file.read(&mut buf[bytes_read..bytes_read + bytes_remaining])?;

        bytes_read += n;
        total_offset += n;
    }

    if bytes_read != len {
        return Err(super::DiskError::IoSizeError { expected: len, actual: bytes_read });
    }

    Ok(buf.chunks(BLOCK_SIZE).map(|chunk| Arc::new(chunk.to_vec())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileInfo;

    fn info(dir: &std::path::Path) -> StoreInfo {
        StoreInfo::new(
            2500,
            1000,
            3,
            vec![FileInfo { path: "a".into(), length: 1500, offset: 0, md5sum: None },
                 FileInfo { path: "b".into(), length: 1000, offset: 1500, md5sum: None }],
            dir.to_path_buf(),
        )
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let info = info(dir.path());
        let pool = FilePool::new(8);
        let storage = [7; 20];

        std::fs::write(dir.path().join("a"), vec![0u8; 1500]).unwrap();
        std::fs::write(dir.path().join("b"), vec![0u8; 1000]).unwrap();

        let data: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();
        let hash = {
            let mut hasher = Sha1::new();
            hasher.update(&data);
            let out = hasher.finalize();
            let mut h = [0u8; 20];
            h.copy_from_slice(&out);
            h
        };
        let mut piece = PieceBuf::new(1, hash, 1000, info.piece_file_intersections(1));
        piece.data = data.clone();
        piece.write(&info, &pool, storage).unwrap();

        let chunks = read_piece(1000, 1000, &info, &pool, storage).unwrap();
        let read_back: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(read_back, data);
    }
}
