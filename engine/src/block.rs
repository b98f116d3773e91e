use std::sync::Arc;

use crate::{store::StoreInfo, BLOCK_SIZE};

/// Payload of a block, either freshly read off the wire/disk or served out of the
/// read cache without an extra copy.
#[derive(Debug, Clone)]
pub enum BlockData {
    Owned(Vec<u8>),
    Cached(Arc<Vec<u8>>),
}

impl BlockData {
    pub fn len(&self) -> usize {
        match self {
            BlockData::Owned(v) => v.len(),
            BlockData::Cached(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsRef<[u8]> for BlockData {
    fn as_ref(&self) -> &[u8] {
        match self {
            BlockData::Owned(v) => v,
            BlockData::Cached(v) => v,
        }
    }
}

/// A block carrying its data, either inbound (peer -> disk) or outbound (disk -> peer).
#[derive(Debug, Clone)]
pub struct Block {
    pub piece_idx: usize,
    pub offset: usize,
    pub data: BlockData,
}

impl Block {
    pub fn from_block_request(request: &BlockRequest, data: BlockData) -> Self {
        Self {
            piece_idx: request.piece_idx,
            offset: request.offset,
            data,
        }
    }
}

/// Addresses a block without carrying its payload: what the REQUEST/CANCEL
/// messages reference, and what the picker hands out and tracks.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockRequest {
    pub piece_idx: usize,
    pub offset: usize,
    pub len: usize,
}

impl BlockRequest {
    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }

    pub fn from_block(block: &Block) -> Self {
        Self {
            piece_idx: block.piece_idx,
            offset: block.offset,
            len: block.data.len(),
        }
    }

    /// Rejects oversize or out-of-range requests per spec.md §4.F.
    pub fn is_valid(&self, info: &StoreInfo) -> bool {
        if self.piece_idx as u32 >= info.num_pieces {
            return false;
        }
        let piece_len = info.piece_length(self.piece_idx);
        if self.len == 0 || self.len > BLOCK_SIZE {
            return false;
        }
        self.offset + self.len <= piece_len
    }
}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> u32 {
    ((piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_len() {
        let normal_piece_len = 32_768;
        let last_piece_len = 24_930;
        let normal_block_len = 16_384;
        let last_block_len = 8546;
        assert_eq!(block_len(normal_piece_len, 0), normal_block_len);
        assert_eq!(block_len(normal_piece_len, 1), normal_block_len);
        assert_eq!(block_len(last_piece_len, 0), normal_block_len);
        assert_eq!(block_len(last_piece_len, 1), last_block_len);
    }

    #[test]
    fn test_num_blocks() {
        (0..12).for_each(|i| assert_eq!(num_blocks(BLOCK_SIZE * i), i as u32));
        assert_eq!(num_blocks(BLOCK_SIZE + 500), 2);
        assert_eq!(num_blocks(BLOCK_SIZE * 5 + 1000), 6);
        assert_eq!(num_blocks(0), 0);
    }

    #[test]
    fn test_idx_in_piece() {
        let req = BlockRequest { piece_idx: 3, offset: BLOCK_SIZE * 2, len: BLOCK_SIZE };
        assert_eq!(req.idx_in_piece(), 2);
    }
}
