use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Block-granular disk cache (spec.md §4.B), split into a read side (an
/// ordinary bounded LRU, safe to evict at any time) and a write side (a plain
/// map of not-yet-flushed blocks, which the LRU never touches). A block lives
/// in at most one side at a time: once written it's dirty until its piece is
/// flushed, at which point it moves into the read side.
pub struct BlockCache {
    read: lru::LruCache<(usize, usize), Arc<Vec<u8>>>,
    write: HashMap<(usize, usize), Vec<u8>>,
}

impl BlockCache {
    pub fn new(capacity_blocks: usize) -> Self {
        let cap = NonZeroUsize::new(capacity_blocks.max(1)).expect("cache capacity must be > 0");
        Self { read: lru::LruCache::new(cap), write: HashMap::new() }
    }

    /// Serves a cached block, checking the dirty (write) side first since it
    /// always holds the freshest data for a block still in flight to disk.
    pub fn get(&mut self, piece_idx: usize, block_idx: usize) -> Option<Arc<Vec<u8>>> {
        if let Some(data) = self.write.get(&(piece_idx, block_idx)) {
            return Some(Arc::new(data.clone()));
        }
        self.read.get(&(piece_idx, block_idx)).cloned()
    }

    pub fn insert_read(&mut self, piece_idx: usize, block_idx: usize, data: Arc<Vec<u8>>) {
        self.read.put((piece_idx, block_idx), data);
    }

    /// Marks a block dirty. Dirty blocks are exempt from LRU eviction; they
    /// only leave the cache via `take_piece_dirty` once their piece is flushed.
    pub fn insert_dirty(&mut self, piece_idx: usize, block_idx: usize, data: Vec<u8>) {
        self.write.insert((piece_idx, block_idx), data);
    }

    pub fn is_dirty(&self, piece_idx: usize, block_idx: usize) -> bool {
        self.write.contains_key(&(piece_idx, block_idx))
    }

    /// Removes every dirty block belonging to `piece_idx`, in block order, so
    /// the caller can coalesce adjacent blocks into a single write.
    pub fn take_piece_dirty(&mut self, piece_idx: usize) -> Vec<(usize, Vec<u8>)> {
        let keys: Vec<(usize, usize)> =
            self.write.keys().copied().filter(|(p, _)| *p == piece_idx).collect();
        let mut blocks: Vec<(usize, Vec<u8>)> = keys
            .into_iter()
            .filter_map(|key| self.write.remove(&key).map(|data| (key.1, data)))
            .collect();
        blocks.sort_by_key(|(idx, _)| *idx);
        blocks
    }

    pub fn evict_torrent(&mut self, matches: impl Fn(usize) -> bool) {
        let read_keys: Vec<(usize, usize)> =
            self.read.iter().map(|(k, _)| *k).filter(|(p, _)| matches(*p)).collect();
        for key in read_keys {
            self.read.pop(&key);
        }
        self.write.retain(|(p, _), _| !matches(*p));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_block_survives_read_eviction() {
        let mut cache = BlockCache::new(1);
        cache.insert_dirty(0, 0, vec![1, 2, 3]);
        cache.insert_read(1, 0, Arc::new(vec![9]));
        cache.insert_read(2, 0, Arc::new(vec![9])); // evicts piece 1's read entry, not piece 0's dirty block
        assert!(cache.is_dirty(0, 0));
        assert_eq!(cache.get(0, 0).unwrap().as_ref(), &vec![1, 2, 3]);
    }

    #[test]
    fn test_take_piece_dirty_sorted_and_clears() {
        let mut cache = BlockCache::new(4);
        cache.insert_dirty(5, 1, vec![1]);
        cache.insert_dirty(5, 0, vec![0]);
        let blocks = cache.take_piece_dirty(5);
        assert_eq!(blocks.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1]);
        assert!(cache.take_piece_dirty(5).is_empty());
    }

    #[test]
    fn test_get_prefers_dirty_over_read() {
        let mut cache = BlockCache::new(4);
        cache.insert_read(0, 0, Arc::new(vec![1]));
        cache.insert_dirty(0, 0, vec![2]);
        assert_eq!(cache.get(0, 0).unwrap().as_ref(), &vec![2]);
    }
}
