use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::block::BlockRequest;
use crate::Bitfield;

pub mod partial_piece;
pub mod piece_picker;

use partial_piece::PartialPiece;
use piece_picker::PiecePicker;

#[derive(Debug)]
pub struct Picker {
    pub piece_picker: RwLock<PiecePicker>,
    pub partial_pieces: RwLock<HashMap<usize, RwLock<PartialPiece>>>,
    num_pieces: u32,
    piece_len: usize,
    last_piece_len: usize,
    sequential: bool,
    end_game_threshold: usize,
}

impl Picker {
    pub fn new(num_pieces: u32, piece_len: usize, last_piece_len: usize) -> Self {
        Self::with_config(num_pieces, piece_len, last_piece_len, false, 20)
    }

    pub fn with_config(
        num_pieces: u32,
        piece_len: usize,
        last_piece_len: usize,
        sequential: bool,
        end_game_threshold: usize,
    ) -> Self {
        Self {
            piece_picker: RwLock::new(PiecePicker::new(num_pieces as usize)),
            partial_pieces: RwLock::new(HashMap::new()),
            num_pieces,
            piece_len,
            last_piece_len,
            sequential,
            end_game_threshold,
        }
    }

    fn piece_len(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// Picks up to `target_queue_len - current_requests.len()` blocks for a
    /// peer, following the selection order of spec.md §4.E:
    /// partial pieces the peer can complete, then new rarest pieces, then
    /// (below `end_game_threshold` blocks outstanding) re-requesting blocks
    /// already assigned to other peers.
    ///
    /// When `peer_on_parole` is set, picking is restricted to `parole_piece`.
    pub async fn pick_blocks(
        &self,
        current_requests: &HashSet<BlockRequest>,
        target_queue_len: usize,
        bf: &Bitfield,
        peer_on_parole: Option<usize>,
    ) -> Vec<BlockRequest> {
        let mut requests = vec![];
        let mut remaining = target_queue_len.saturating_sub(current_requests.len());
        if remaining == 0 {
            return vec![];
        }

        if let Some(parole_idx) = peer_on_parole {
            if let Some(partial_piece) = self.partial_pieces.write().await.get_mut(&parole_idx) {
                partial_piece.write().await.pick_next_blocks(
                    remaining,
                    &mut requests,
                    current_requests,
                    false,
                );
            }
            return requests;
        }

        // Top up partially downloaded pieces the peer can contribute to.
        for partial_piece in self.partial_pieces.write().await.values_mut() {
            if remaining == 0 {
                break;
            }
            if !bf[partial_piece.read().await.idx] {
                continue;
            }
            remaining -= partial_piece.write().await.pick_next_blocks(
                remaining,
                &mut requests,
                current_requests,
                false,
            );
        }

        // Pick new rarest-first pieces until either the queue target is met
        // or there are no more whole pieces to start.
        while remaining != 0 {
            let picked_idx = self.piece_picker.write().await.pick_new_piece(bf, self.sequential);
            match picked_idx {
                Some(idx) => {
                    tracing::trace!("picked piece {}", idx);
                    let mut partial_piece = PartialPiece::new(idx, self.piece_len(idx));
                    remaining -= partial_piece.pick_next_blocks(
                        remaining,
                        &mut requests,
                        current_requests,
                        false,
                    );
                    self.partial_pieces.write().await.insert(idx, partial_piece.into());
                }
                None => break,
            }
        }

        // End-game: once few enough blocks remain outstanding, allow
        // re-requesting blocks already assigned elsewhere.
        if remaining != 0 && self.outstanding_block_count().await <= self.end_game_threshold {
            for partial_piece in self.partial_pieces.write().await.values_mut() {
                if remaining == 0 {
                    break;
                }
                if !bf[partial_piece.read().await.idx] {
                    continue;
                }
                remaining -= partial_piece.write().await.pick_next_blocks(
                    remaining,
                    &mut requests,
                    current_requests,
                    true,
                );
            }
        }

        requests
    }

    /// Fast extension: pick blocks from pieces the peer marked ALLOWED_FAST
    /// even while we're choked (spec.md §4.F). Starts a partial piece for any
    /// allowed index not already in progress; never touches pieces outside
    /// `allowed`.
    pub async fn pick_allowed_fast_blocks(
        &self,
        allowed: &HashSet<usize>,
        current_requests: &HashSet<BlockRequest>,
        target_queue_len: usize,
        bf: &Bitfield,
    ) -> Vec<BlockRequest> {
        let mut requests = vec![];
        let mut remaining = target_queue_len.saturating_sub(current_requests.len());
        if remaining == 0 {
            return requests;
        }

        for &idx in allowed {
            if remaining == 0 {
                break;
            }
            if idx >= bf.len() || !bf[idx] || self.piece_picker.read().await.own_bitfield()[idx] {
                continue;
            }

            let mut partial_pieces = self.partial_pieces.write().await;
            partial_pieces.entry(idx).or_insert_with(|| PartialPiece::new(idx, self.piece_len(idx)).into());
            if let Some(partial_piece) = partial_pieces.get(&idx) {
                remaining -=
                    partial_piece.write().await.pick_next_blocks(remaining, &mut requests, current_requests, false);
            }
        }

        requests
    }

    async fn outstanding_block_count(&self) -> usize {
        let mut count = 0;
        for partial_piece in self.partial_pieces.read().await.values() {
            count += partial_piece.read().await.num_outstanding();
        }
        count
    }

    /// After a hash failure: clears the piece's block state and, if a single
    /// peer contributed every failed block, blames it; otherwise every
    /// contributor goes on parole (spec.md §4.E.4, §4.F hash failure).
    pub async fn restore_piece(&self, idx: usize) {
        if let Some(partial_piece) = self.partial_pieces.write().await.remove(&idx) {
            partial_piece.write().await.free_all_blocks();
        }
        self.piece_picker.write().await.restore_piece(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;
    use bitvec::prelude::*;

    #[tokio::test]
    async fn test_pick_blocks() {
        let picker = Picker::new(1028, 32_768, 32_768);
        let bf = BitVec::repeat(true, 1028);
        picker.piece_picker.write().await.bitfield_update(&bf);
        let requests_1 = picker.pick_blocks(&HashSet::new(), 4, &bf, None).await;
        assert_eq!(requests_1.len(), 4);
        let requests_2 = picker.pick_blocks(&HashSet::new(), 4, &bf, None).await;
        assert_eq!(requests_2.len(), 4);
    }

    #[tokio::test]
    async fn test_pick_blocks_end_game() {
        let picker = Picker::with_config(2, 32_768, 32_768, false, 20);
        let bf = BitVec::repeat(true, 2);
        picker.piece_picker.write().await.bitfield_update(&bf);

        // Pick all the blocks.
        let requests_1 = picker.pick_blocks(&HashSet::new(), 4, &bf, None).await;
        assert_eq!(requests_1.len(), 4);

        // Try end-game: no new pieces left, everything already requested.
        let requests_2 = picker.pick_blocks(&HashSet::new(), 4, &bf, None).await;
        assert_eq!(requests_2.len(), 4);

        // End-game with some blocks already in this peer's own queue.
        let mut previous_requests = HashSet::new();
        previous_requests.insert(BlockRequest { piece_idx: 0, offset: 0, len: BLOCK_SIZE });
        previous_requests.insert(BlockRequest { piece_idx: 1, offset: 0, len: BLOCK_SIZE });
        let requests_3 = picker.pick_blocks(&previous_requests, 4, &bf, None).await;
        assert_eq!(requests_3.len(), 2);
    }

    #[tokio::test]
    async fn test_pick_blocks_above_end_game_threshold_no_redundant_requests() {
        let picker = Picker::with_config(100, 32_768, 32_768, false, 5);
        let bf = BitVec::repeat(true, 100);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let mut previous_requests = HashSet::new();
        previous_requests.insert(BlockRequest { piece_idx: 0, offset: 0, len: BLOCK_SIZE });
        // Plenty of pieces remain unpicked, so end-game must not trigger.
        let requests = picker.pick_blocks(&previous_requests, 4, &bf, None).await;
        assert_eq!(requests.len(), 4);
        assert!(requests.iter().all(|r| !previous_requests.contains(r)));
    }

    #[tokio::test]
    async fn test_parole_restricts_to_single_piece() {
        let picker = Picker::new(4, 32_768, 32_768);
        let bf = BitVec::repeat(true, 4);
        picker.piece_picker.write().await.bitfield_update(&bf);
        // Seed a partial piece at index 2 so parole has something to pick from.
        picker
            .partial_pieces
            .write()
            .await
            .insert(2, PartialPiece::new(2, 32_768).into());

        let requests = picker.pick_blocks(&HashSet::new(), 4, &bf, Some(2)).await;
        assert!(requests.iter().all(|r| r.piece_idx == 2));
    }
}
