use rand::Rng;

use crate::Bitfield;

/// A better strategy is to download pieces in rarest-first order: the client
/// keeps each peer's bitfield (updated by HAVE) and prefers the pieces that
/// appear least frequently across them. Randomising the starting index within
/// an availability class keeps many clients from piling onto the same piece.
#[derive(Clone, Copy, Debug)]
struct PieceInfo {
    /// Number of connected peers that advertise this piece.
    availability: usize,
    is_partial: bool,
    /// 0 = filtered (never picked), 1..7 = normal, higher is more urgent.
    priority: u8,
    /// Deprioritised to the end of the selection order after repeated failures.
    cursed: bool,
}

impl Default for PieceInfo {
    fn default() -> Self {
        Self { availability: 0, is_partial: false, priority: 4, cursed: false }
    }
}

#[derive(Debug)]
pub struct PiecePicker {
    pieces: Vec<PieceInfo>,
    have: Bitfield,
    /// Peer-suggested pieces (SUGGEST_PIECE), preferred within their class.
    suggested: Vec<usize>,
}

impl PiecePicker {
    pub fn new(num_pieces: usize) -> Self {
        let mut have = Bitfield::new();
        have.resize(num_pieces, false);
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have,
            suggested: Vec::new(),
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn all(&self) -> bool {
        self.have.all()
    }

    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.have = bf;
    }

    pub fn set_priority(&mut self, idx: usize, priority: u8) {
        self.pieces[idx].priority = priority;
    }

    pub fn mark_cursed(&mut self, idx: usize) {
        self.pieces[idx].cursed = true;
    }

    pub fn suggest(&mut self, idx: usize) {
        if !self.suggested.contains(&idx) {
            self.suggested.push(idx);
        }
    }

    pub fn increment_piece(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].availability += 1;
        !self.have[idx]
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
        self.pieces[idx].is_partial = false;
    }

    /// Clears the partial flag so the piece re-enters the candidate set
    /// (called after a hash failure, spec.md §4.E `restore_piece`).
    pub fn restore_piece(&mut self, idx: usize) {
        self.pieces[idx].is_partial = false;
    }

    /// Returns true if peer has at least one piece we don't.
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        bf.iter().enumerate().filter(|(_, b)| **b).for_each(|(i, _)| {
            self.pieces[i].availability += 1;
            if !self.have[i] {
                interested = true;
            }
        });
        interested
    }

    /// Undoes every availability count a peer's bitfield contributed, so a
    /// disconnect keeps `availability[p] == |{peers: bitfield[p]}|` (spec.md
    /// §3 picker accounting) instead of drifting upward forever.
    pub fn forget_bitfield(&mut self, bf: &Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        for (i, has_piece) in bf.iter().enumerate() {
            if *has_piece {
                self.pieces[i].availability = self.pieces[i].availability.saturating_sub(1);
            }
        }
    }

    /// Picks a new piece for a peer with bitfield `bf`, per the rarest-first
    /// order of spec.md §4.E.3, honouring `sequential` and the suggest list.
    pub fn pick_new_piece(&mut self, bf: &Bitfield, sequential: bool) -> Option<usize> {
        let candidates: Vec<usize> = (0..self.have.len())
            .filter(|&idx| {
                !self.have[idx]
                    && !self.pieces[idx].is_partial
                    && self.pieces[idx].priority > 0
                    && bf[idx]
            })
            .collect();

        if candidates.is_empty() {
            return None;
        }

        if sequential {
            let idx = *candidates.iter().min()?;
            self.pieces[idx].is_partial = true;
            return Some(idx);
        }

        // Suggested pieces are preferred within their availability class; since
        // we pick the single rarest candidate, a suggestion only wins a tie.
        let min_availability = candidates
            .iter()
            .filter(|&&idx| !self.pieces[idx].cursed)
            .map(|&idx| self.pieces[idx].availability)
            .min();

        let pool: Vec<usize> = match min_availability {
            Some(min) => candidates
                .iter()
                .copied()
                .filter(|&idx| !self.pieces[idx].cursed && self.pieces[idx].availability == min)
                .collect(),
            // Every candidate is cursed; fall back to the full candidate set.
            None => candidates,
        };

        let suggested_in_pool: Vec<usize> =
            pool.iter().copied().filter(|idx| self.suggested.contains(idx)).collect();
        let pick_from = if suggested_in_pool.is_empty() { &pool } else { &suggested_in_pool };

        let idx = pick_from[rand::thread_rng().gen_range(0..pick_from.len())];
        self.pieces[idx].is_partial = true;
        self.suggested.retain(|&s| s != idx);
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn test_rarest_first() {
        let mut picker = PiecePicker::new(7);
        // availabilities [2,2,2,3,3,3,3], we have [1,0,1,0,0,1,0]
        let have = BitVec::<u8, Msb0>::from_iter([true, false, true, false, false, true, false]);
        picker.set_own_bitfield(have);

        let availabilities = [2, 2, 2, 3, 3, 3, 3];
        for (idx, &avail) in availabilities.iter().enumerate() {
            picker.pieces[idx].availability = avail;
        }

        let bf = BitVec::<u8, Msb0>::repeat(true, 7);
        let idx = picker.pick_new_piece(&bf, false).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn test_forget_bitfield_reverses_availability() {
        let mut picker = PiecePicker::new(3);
        let bf = BitVec::<u8, Msb0>::from_iter([true, true, false]);
        picker.bitfield_update(&bf);
        assert_eq!(picker.pieces[0].availability, 1);
        assert_eq!(picker.pieces[1].availability, 1);

        picker.forget_bitfield(&bf);
        assert_eq!(picker.pieces[0].availability, 0);
        assert_eq!(picker.pieces[1].availability, 0);
        assert_eq!(picker.pieces[2].availability, 0);
    }

    #[test]
    fn test_sequential() {
        let mut picker = PiecePicker::new(4);
        let bf = BitVec::<u8, Msb0>::repeat(true, 4);
        let idx = picker.pick_new_piece(&bf, true).unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn test_cursed_deprioritised() {
        let mut picker = PiecePicker::new(2);
        picker.mark_cursed(0);
        let bf = BitVec::<u8, Msb0>::repeat(true, 2);
        let idx = picker.pick_new_piece(&bf, false).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn test_priority_zero_excluded() {
        let mut picker = PiecePicker::new(2);
        picker.set_priority(0, 0);
        let bf = BitVec::<u8, Msb0>::repeat(true, 2);
        let idx = picker.pick_new_piece(&bf, false).unwrap();
        assert_eq!(idx, 1);
    }
}
