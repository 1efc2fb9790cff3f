use rand::seq::IteratorRandom;

use super::piece::Piece;
use crate::metainfo::Info;
use crate::peer::PeerKey;
use crate::{Bitfield, PieceIndex};

/// Below this many verified pieces the picker selects at random rather
/// than rarest-first, so a fresh torrent spreads its first requests
/// instead of having every client fight over the same rare piece.
const RAREST_FIRST_THRESHOLD: usize = 4;

/// Selects the next (piece, peer) assignment and tracks piece
/// availability across peers.
///
/// Owned and driven exclusively by the torrent's event loop.
pub(crate) struct PiecePicker {
    pieces: Vec<Piece>,
    /// The pieces we hold, verified.
    own: Bitfield,
    missing_count: usize,
}

impl PiecePicker {
    /// Builds the picker from the torrent metadata and the pieces the
    /// store already holds.
    pub fn new(info: &Info, own: Bitfield) -> Self {
        assert_eq!(own.len(), info.piece_count());
        let pieces = (0..info.piece_count())
            .map(|i| Piece::new(i, info.piece_len(i), info.piece_hashes[i]))
            .collect();
        let missing_count = own.count_zeros();
        Self {
            pieces,
            own,
            missing_count,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, index: PieceIndex) -> &Piece {
        &self.pieces[index]
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.own
    }

    pub fn is_complete(&self) -> bool {
        self.missing_count == 0
    }

    /// Records that the peer advertised the piece.
    pub fn peer_has_piece(&mut self, peer: PeerKey, index: PieceIndex) {
        self.pieces[index].having_peers.insert(peer);
    }

    pub fn peer_has_all(&mut self, peer: PeerKey) {
        for piece in self.pieces.iter_mut() {
            piece.having_peers.insert(peer);
        }
    }

    pub fn allow_fast(&mut self, peer: PeerKey, index: PieceIndex) {
        self.pieces[index].allowed_fast_peers.insert(peer);
    }

    /// Purges a departing peer from every piece's bookkeeping.
    pub fn remove_peer(&mut self, peer: PeerKey) {
        for piece in self.pieces.iter_mut() {
            piece.having_peers.remove(&peer);
            piece.allowed_fast_peers.remove(&peer);
            piece.downloading.retain(|&p| p != peer);
        }
    }

    /// Marks a piece as verified and held.
    pub fn mark_verified(&mut self, index: PieceIndex) {
        debug_assert!(!self.own[index]);
        self.own.set(index, true);
        self.missing_count -= 1;
    }

    /// Whether the peer has any piece we lack.
    pub fn is_peer_interesting(&self, peer: PeerKey) -> bool {
        self.pieces
            .iter()
            .any(|p| !self.own[p.index] && p.having_peers.contains(&peer))
    }

    pub fn start_download(&mut self, index: PieceIndex, peer: PeerKey) {
        debug_assert!(!self.pieces[index].downloading.contains(&peer));
        self.pieces[index].downloading.push(peer);
    }

    pub fn end_download(&mut self, index: PieceIndex, peer: PeerKey) {
        self.pieces[index].downloading.retain(|&p| p != peer);
    }

    /// Picks the next piece to download from the peer, or `None` if the
    /// peer has nothing for us right now.
    ///
    /// Priority order:
    /// 1. an allowed-fast piece of the peer's, even while it chokes us;
    /// 2. if unchoked, the rarest unassigned piece the peer has and we
    ///    lack (random instead of rarest while we hold few pieces);
    /// 3. if unchoked and every remaining piece is already assigned
    ///    (endgame), a duplicate assignment up to `endgame_duplication`
    ///    downloaders per piece.
    ///
    /// Returns the piece and whether it was picked under an allowed-fast
    /// grant.
    pub fn pick(
        &self,
        peer: PeerKey,
        peer_choking: bool,
        endgame_duplication: usize,
    ) -> Option<(PieceIndex, bool)> {
        let wanted = |p: &&Piece| {
            !self.own[p.index] && p.having_peers.contains(&peer)
        };

        // allowed-fast grants work even under a choke
        let allowed_fast = self
            .pieces
            .iter()
            .filter(wanted)
            .filter(|p| {
                p.allowed_fast_peers.contains(&peer) && p.downloading.is_empty()
            })
            .map(|p| p.index)
            .min();
        if let Some(index) = allowed_fast {
            return Some((index, true));
        }
        if peer_choking {
            return None;
        }

        let unassigned =
            self.pieces.iter().filter(wanted).filter(|p| p.downloading.is_empty());
        let verified_count = self.own.count_ones();
        let fresh = if verified_count < RAREST_FIRST_THRESHOLD {
            // bootstrap regime: pick at random
            unassigned
                .map(|p| p.index)
                .choose(&mut rand::thread_rng())
        } else {
            // rarest first, ties broken by index
            unassigned
                .min_by_key(|p| (p.having_peers.len(), p.index))
                .map(|p| p.index)
        };
        if let Some(index) = fresh {
            return Some((index, false));
        }

        // endgame: every piece still missing has a downloader, so pile on
        // rather than idle
        if !self.in_endgame() {
            return None;
        }
        self.pieces
            .iter()
            .filter(wanted)
            .filter(|p| {
                p.downloading.len() < endgame_duplication
                    && !p.downloading.contains(&peer)
            })
            .min_by_key(|p| (p.having_peers.len(), p.index))
            .map(|p| (p.index, false))
    }

    /// Endgame holds when no piece is both missing and unassigned.
    fn in_endgame(&self) -> bool {
        self.pieces
            .iter()
            .all(|p| self.own[p.index] || !p.downloading.is_empty())
    }
}
