use std::collections::HashSet;

use crate::peer::PeerKey;
use crate::{PieceIndex, Sha1Hash};

/// The torrent's in-memory view of one piece: who has it, who may serve
/// it to us while choking, and who is downloading it right now.
pub(crate) struct Piece {
    pub index: PieceIndex,
    pub len: u32,
    pub hash: Sha1Hash,
    /// Peers that advertised this piece via bitfield/have/have-all.
    pub having_peers: HashSet<PeerKey>,
    /// Peers that granted us allowed-fast for this piece.
    pub allowed_fast_peers: HashSet<PeerKey>,
    /// Peers with an active downloader for this piece. Outside endgame
    /// this holds at most one entry.
    pub downloading: Vec<PeerKey>,
}

impl Piece {
    pub fn new(index: PieceIndex, len: u32, hash: Sha1Hash) -> Self {
        Self {
            index,
            len,
            hash,
            having_peers: HashSet::new(),
            allowed_fast_peers: HashSet::new(),
            downloading: Vec::new(),
        }
    }
}
