use std::collections::{HashSet, VecDeque};

use sha1::{Digest, Sha1};

use crate::peer::codec::METADATA_PIECE_LEN;
use crate::Sha1Hash;

/// How many metadata requests we keep outstanding per peer. Metadata is a
/// few slices at most, so a short fixed pipeline is plenty.
pub(crate) const REQUEST_PIPELINE: usize = 4;

/// The number of 16 KiB slices a dictionary of this size spans; the last
/// slice may be shorter.
fn metadata_piece_count(total_size: u32) -> u32 {
    (total_size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN
}

/// Downloads the raw info dictionary from one peer through the metadata
/// exchange, 16 KiB slices at a time.
///
/// The analogue of [`super::PieceDownloader`], with the same partition
/// discipline over slice indices. On completion the assembled bytes must
/// hash to the torrent's info hash; a mismatch gets the serving peer
/// banned.
pub(crate) struct InfoDownloader {
    total_size: u32,
    buffer: Vec<u8>,
    unrequested: VecDeque<u32>,
    requested: HashSet<u32>,
    done: HashSet<u32>,
}

impl InfoDownloader {
    pub fn new(total_size: u32) -> Self {
        let piece_count = metadata_piece_count(total_size);
        Self {
            total_size,
            buffer: vec![0; total_size as usize],
            unrequested: (0..piece_count).collect(),
            requested: HashSet::new(),
            done: HashSet::new(),
        }
    }

    pub fn piece_count(&self) -> u32 {
        metadata_piece_count(self.total_size)
    }

    /// The expected length of a metadata slice.
    fn piece_len(&self, piece: u32) -> u32 {
        debug_assert!(piece < self.piece_count());
        if piece == self.piece_count() - 1 {
            let remainder = self.total_size % METADATA_PIECE_LEN;
            if remainder != 0 {
                return remainder;
            }
        }
        METADATA_PIECE_LEN
    }

    /// Tops the request pipeline up and returns the slice indices to
    /// request.
    pub fn next_requests(&mut self) -> Vec<u32> {
        let mut requests = Vec::new();
        while self.requested.len() < REQUEST_PIPELINE {
            match self.unrequested.pop_front() {
                Some(piece) => {
                    self.requested.insert(piece);
                    requests.push(piece);
                }
                None => break,
            }
        }
        requests
    }

    /// Records an arrived slice. Returns false when the slice is invalid
    /// (bad index or length); duplicates are dropped silently.
    pub fn got_piece(&mut self, piece: u32, data: &[u8]) -> bool {
        if piece >= self.piece_count()
            || data.len() as u32 != self.piece_len(piece)
        {
            return false;
        }
        if self.done.contains(&piece) {
            return true;
        }
        let offset = (piece * METADATA_PIECE_LEN) as usize;
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        self.requested.remove(&piece);
        self.unrequested.retain(|&i| i != piece);
        self.done.insert(piece);
        true
    }

    /// Returns a rejected slice to the tail of the request queue.
    pub fn rejected(&mut self, piece: u32) {
        if self.requested.remove(&piece) {
            self.unrequested.push_back(piece);
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.len() as u32 == self.piece_count()
    }

    /// Whether the assembled dictionary hashes to the given info hash.
    pub fn verify(&self, info_hash: &Sha1Hash) -> bool {
        debug_assert!(self.is_done());
        Sha1Hash::from(Sha1::digest(&self.buffer)) == *info_hash
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}
