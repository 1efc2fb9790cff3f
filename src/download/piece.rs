use std::collections::{HashSet, VecDeque};

use sha1::{Digest, Sha1};

use crate::blockinfo::{block_count, block_len, BlockInfo};
use crate::{PieceIndex, Sha1Hash, BLOCK_LEN};

/// Downloads all blocks of one piece from one peer.
///
/// Every block index is in exactly one of `unrequested`, `requested` or
/// `done` at all times; the download is complete when every block is
/// `done`. The buffer comes from the torrent's buffer pool and goes back
/// there on retirement, whatever the outcome.
pub(crate) struct PieceDownloader {
    piece_index: PieceIndex,
    piece_len: u32,
    hash: Sha1Hash,
    /// Whether this download was assigned under an allowed-fast grant, in
    /// which case it may proceed while the peer is choking us.
    allowed_fast: bool,
    buffer: Vec<u8>,
    unrequested: VecDeque<usize>,
    requested: HashSet<usize>,
    done: HashSet<usize>,
}

impl PieceDownloader {
    pub fn new(
        piece_index: PieceIndex,
        piece_len: u32,
        hash: Sha1Hash,
        allowed_fast: bool,
        buffer: Vec<u8>,
    ) -> Self {
        debug_assert_eq!(buffer.len(), piece_len as usize);
        Self {
            piece_index,
            piece_len,
            hash,
            allowed_fast,
            buffer,
            unrequested: (0..block_count(piece_len)).collect(),
            requested: HashSet::new(),
            done: HashSet::new(),
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.piece_index
    }

    pub fn allowed_fast(&self) -> bool {
        self.allowed_fast
    }

    pub fn num_blocks(&self) -> usize {
        block_count(self.piece_len)
    }

    /// The wire description of the block at the given in-piece index.
    pub fn block(&self, block_index: usize) -> BlockInfo {
        BlockInfo {
            piece_index: self.piece_index,
            offset: block_index as u32 * BLOCK_LEN,
            len: block_len(self.piece_len, block_index),
        }
    }

    /// Tops the request pipeline up to `queue_len` outstanding blocks and
    /// returns the requests to put on the wire, in block order.
    pub fn next_requests(&mut self, queue_len: usize) -> Vec<BlockInfo> {
        let mut requests = Vec::new();
        while self.requested.len() < queue_len {
            match self.unrequested.pop_front() {
                Some(block_index) => {
                    self.requested.insert(block_index);
                    requests.push(self.block(block_index));
                }
                None => break,
            }
        }
        requests
    }

    /// Records an arrived block. Returns false for a duplicate, in which
    /// case the buffer is left untouched.
    pub fn got_block(&mut self, block: &BlockInfo, data: &[u8]) -> bool {
        let block_index = block.index_in_piece();
        debug_assert!(block_index < self.num_blocks());
        debug_assert_eq!(data.len() as u32, block.len);

        if self.done.contains(&block_index) {
            return false;
        }

        let offset = block.offset as usize;
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        // the block may arrive while queued as unrequested, if the peer
        // served it after we had already written the request off to a
        // choke
        self.requested.remove(&block_index);
        self.unrequested.retain(|&i| i != block_index);
        self.done.insert(block_index);
        true
    }

    /// Returns a rejected block to the tail of the request queue.
    pub fn rejected(&mut self, block: &BlockInfo) {
        let block_index = block.index_in_piece();
        if self.requested.remove(&block_index) {
            self.unrequested.push_back(block_index);
        }
    }

    /// The peer choked us without the fast extension: nothing outstanding
    /// will be served, so every requested block becomes requestable again,
    /// at its original position in the queue.
    pub fn choked(&mut self) {
        let mut requeued: Vec<_> = self.requested.drain().collect();
        requeued.sort_unstable();
        for block_index in requeued.into_iter().rev() {
            self.unrequested.push_front(block_index);
        }
    }

    /// The blocks still on the wire, to be cancelled when the download is
    /// torn down or duplicated in endgame.
    pub fn outstanding_requests(&self) -> Vec<BlockInfo> {
        let mut outstanding: Vec<_> = self.requested.iter().copied().collect();
        outstanding.sort_unstable();
        outstanding.into_iter().map(|i| self.block(i)).collect()
    }

    pub fn has_requested(&self, block_index: usize) -> bool {
        self.requested.contains(&block_index)
    }

    pub fn is_done(&self) -> bool {
        self.done.len() == self.num_blocks()
    }

    /// Whether the assembled piece hashes to its declared SHA-1.
    pub fn verify(&self) -> bool {
        debug_assert!(self.is_done());
        Sha1Hash::from(Sha1::digest(&self.buffer)) == self.hash
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Tears the downloader apart, returning its buffer to the caller
    /// (who returns it to the pool).
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIECE_LEN: u32 = 2 * BLOCK_LEN + 100;

    fn make_downloader() -> PieceDownloader {
        PieceDownloader::new(
            4,
            PIECE_LEN,
            [0; 20],
            false,
            vec![0; PIECE_LEN as usize],
        )
    }

    /// Checks that the three block sets always partition the blocks.
    fn assert_partition(d: &PieceDownloader) {
        let mut all: Vec<_> = d
            .unrequested
            .iter()
            .chain(d.requested.iter())
            .chain(d.done.iter())
            .copied()
            .collect();
        all.sort_unstable();
        let expected: Vec<_> = (0..d.num_blocks()).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_requests_respect_queue_len() {
        let mut d = make_downloader();
        assert_eq!(d.num_blocks(), 3);

        let requests = d.next_requests(2);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], d.block(0));
        assert_eq!(requests[1], d.block(1));
        assert_partition(&d);

        // the pipeline is full, nothing more to request
        assert!(d.next_requests(2).is_empty());

        // a delivery frees a slot
        let block = d.block(0);
        assert!(d.got_block(&block, &vec![1; block.len as usize]));
        let requests = d.next_requests(2);
        assert_eq!(requests, vec![d.block(2)]);
        assert_partition(&d);
    }

    #[test]
    fn test_duplicate_block_leaves_buffer_untouched() {
        let mut d = make_downloader();
        d.next_requests(3);

        let block = d.block(0);
        assert!(d.got_block(&block, &vec![1; block.len as usize]));
        assert!(!d.got_block(&block, &vec![2; block.len as usize]));
        assert_eq!(&d.buffer()[..block.len as usize], &vec![1; block.len as usize][..]);
        assert_partition(&d);
    }

    #[test]
    fn test_choke_requeues_in_order() {
        let mut d = make_downloader();
        d.next_requests(2);
        d.choked();
        assert!(d.requested.is_empty());

        // the same blocks are re-requested in their original order
        let requests = d.next_requests(2);
        assert_eq!(requests[0], d.block(0));
        assert_eq!(requests[1], d.block(1));
        assert_partition(&d);
    }

    #[test]
    fn test_reject_moves_block_to_tail() {
        let mut d = make_downloader();
        d.next_requests(2);

        let rejected = d.block(0);
        d.rejected(&rejected);
        assert_partition(&d);

        // block 2 was never requested and goes out first; the rejected
        // block 0 went to the tail
        let requests = d.next_requests(3);
        assert_eq!(requests[0], d.block(2));
        assert_eq!(requests[1], d.block(0));
    }

    #[test]
    fn test_completion_and_verification() {
        let piece_len = 2 * BLOCK_LEN;
        let data = vec![0xab; piece_len as usize];
        let hash: Sha1Hash = Sha1::digest(&data).into();

        let mut d = PieceDownloader::new(
            0,
            piece_len,
            hash,
            false,
            vec![0; piece_len as usize],
        );
        for request in d.next_requests(2) {
            assert!(!d.is_done());
            let offset = request.offset as usize;
            d.got_block(&request, &data[offset..offset + request.len as usize]);
        }
        assert!(d.is_done());
        assert!(d.verify());
    }

    #[test]
    fn test_corrupt_piece_fails_verification() {
        let piece_len = BLOCK_LEN;
        let mut d = PieceDownloader::new(
            0,
            piece_len,
            [0; 20],
            false,
            vec![0; piece_len as usize],
        );
        let request = &d.next_requests(1)[0];
        let block = *request;
        d.got_block(&block, &vec![0xff; piece_len as usize]);
        assert!(d.is_done());
        assert!(!d.verify());
    }

    #[test]
    fn test_outstanding_requests_for_cancel() {
        let mut d = make_downloader();
        d.next_requests(2);
        let block = d.block(0);
        d.got_block(&block, &vec![0; block.len as usize]);

        assert_eq!(d.outstanding_requests(), vec![d.block(1)]);
    }
}
