use std::fmt;

use crate::{PieceIndex, BLOCK_LEN};

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of the torrent content. Downloading happens at this block level
/// granularity: `request`, `piece`, `cancel` and `reject` messages all
/// carry one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes) or less.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the
    /// default block length of 16 KiB.
    pub fn index_in_piece(&self) -> usize {
        // we need to use "lower than or equal" as this may be the last
        // block in which case it may be shorter than the default length
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }

    /// Whether the block lies on the canonical 16 KiB grid of a piece of
    /// the given length, with exactly the expected length for its slot.
    ///
    /// The dispatcher uses this to validate `piece` and `reject` messages
    /// before they are forwarded to a downloader.
    pub fn is_canonical(&self, piece_len: u32) -> bool {
        self.offset % BLOCK_LEN == 0
            && self.offset < piece_len
            && self.len == block_len(piece_len, (self.offset / BLOCK_LEN) as usize)
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(piece: {} offset: {} len: {})",
            self.piece_index, self.offset, self.len
        )
    }
}

/// Returns the length of the block at the index in a piece of the given
/// length.
///
/// If the piece is not a multiple of the default block length, the last
/// returned value is smaller.
///
/// # Panics
///
/// Panics if the index multiplied by the default block length would exceed
/// the piece length.
pub fn block_len(piece_len: u32, block_index: usize) -> u32 {
    let block_offset = block_index as u32 * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // An arbitrary piece length that is an exact multiple of the canonical
    // block length (16 KiB).
    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * BLOCK_LEN;

    // An arbitrary piece length that is _not_ a multiple of the canonical
    // block length and the amount with which it overlaps the nearest exact
    // multiple value.
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + OVERLAP;

    #[test]
    fn test_block_len() {
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 1), BLOCK_LEN);

        assert_eq!(block_len(UNEVEN_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 2), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_index_panic() {
        block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(BLOCK_LEN_MULTIPLE_PIECE_LEN), 2);

        assert_eq!(block_count(UNEVEN_PIECE_LEN), 3);
    }

    #[test]
    fn test_is_canonical() {
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        assert!(block.is_canonical(UNEVEN_PIECE_LEN));

        // the last block must have exactly the remaining length
        let last = BlockInfo {
            piece_index: 0,
            offset: 2 * BLOCK_LEN,
            len: OVERLAP,
        };
        assert!(last.is_canonical(UNEVEN_PIECE_LEN));

        // one byte beyond the end of the piece
        let too_long = BlockInfo {
            piece_index: 0,
            offset: 2 * BLOCK_LEN,
            len: OVERLAP + 1,
        };
        assert!(!too_long.is_canonical(UNEVEN_PIECE_LEN));

        // not on the 16 KiB grid
        let misaligned = BlockInfo {
            piece_index: 0,
            offset: 1,
            len: BLOCK_LEN,
        };
        assert!(!misaligned.is_canonical(UNEVEN_PIECE_LEN));
    }
}
