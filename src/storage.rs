//! The piece store contract the torrent core writes verified pieces to
//! and serves peer requests from, plus two ready-made implementations.
//!
//! The on-disk layout of a full client is its own subsystem; the core
//! only depends on this narrow trait.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::storage::{NewStoreError, ReadError, WriteError};
use crate::metainfo::Info;
use crate::{Bitfield, PieceIndex};

/// Where verified pieces go and where served blocks come from.
///
/// Implementations must only return data for pieces that have been
/// written (or that they verified themselves on startup).
pub trait PieceStore: Send {
    /// Reads a block out of a held piece, for serving a peer's request.
    fn read(
        &mut self,
        index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, ReadError>;

    /// Retires a verified piece.
    fn write(&mut self, index: PieceIndex, data: &[u8]) -> Result<(), WriteError>;

    /// The pieces held at open time, used to initialize the torrent's own
    /// bitfield.
    fn verified_bitfield(&self) -> Bitfield;
}

/// Builds the store once the torrent's metadata is known. For a torrent
/// started from a `.torrent` file this runs immediately; for one started
/// from a magnet link it runs after the metadata download.
pub type StoreFactory = Box<
    dyn FnOnce(&Info) -> Result<Box<dyn PieceStore>, NewStoreError> + Send,
>;

/// Piece lengths per index, shared by both store implementations.
fn piece_lens(info: &Info) -> Vec<u32> {
    (0..info.piece_count()).map(|i| info.piece_len(i)).collect()
}

/// A store keeping every piece in memory. Meant for tests and small
/// transfers.
pub struct InMemoryStore {
    piece_lens: Vec<u32>,
    pieces: Vec<Option<Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new(info: &Info) -> Self {
        let piece_lens = piece_lens(info);
        let pieces = vec![None; piece_lens.len()];
        Self { piece_lens, pieces }
    }
}

impl PieceStore for InMemoryStore {
    fn read(
        &mut self,
        index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, ReadError> {
        let piece_len =
            *self.piece_lens.get(index).ok_or(ReadError::InvalidRange)?;
        if offset as u64 + len as u64 > piece_len as u64 {
            return Err(ReadError::InvalidRange);
        }
        let piece =
            self.pieces[index].as_ref().ok_or(ReadError::MissingData)?;
        Ok(piece[offset as usize..(offset + len) as usize].to_vec())
    }

    fn write(&mut self, index: PieceIndex, data: &[u8]) -> Result<(), WriteError> {
        let piece_len = *self
            .piece_lens
            .get(index)
            .ok_or(WriteError::InvalidPieceIndex)?;
        if data.len() as u32 != piece_len {
            return Err(WriteError::InvalidPieceLength);
        }
        self.pieces[index] = Some(data.to_vec());
        Ok(())
    }

    fn verified_bitfield(&self) -> Bitfield {
        self.pieces.iter().map(Option::is_some).collect()
    }
}

/// A store backed by one file, for single-file torrents.
///
/// Writes go straight to their byte offset in a preallocated file. The
/// store starts out empty: there is no resume state, so previously
/// written pieces are not trusted across restarts.
pub struct SingleFileStore {
    file: File,
    nominal_piece_len: u32,
    piece_lens: Vec<u32>,
    have: Bitfield,
}

impl SingleFileStore {
    pub fn create(
        path: impl AsRef<Path>,
        info: &Info,
    ) -> Result<Self, NewStoreError> {
        if info.files.len() != 1 {
            return Err(NewStoreError::LayoutMismatch);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(info.total_len)?;
        let piece_lens = piece_lens(info);
        let have = Bitfield::repeat(false, piece_lens.len());
        Ok(Self {
            file,
            nominal_piece_len: info.piece_len,
            piece_lens,
            have,
        })
    }

    fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.nominal_piece_len as u64
    }
}

impl PieceStore for SingleFileStore {
    fn read(
        &mut self,
        index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, ReadError> {
        let piece_len =
            *self.piece_lens.get(index).ok_or(ReadError::InvalidRange)?;
        if offset as u64 + len as u64 > piece_len as u64 {
            return Err(ReadError::InvalidRange);
        }
        if !self.have[index] {
            return Err(ReadError::MissingData);
        }
        self.file.seek(SeekFrom::Start(
            self.piece_offset(index) + offset as u64,
        ))?;
        let mut data = vec![0; len as usize];
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    fn write(&mut self, index: PieceIndex, data: &[u8]) -> Result<(), WriteError> {
        let piece_len = *self
            .piece_lens
            .get(index)
            .ok_or(WriteError::InvalidPieceIndex)?;
        if data.len() as u32 != piece_len {
            return Err(WriteError::InvalidPieceLength);
        }
        self.file.seek(SeekFrom::Start(self.piece_offset(index)))?;
        self.file.write_all(data)?;
        self.have.set(index, true);
        Ok(())
    }

    fn verified_bitfield(&self) -> Bitfield {
        self.have.clone()
    }
}
