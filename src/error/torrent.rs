use tokio::io::Error as IoError;
use tokio::sync::mpsc::error::SendError;

use crate::error::metainfo::MetainfoError;
use crate::error::storage::{NewStoreError, WriteError};

pub type Result<T, E = TorrentError> = std::result::Result<T, E>;

/// Errors of the per-torrent orchestration loop.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("channel error")]
    /// The channel on which some component in the engine was listening or
    /// sending died.
    Channel,

    #[error("{0}")]
    /// The downloaded metadata parsed but did not describe a usable
    /// torrent.
    Metainfo(MetainfoError),

    #[error("cannot open piece store: {0}")]
    /// The piece store could not be opened once metadata became known.
    Store(NewStoreError),

    #[error("cannot retire piece: {0}")]
    /// A verified piece could not be written to the store.
    PieceWrite(WriteError),

    #[error("{0}")]
    /// An IO error occurred.
    Io(std::io::Error),
}

impl From<IoError> for TorrentError {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl From<MetainfoError> for TorrentError {
    fn from(value: MetainfoError) -> Self {
        Self::Metainfo(value)
    }
}

impl From<NewStoreError> for TorrentError {
    fn from(value: NewStoreError) -> Self {
        Self::Store(value)
    }
}

impl From<WriteError> for TorrentError {
    fn from(value: WriteError) -> Self {
        Self::PieceWrite(value)
    }
}

impl<T> From<SendError<T>> for TorrentError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
