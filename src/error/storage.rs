/// Error type returned on failed piece store creation.
#[derive(Debug, thiserror::Error)]
pub enum NewStoreError {
    #[error("store already holds a different torrent layout")]
    /// The store was opened with a conflicting piece geometry.
    LayoutMismatch,

    #[error("{0}")]
    /// IO error while allocating the store.
    Io(std::io::Error),
}

impl From<std::io::Error> for NewStoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Error type returned on failed piece writes.
///
/// This error is non-fatal so it should not be grouped with the global
/// `Error` type as it may be recovered from.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("invalid piece index")]
    /// The piece index is outside the torrent.
    InvalidPieceIndex,

    #[error("invalid piece length")]
    /// The buffer length does not match the piece's length.
    InvalidPieceLength,

    #[error("{0}")]
    /// An IO error occurred.
    Io(std::io::Error),
}

impl From<std::io::Error> for WriteError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Error type returned on failed piece reads.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("invalid read range")]
    /// The requested range does not fit the piece.
    InvalidRange,

    #[error("piece data missing")]
    /// The piece is valid within the torrent but its data has not been
    /// downloaded yet.
    MissingData,

    #[error("{0}")]
    /// An IO error occurred.
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
