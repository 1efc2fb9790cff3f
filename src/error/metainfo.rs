pub type Result<T, E = MetainfoError> = std::result::Result<T, E>;

/// Errors of metainfo and info-dictionary parsing.
#[derive(Debug, thiserror::Error)]
pub enum MetainfoError {
    #[error("{0}")]
    /// The buffer failed to parse as bencode.
    Bencode(serde_bencode::Error),

    #[error("invalid metainfo")]
    /// The bencode parsed but the structure is not a valid torrent: the
    /// piece hashes are not a multiple of 20 bytes, the file layout is
    /// contradictory or empty, or a file path is unusable.
    InvalidMetainfo,
}

impl From<serde_bencode::Error> for MetainfoError {
    fn from(value: serde_bencode::Error) -> Self {
        Self::Bencode(value)
    }
}
