pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

pub type Result<T, E = PeerError> = std::result::Result<T, E>;

/// Errors of a single peer session.
///
/// A peer error is always contained to that peer: the torrent reacts by
/// disconnecting (and for data-integrity failures, banning) the peer, never
/// by failing the torrent.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("channel error")]
    /// The channel on which some component in the engine was listening or
    /// sending died.
    Channel,

    #[error("connect timeout")]
    /// The TCP connection could not be established in time.
    ConnectTimeout,

    #[error("handshake timeout")]
    /// The peer did not complete the handshake in time.
    HandshakeTimeout,

    #[error("invalid info hash")]
    /// Peer's advertised torrent info hash did not match ours.
    InvalidInfoHash,

    #[error("duplicate peer id")]
    /// A peer with the same peer id is already connected.
    DuplicatePeerId,

    #[error("invalid piece index")]
    /// A message carried a piece index not below the torrent's piece count.
    InvalidPieceIndex,

    #[error("invalid block info")]
    /// The block geometry the peer sent does not lie on the canonical
    /// 16 KiB grid of the piece, or reaches past the end of the piece.
    InvalidBlockInfo,

    #[error("invalid bitfield length")]
    /// The bitfield payload was not exactly `ceil(piece count / 8)` bytes.
    InvalidBitfieldLength,

    #[error("message requires metadata")]
    /// The peer sent a message that is meaningless before the torrent
    /// metadata is known (piece, request, reject).
    MessageBeforeMetadata,

    #[error("unknown message id: {0}")]
    /// The peer sent a message id outside the negotiated vocabulary.
    UnknownMessageId(u8),

    #[error("invalid extension payload")]
    /// An extension-protocol payload failed to decode.
    InvalidExtensionPayload,

    #[error("unexpected metadata piece")]
    /// The peer sent metadata data without an active metadata download.
    UnexpectedMetadataPiece,

    #[error("obfuscation required but unavailable")]
    /// The encryption policy requires an obfuscated stream but only the
    /// plaintext handshaker is available.
    EncryptionRequired,

    #[error("{0}")]
    /// An IO error occurred.
    Io(std::io::Error),
}

impl From<IoError> for PeerError {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl<T> From<SendError<T>> for PeerError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
