//! Per-concern error types of the transfer core.
//!
//! Each subsystem has its own `thiserror` enum and `Result` alias; the
//! crate-root [`Error`] only aggregates what can escape a torrent.

pub mod metainfo;
pub mod peer;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use metainfo::MetainfoError;
pub use peer::{PeerError, Result as PeerResult};
pub use storage::{NewStoreError, ReadError, WriteError};
pub use torrent::{Result as TorrentResult, TorrentError};
pub use tracker::{Result as TrackerResult, TrackerError};

use std::net::SocketAddr;

pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("channel error")]
    /// The channel on which some component was listening or sending died.
    Channel,

    #[error("{0}")]
    /// Holds global IO related errors.
    Io(IoError),

    #[error("torrent error: {0}")]
    /// An error in a torrent's orchestration loop.
    Torrent(TorrentError),

    #[error("tracker error: {0}")]
    /// An error that occurred while announcing to a tracker.
    Tracker(TrackerError),

    #[error("peer {addr} error: {error}")]
    /// An error that occurred in a session with a peer.
    Peer { addr: SocketAddr, error: PeerError },
}

impl From<IoError> for Error {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl From<TorrentError> for Error {
    fn from(value: TorrentError) -> Self {
        Self::Torrent(value)
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
