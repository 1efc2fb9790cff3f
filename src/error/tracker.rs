use reqwest::Error as HttpError;

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// Errors of a tracker announce.
///
/// Only [`TrackerError::UnsupportedScheme`] is non-retriable; everything
/// else is subject to the announcer's exponential back-off.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("unsupported tracker scheme: {0}")]
    /// The tracker URL scheme is not one of http, https or udp.
    UnsupportedScheme(String),

    #[error("{0}")]
    /// The response failed to parse as bencode.
    Bencode(serde_bencode::Error),

    #[error("{0}")]
    /// An HTTP-level error from the tracker.
    Http(HttpError),

    #[error("tracker failure: {0}")]
    /// The tracker answered with an explicit failure reason.
    Failure(String),

    #[error("invalid udp tracker response: {0}")]
    /// A UDP tracker datagram violated the protocol.
    UdpProtocol(&'static str),

    #[error("udp tracker timeout")]
    /// The UDP tracker did not answer in time.
    UdpTimeout,

    #[error("{0}")]
    /// An IO error occurred while talking to the tracker.
    Io(std::io::Error),
}

impl From<serde_bencode::Error> for TrackerError {
    fn from(value: serde_bencode::Error) -> Self {
        Self::Bencode(value)
    }
}

impl From<HttpError> for TrackerError {
    fn from(value: HttpError) -> Self {
        Self::Http(value)
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
