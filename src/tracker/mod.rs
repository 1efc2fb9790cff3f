//! Tracker clients and the announce data model.
//!
//! The announcer in [`crate::announcer`] drives these; the core itself
//! never talks to a tracker directly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use serde::de;
use serde_derive::Deserialize;
use url::Url;

use crate::error::tracker::{Result, TrackerError};
use crate::{PeerId, Sha1Hash};

pub mod announce;
pub mod http;
pub mod response;
pub mod udp;

pub use announce::{Announce, Event};
pub use http::HttpTracker;
pub use response::Response;
pub use udp::UdpTracker;

/// A tracker client for one tracker URL.
///
/// Enum dispatch instead of a trait object keeps `announce` a plain async
/// method.
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    /// Creates the client matching the URL's scheme.
    ///
    /// Schemes other than `http`, `https` and `udp` are rejected; the
    /// caller is expected to log and disable that tracker.
    pub fn from_url(url: Url) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => Ok(Self::Http(HttpTracker::new(url))),
            "udp" => Ok(Self::Udp(UdpTracker::new(url)?)),
            other => Err(TrackerError::UnsupportedScheme(other.into())),
        }
    }

    /// Sends an announce request to the tracker.
    ///
    /// This reports the current transfer state and, except for `stopped`
    /// announces, requests peers to download from.
    pub async fn announce(&self, params: Announce) -> Result<Response> {
        let resp = match self {
            Self::Http(t) => t.announce(params).await?,
            Self::Udp(t) => t.announce(params).await?,
        };
        if let Some(reason) = &resp.failure_reason {
            return Err(TrackerError::Failure(reason.clone()));
        }
        Ok(resp)
    }

    pub fn url(&self) -> &Url {
        match self {
            Self::Http(t) => t.url(),
            Self::Udp(t) => t.url(),
        }
    }
}

/// The announcers' shared, read-only-ish view of a torrent's transfer
/// state. The torrent core updates the counters; announcers snapshot them
/// into [`Announce`] parameters.
#[derive(Debug)]
pub struct Transfer {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub downloaded: AtomicU64,
    pub uploaded: AtomicU64,
    pub left: AtomicU64,
}

impl Transfer {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId, port: u16, left: u64) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            left: AtomicU64::new(left),
        }
    }

    /// Snapshots the transfer state into announce parameters.
    pub fn announce_params(&self, event: Option<Event>) -> Announce {
        Announce {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            ip: None,
            downloaded: self.downloaded.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            left: self.left.load(Ordering::Relaxed),
            peer_count: None,
            tracker_id: None,
            event,
        }
    }
}

/// Deserialize an integer representing seconds into `Duration`.
pub fn deserialize_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s: Option<u64> = de::Deserialize::deserialize(deserializer)?;
    Ok(s.map(Duration::from_secs))
}

/// Peers can be sent in two ways:
/// - as a bencode list of dicts including full peer metadata.
/// - as a single bencode string that contains only the peer IP and port in
///   compact representation.
///
/// This method helps to deserialize both into the same type, discarding
/// the peer id present in the full representation. Most trackers send the
/// compact response by default, and the peer id is not used at this stage
/// anyway.
pub fn deserialize_peers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;
        fn expecting(
            &self,
            formatter: &mut std::fmt::Formatter,
        ) -> std::fmt::Result {
            formatter.write_str("a string or list of dicts representing peers")
        }

        /// Deserializes a compact string of peers.
        ///
        /// Each entry is 6 bytes long, where the first 4 bytes are the
        /// IPv4 address and the last 2 bytes are the port, both in network
        /// byte order.
        fn visit_bytes<E>(self, mut b: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY_LEN: usize = 6;

            let buf_len = b.len();
            if buf_len % ENTRY_LEN != 0 {
                return Err(E::custom(
                    "peers compact string must be a multiple of 6",
                ));
            }

            let mut peers = Vec::with_capacity(buf_len / ENTRY_LEN);
            for _ in (0..buf_len).step_by(ENTRY_LEN) {
                let addr = Ipv4Addr::from(b.get_u32());
                let port = b.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(addr), port));
            }
            Ok(peers)
        }

        /// Deserializes a list of dicts containing the peer information.
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Debug, Deserialize)]
            struct RawPeer {
                ip: String,
                port: u16,
            }
            let mut peers = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(RawPeer { ip, port }) = seq.next_element()? {
                let ip = if let Ok(ip) = ip.parse() {
                    ip
                } else {
                    continue;
                };
                peers.push(SocketAddr::new(ip, port));
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Contains the characters that need to be URL encoded according to:
/// https://en.wikipedia.org/wiki/Percent-encoding#Types_of_URI_characters
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');
