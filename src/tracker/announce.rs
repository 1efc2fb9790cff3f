use std::net::IpAddr;

use crate::{PeerId, Sha1Hash};

/// Parameters for announcing to a tracker.
/// [`More details about the key meanings`](http://bittorrent.org/beps/bep_0003.html)
#[derive(Debug, Clone)]
pub struct Announce {
    /// The info hash identifying the torrent.
    pub info_hash: Sha1Hash,
    /// Our own identifier.
    pub peer_id: PeerId,

    /// The port the client is listening on.
    pub port: u16,
    /// The true IP address in dotted quad format. Only necessary when the
    /// request originates from an address other than the client's host
    /// address (a proxy, or a tracker on the same NAT'd subnet as the
    /// peer).
    pub ip: Option<IpAddr>,

    /// Number of bytes downloaded so far.
    pub downloaded: u64,
    /// Number of bytes uploaded so far.
    pub uploaded: u64,
    /// Number of bytes left to download.
    pub left: u64,

    /// The number of peers the client wishes to receive from the tracker.
    /// If omitted, HTTP trackers typically default to a value between 30
    /// and 50, and UDP trackers are sent -1 to pick for themselves.
    pub peer_count: Option<usize>,

    /// If previously received from the tracker, we must send it with each
    /// announce.
    pub tracker_id: Option<String>,

    /// Only set for the special events defined in [`Event`]; a plain
    /// periodic announce carries none.
    pub event: Option<Event>,
}

/// The optional announce event.
///
/// If not present, this is one of the announcements done at regular
/// intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The first request to a tracker must include this value.
    Started,
    /// Must be sent when the client becomes a seeder. Must not be sent if
    /// the client started as a seeder.
    Completed,
    /// Must be sent if the client is shutting down gracefully.
    Stopped,
}

impl Event {
    /// The event name in the HTTP announce query.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }

    /// The event code of the UDP announce packet.
    pub fn code(&self) -> u32 {
        match self {
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}
