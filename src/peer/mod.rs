//! Per-peer state and the session tasks that own a peer's socket.
//!
//! A [`Peer`] value is owned by the torrent's event loop and carries the
//! protocol flags and bookkeeping of one remote peer; the reader and
//! writer tasks in [`session`] own the socket halves and talk to the loop
//! over channels only.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tokio::sync::{mpsc, watch};

use crate::handshaker::Cipher;
use crate::peer::codec::{ExtendedHandshake, Extensions, Message};
use crate::{Bitfield, PeerId};

pub mod codec;
pub mod session;

/// Peers are owned by the torrent and referred to by this stable index
/// everywhere else; no task holds a reference into the torrent's state.
pub type PeerKey = usize;

/// Where a peer address was learned from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerSource {
    /// The peer dialed us.
    Incoming,
    /// A tracker's announce response.
    Tracker,
    /// The distributed hash table.
    Dht,
    /// Peer-exchange gossip from another peer.
    Pex,
    /// Added by the API user.
    Manual,
}

impl fmt::Display for PeerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Incoming => "incoming",
            Self::Tracker => "tracker",
            Self::Dht => "dht",
            Self::Pex => "pex",
            Self::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// The torrent-side record of a connected peer.
pub(crate) struct Peer {
    pub addr: SocketAddr,
    pub id: PeerId,
    pub source: PeerSource,
    pub cipher: Cipher,
    /// The extensions both handshakes advertised.
    pub extensions: Extensions,

    /// True while we refuse to serve the peer's requests. Starts true, as
    /// the protocol demands.
    pub am_choking: bool,
    /// True while the peer has pieces we want.
    pub am_interested: bool,
    /// True while the peer refuses to serve our requests. Starts true.
    pub peer_choking: bool,
    /// True while the peer wants pieces we have.
    pub peer_interested: bool,

    /// The peer's piece availability. `None` until either the peer's
    /// bitfield/have-all/have-none arrives or the torrent metadata is
    /// known (whichever is later).
    pub bitfield: Option<Bitfield>,
    /// The peer's extension handshake, once received.
    pub ext_handshake: Option<ExtendedHandshake>,
    /// True when the peer accepted a block request but has not delivered
    /// within the snub window. Snubbed peers keep their running download
    /// but get no new assignments.
    pub snubbed: bool,
    /// Availability messages received before the torrent metadata was
    /// known, replayed in arrival order once it is.
    pub queued_messages: Vec<Message>,

    /// Control messages to the writer task.
    pub cmd_tx: session::Sender,
    /// Outbound block payloads; bounded, so control never queues behind
    /// piece data.
    pub block_tx: mpsc::Sender<Message>,
    /// Tells both session tasks to wind down.
    pub shutdown_tx: watch::Sender<bool>,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: SocketAddr,
        id: PeerId,
        source: PeerSource,
        cipher: Cipher,
        extensions: Extensions,
        cmd_tx: session::Sender,
        block_tx: mpsc::Sender<Message>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            addr,
            id,
            source,
            cipher,
            extensions,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: None,
            ext_handshake: None,
            snubbed: false,
            queued_messages: Vec::new(),
            cmd_tx,
            block_tx,
            shutdown_tx,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Enqueues a control message for the writer task. A dead session is
    /// not an error here; its disconnection event is already in flight.
    pub fn send(&self, msg: Message) {
        if self.cmd_tx.send(session::Command::Send(msg)).is_err() {
            log::debug!("peer {} session gone, dropping message", self.addr);
        }
    }

    pub fn reset_snub_timer(&self) {
        let _ = self.cmd_tx.send(session::Command::ResetSnubTimer);
    }

    pub fn stop_snub_timer(&self) {
        let _ = self.cmd_tx.send(session::Command::StopSnubTimer);
    }

    /// The request pipeline depth for this peer: what it advertised in its
    /// extension handshake, else the configured default.
    pub fn request_queue_len(&self, default: usize) -> usize {
        self.ext_handshake
            .as_ref()
            .and_then(|hs| hs.reqq)
            .filter(|&reqq| reqq > 0)
            .unwrap_or(default)
    }

    /// The extension message id the peer accepts metadata messages under.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.ext_handshake.as_ref().and_then(|hs| hs.ut_metadata())
    }
}
