//! Handshake tasks for outgoing and incoming connections.
//!
//! Each handshake runs as its own task and reports back to the torrent's
//! event loop over a channel. The torrent tracks every task from creation
//! and releases the address's dial reservation when a handshake fails.
//!
//! The built-in handshaker speaks the plaintext BitTorrent handshake; the
//! obfuscated (MSE) stream cipher is an external concern. The
//! [`TorrentKeys`] capability carries the two lookups such an external
//! handshaker needs on the incoming side.

use std::fmt;
use std::net::SocketAddr;

use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::peer::Result as PeerResult;
use crate::peer::codec::{Extensions, HandshakeCodec};
use crate::peer::PeerSource;
use crate::{PeerId, Sha1Hash};

pub mod incoming;
pub mod outgoing;

/// The stream cipher a session was established with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cipher {
    /// No obfuscation.
    Plaintext,
    /// The MSE/PE obfuscated stream, as negotiated by an external
    /// handshaker.
    Obfuscated,
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plaintext => f.write_str("plaintext"),
            Self::Obfuscated => f.write_str("obfuscated"),
        }
    }
}

/// The key lookups an incoming handshake needs.
///
/// Handed to the handshake supervisor as a capability object rather than
/// as free callbacks.
pub trait TorrentKeys: Send + Sync + 'static {
    /// For the obfuscated handshake's torrent discovery: given the hash a
    /// connecting peer derived from its stream key, returns the matching
    /// info hash, if any.
    fn skey(&self, skey_hash: &Sha1Hash) -> Option<Sha1Hash>;

    /// For plaintext handshakes: whether this info hash is one we serve.
    fn check_info_hash(&self, info_hash: &Sha1Hash) -> bool;
}

/// [`TorrentKeys`] of a single torrent: the per-torrent core only ever
/// serves its own info hash.
pub struct SingleTorrentKeys {
    info_hash: Sha1Hash,
    skey_hash: Sha1Hash,
}

impl SingleTorrentKeys {
    pub fn new(info_hash: Sha1Hash) -> Self {
        // the obfuscated handshake identifies the torrent by
        // SHA-1("req2" || info_hash)
        let mut hasher = Sha1::new();
        hasher.update(b"req2");
        hasher.update(info_hash);
        Self {
            info_hash,
            skey_hash: hasher.finalize().into(),
        }
    }
}

impl TorrentKeys for SingleTorrentKeys {
    fn skey(&self, skey_hash: &Sha1Hash) -> Option<Sha1Hash> {
        if *skey_hash == self.skey_hash {
            Some(self.info_hash)
        } else {
            None
        }
    }

    fn check_info_hash(&self, info_hash: &Sha1Hash) -> bool {
        *info_hash == self.info_hash
    }
}

/// A successfully handshaken connection, ready to become a peer session.
///
/// The handshake-codec socket is handed over whole so that any bytes the
/// peer sent right after its handshake stay in the read buffer when the
/// session switches to the message codec.
pub(crate) struct Established {
    pub socket: Framed<TcpStream, HandshakeCodec>,
    pub peer_id: PeerId,
    /// The extensions both sides advertised.
    pub extensions: Extensions,
    pub cipher: Cipher,
}

/// What an outgoing handshake task reports back.
pub(crate) struct OutgoingResult {
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub result: PeerResult<Established>,
}

/// What an incoming handshake task reports back.
pub(crate) struct IncomingResult {
    pub addr: SocketAddr,
    pub result: PeerResult<Established>,
}
