//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

use crate::PeerId;

/// The client id prefix announced to trackers and peers, in the Azureus
/// convention.
pub const CLIENT_PREFIX: &[u8; 8] = b"-RT0010-";

/// Returns a freshly generated peer id: the client prefix followed by
/// twelve random printable bytes.
pub fn generate_peer_id() -> PeerId {
    use rand::Rng;
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}

/// The global configuration for the transfer engine and all its parts.
#[derive(Debug, Clone)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults and a freshly
    /// generated client id.
    pub fn new(listen_port: u16) -> Self {
        Self {
            engine: EngineConf {
                client_id: generate_peer_id(),
                listen_port,
            },
            torrent: TorrentConf::default(),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Debug, Clone)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The TCP port the client accepts peer connections on. Announced to
    /// trackers; the engine itself does not bind it.
    pub listen_port: u16,
}

/// Policy for the outgoing handshake's stream obfuscation.
///
/// The obfuscated (MSE) cipher is provided by an external handshaker; the
/// built-in handshaker speaks plaintext only, so `Force` can only be
/// satisfied when such an external implementation is plugged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionPolicy {
    /// Never obfuscate the stream.
    Disabled,
    /// Try obfuscation where available, fall back to plaintext.
    Auto,
    /// Require obfuscation; fail the handshake otherwise.
    Force,
}

/// Configuration for a single torrent's transfer core.
#[derive(Debug, Clone)]
pub struct TorrentConf {
    /// How long the dialer waits for a TCP connection to be established.
    pub peer_connect_timeout: Duration,

    /// How long a handshake, once connected, may take end to end.
    pub peer_handshake_timeout: Duration,

    /// The per-read deadline of a peer session. A peer that keeps a socket
    /// open without sending anything for this long is disconnected.
    pub piece_read_timeout: Duration,

    /// How long we wait for a requested block before declaring the peer
    /// snubbed.
    pub snub_timeout: Duration,

    /// Interval of the keep-alive messages the writer emits on an
    /// otherwise idle connection.
    pub keep_alive_interval: Duration,

    /// The number of concurrently dialed (connected or handshaking)
    /// outgoing peers.
    pub max_peer_dial: usize,

    /// The default outstanding-request pipeline depth per peer, used when
    /// the peer did not advertise its own queue length (`reqq`) in its
    /// extension handshake.
    pub request_queue_len: usize,

    /// The request queue length we advertise to peers in our extension
    /// handshake.
    pub advertised_request_queue_len: usize,

    /// Bound of the per-peer outbound block-payload channel. Control
    /// messages travel on a separate, unbounded channel so they never
    /// queue behind piece data.
    pub piece_channel_len: usize,

    /// The maximum number of piece buffers checked out at any time, which
    /// bounds the number of concurrently downloading pieces.
    pub buffer_pool_len: usize,

    /// How many peers may download torrent metadata concurrently.
    pub parallel_metadata_downloads: usize,

    /// In endgame mode a piece may be assigned to at most this many peers
    /// at once.
    pub endgame_duplication: usize,

    /// The announce interval used when the tracker does not provide one.
    pub announce_interval: Duration,

    /// The deadline for the `stopped` announce fan-out on shutdown.
    pub stop_announce_timeout: Duration,

    /// Outgoing handshake obfuscation policy.
    pub encryption: EncryptionPolicy,
}

impl Default for TorrentConf {
    fn default() -> Self {
        TorrentConf {
            peer_connect_timeout: Duration::from_secs(5),
            peer_handshake_timeout: Duration::from_secs(10),
            piece_read_timeout: Duration::from_secs(70),
            snub_timeout: Duration::from_secs(20),
            keep_alive_interval: Duration::from_secs(120),
            max_peer_dial: 40,
            request_queue_len: 50,
            advertised_request_queue_len: 250,
            piece_channel_len: 4,
            buffer_pool_len: 16,
            parallel_metadata_downloads: 2,
            endgame_duplication: 2,
            announce_interval: Duration::from_secs(5 * 60),
            stop_announce_timeout: Duration::from_secs(5),
            encryption: EncryptionPolicy::Auto,
        }
    }
}
