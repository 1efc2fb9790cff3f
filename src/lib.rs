//! A per-torrent BitTorrent transfer core.
//!
//! Each active torrent runs one [`Torrent`]: a single-threaded event loop
//! that owns all torrent-wide state and coordinates tracker announcers,
//! peer handshakes, per-peer sessions, the piece picker and the
//! downloaders. Everything outside the loop is a task talking to it over
//! typed channels.
//!
//! The crate speaks the BitTorrent peer wire protocol (BEP-3) with the
//! fast extension (BEP-6) and the extension protocol (BEP-10) carrying
//! the metadata exchange (BEP-9), and announces over HTTP(S) and UDP
//! (BEP-15) trackers.
//!
//! What it deliberately does not own: the on-disk layout behind the
//! [`storage::PieceStore`] trait, the obfuscated-stream cipher of the
//! handshake, DHT and PEX (modeled as peer-address publishers), and any
//! persistent resume state.

// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

mod addrpool;
mod bufferpool;
mod define;
mod download;

pub mod announcer;
pub mod blockinfo;
pub mod conf;
pub mod error;
pub mod handshaker;
pub mod metainfo;
pub mod peer;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use conf::{Conf, EncryptionPolicy, TorrentConf};
pub use define::*;
pub use torrent::{Torrent, TorrentHandle, TorrentParams};
