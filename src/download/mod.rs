//! Downloaders track the outstanding requests of one (piece, peer) pair:
//! [`piece::PieceDownloader`] for content pieces, [`info::InfoDownloader`]
//! for the metadata exchanged through the extension protocol.

pub mod info;
pub mod piece;

pub(crate) use info::InfoDownloader;
pub(crate) use piece::PieceDownloader;
