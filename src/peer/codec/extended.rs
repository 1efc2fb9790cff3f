//! Payloads of the extension protocol (BEP-10) and of the metadata
//! exchange riding on it (BEP-9).
//!
//! An `extended` wire frame carries a one-byte extension message id
//! followed by a bencoded payload; the metadata `data` message appends the
//! raw metadata slice after its bencoded header.

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

use crate::error::peer::{PeerError, Result};
use crate::metainfo::bencoded_value_len;

/// The extension message id of the extension handshake itself, fixed by
/// BEP-10.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The name under which the metadata exchange is negotiated.
pub const UT_METADATA_NAME: &str = "ut_metadata";

/// The extension message id under which *we* accept metadata messages,
/// advertised in our extension handshake.
pub const OUR_UT_METADATA_ID: u8 = 3;

/// Metadata is exchanged in slices of this size; only the last slice of
/// the info dictionary may be shorter.
pub const METADATA_PIECE_LEN: u32 = 0x4000;

/// The extension handshake: sent by both sides right after the base
/// handshake when both advertised the extension protocol.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ExtendedHandshake {
    /// Maps the names of supported extensions to the message ids the
    /// sender accepts them under. An id of 0 disables the extension.
    #[serde(default)]
    pub m: HashMap<String, u8>,

    /// The size of the info dictionary in bytes, if the sender has the
    /// metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u32>,

    /// The number of outstanding requests the sender is willing to queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<usize>,

    /// A human-readable client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

impl ExtendedHandshake {
    /// The handshake we send: metadata support plus our queue depth.
    pub fn ours(metadata_size: Option<u32>, reqq: usize) -> Self {
        let mut m = HashMap::new();
        m.insert(UT_METADATA_NAME.into(), OUR_UT_METADATA_ID);
        Self {
            m,
            metadata_size,
            reqq: Some(reqq),
            v: Some(concat!("riptide ", env!("CARGO_PKG_VERSION")).into()),
        }
    }

    /// The message id the peer accepts metadata messages under, if it
    /// supports the exchange at all.
    pub fn ut_metadata(&self) -> Option<u8> {
        match self.m.get(UT_METADATA_NAME) {
            Some(0) | None => None,
            Some(id) => Some(*id),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_bencode::to_bytes(self).expect("extension handshake encodes")
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(buf)
            .map_err(|_| PeerError::InvalidExtensionPayload)
    }
}

const METADATA_MSG_REQUEST: u8 = 0;
const METADATA_MSG_DATA: u8 = 1;
const METADATA_MSG_REJECT: u8 = 2;

/// A message of the metadata exchange.
#[derive(Clone, Debug, PartialEq)]
pub enum MetadataMessage {
    /// Asks for the metadata slice with the given index.
    Request { piece: u32 },
    /// Carries a metadata slice, together with the total metadata size so
    /// a requester can size its buffer on the first arriving slice.
    Data {
        piece: u32,
        total_size: u32,
        data: Vec<u8>,
    },
    /// Refuses a request, either for lack of metadata or as flood
    /// protection.
    Reject { piece: u32 },
}

/// The bencoded header common to all three metadata messages.
#[derive(Debug, Deserialize, Serialize)]
struct Header {
    msg_type: u8,
    piece: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<u32>,
}

impl MetadataMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let (header, data) = match self {
            Self::Request { piece } => (
                Header {
                    msg_type: METADATA_MSG_REQUEST,
                    piece: *piece,
                    total_size: None,
                },
                None,
            ),
            Self::Data {
                piece,
                total_size,
                data,
            } => (
                Header {
                    msg_type: METADATA_MSG_DATA,
                    piece: *piece,
                    total_size: Some(*total_size),
                },
                Some(data),
            ),
            Self::Reject { piece } => (
                Header {
                    msg_type: METADATA_MSG_REJECT,
                    piece: *piece,
                    total_size: None,
                },
                None,
            ),
        };
        let mut buf =
            serde_bencode::to_bytes(&header).expect("metadata header encodes");
        if let Some(data) = data {
            buf.extend_from_slice(data);
        }
        buf
    }

    /// Splits the payload into its self-delimiting bencoded header and,
    /// for a `data` message, the raw slice that follows it.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let header_len =
            bencoded_value_len(buf).ok_or(PeerError::InvalidExtensionPayload)?;
        let header: Header = serde_bencode::from_bytes(&buf[..header_len])
            .map_err(|_| PeerError::InvalidExtensionPayload)?;

        match header.msg_type {
            METADATA_MSG_REQUEST => Ok(Self::Request {
                piece: header.piece,
            }),
            METADATA_MSG_DATA => Ok(Self::Data {
                piece: header.piece,
                total_size: header
                    .total_size
                    .ok_or(PeerError::InvalidExtensionPayload)?,
                data: buf[header_len..].to_vec(),
            }),
            METADATA_MSG_REJECT => Ok(Self::Reject {
                piece: header.piece,
            }),
            _ => Err(PeerError::InvalidExtensionPayload),
        }
    }
}
