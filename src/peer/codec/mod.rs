pub mod extended;
pub mod handshake;
pub mod message;
pub mod wire;

pub use extended::{
    ExtendedHandshake, MetadataMessage, EXTENSION_HANDSHAKE_ID,
    METADATA_PIECE_LEN, OUR_UT_METADATA_ID, UT_METADATA_NAME,
};
pub use handshake::{Extensions, Handshake, HandshakeCodec, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::PeerCodec;
