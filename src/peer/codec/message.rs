use crate::blockinfo::BlockInfo;
use crate::{Bitfield, PieceIndex};

/// The message ids of the wire protocol: the BEP-3 base set, the BEP-6
/// fast extension and the BEP-10 extension protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    Extended = 20,
}

impl MessageId {
    /// Maps a wire byte back to a message id. Anything outside the
    /// vocabulary is a protocol violation and severs the connection.
    pub fn try_from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Choke),
            1 => Some(Self::Unchoke),
            2 => Some(Self::Interested),
            3 => Some(Self::NotInterested),
            4 => Some(Self::Have),
            5 => Some(Self::Bitfield),
            6 => Some(Self::Request),
            7 => Some(Self::Piece),
            8 => Some(Self::Cancel),
            13 => Some(Self::Suggest),
            14 => Some(Self::HaveAll),
            15 => Some(Self::HaveNone),
            16 => Some(Self::Reject),
            17 => Some(Self::AllowedFast),
            20 => Some(Self::Extended),
            _ => None,
        }
    }
}

/// The actual messages exchanged by peers.
#[derive(Debug, PartialEq)]
#[cfg_attr(test, derive(Clone))]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// Fast extension: a hint that we may want to request this piece.
    Suggest {
        piece_index: PieceIndex,
    },
    /// Fast extension: the peer has every piece; stands in for a full
    /// bitfield.
    HaveAll,
    /// Fast extension: the peer has no pieces; stands in for an empty
    /// bitfield.
    HaveNone,
    /// Fast extension: an explicit refusal to serve a request.
    Reject(BlockInfo),
    /// Fast extension: we may request this piece even while choked.
    AllowedFast {
        piece_index: PieceIndex,
    },
    /// An extension-protocol frame: the negotiated extension message id
    /// followed by its raw payload.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// Returns the message's id, or `None` for a keep-alive, which has no
    /// id on the wire.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Piece { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Suggest { .. } => Some(MessageId::Suggest),
            Self::HaveAll => Some(MessageId::HaveAll),
            Self::HaveNone => Some(MessageId::HaveNone),
            Self::Reject(_) => Some(MessageId::Reject),
            Self::AllowedFast { .. } => Some(MessageId::AllowedFast),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}
