use std::io::{self, Cursor};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{PeerId, Sha1Hash};

pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The extension bits of the handshake's reserved field that this client
/// understands.
///
/// Everything else in the reserved field is ignored; what both sides set
/// is what a session may use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extensions {
    /// The fast extension (BEP-6): have-all/have-none, reject, suggest and
    /// allowed-fast messages.
    pub fast: bool,
    /// The extension protocol (BEP-10), which carries the metadata
    /// exchange (BEP-9).
    pub extension_protocol: bool,
}

impl Extensions {
    /// The extensions we advertise in every handshake.
    pub fn ours() -> Self {
        Self {
            fast: true,
            extension_protocol: true,
        }
    }

    pub fn from_reserved(reserved: [u8; 8]) -> Self {
        Self {
            fast: reserved[7] & 0x04 != 0,
            extension_protocol: reserved[5] & 0x10 != 0,
        }
    }

    pub fn to_reserved(self) -> [u8; 8] {
        let mut reserved = [0u8; 8];
        if self.fast {
            reserved[7] |= 0x04;
        }
        if self.extension_protocol {
            reserved[5] |= 0x10;
        }
        reserved
    }

    /// The extensions both sides advertised, the only ones a session may
    /// use.
    pub fn intersect(self, other: Self) -> Self {
        Self {
            fast: self.fast && other.fast,
            extension_protocol: self.extension_protocol
                && other.extension_protocol,
        }
    }
}

/// The message sent at the beginning of a peer session by both sides of
/// the connection.
///
/// Handshake data format:
///
/// ```txt
/// <Protocol Identifier length><Protocol Identifier><Reserved><Info hash><Peer id>
/// |      ---- 1 byte ----     |----19 bytes-------|-8 bytes-|-20 bytes-|-20 bytes-|
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Handshake {
    /// The protocol string, which must equal "BitTorrent protocol", as
    /// otherwise the connection is aborted.
    pub prot: [u8; 19],
    /// The reserved field, where the client's supported extensions are
    /// announced.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash, used to identify the torrent in the
    /// handshake and to verify the peer.
    pub info_hash: Sha1Hash,
    /// The arbitrary peer id, usually used to identify the torrent client.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a protocol version 1 handshake with the given identity and
    /// extension bits.
    pub fn new(
        info_hash: Sha1Hash,
        peer_id: PeerId,
        extensions: Extensions,
    ) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Handshake {
            prot,
            reserved: extensions.to_reserved(),
            info_hash,
            peer_id,
        }
    }

    pub fn extensions(&self) -> Extensions {
        Extensions::from_reserved(self.reserved)
    }

    /// Returns the length of the handshake, in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> u64 {
        19 + 8 + 20 + 20
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        // protocol length prefix
        debug_assert_eq!(prot.len(), 19);
        buf.put_u8(prot.len() as u8);
        // we should only be sending the bittorrent protocol string
        debug_assert_eq!(prot, PROTOCOL_STRING.as_bytes());

        // payload
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // `get_*` integer extractors consume the message bytes by
        // advancing buf's internal cursor. However, we don't want to do
        // this yet as we aren't sure we have the full message in the
        // buffer, so we only peek at the prefix.
        let mut tmp_buf = Cursor::new(&buf);
        let prot_len = tmp_buf.get_u8() as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                r#"handshake must start with the string "BitTorrent protocol""#,
            ));
        }

        // check that we got the full payload in the buffer; the length
        // prefix byte was not consumed so it is counted too
        let payload_len = prot_len + 8 + 20 + 20;
        if buf.remaining() > payload_len {
            // we have the full message in the buffer so advance the buffer
            // cursor past the length prefix
            buf.advance(1);
        } else {
            return Ok(None);
        }

        // protocol string
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        // reserved field
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        // info hash
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        // peer id
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}
