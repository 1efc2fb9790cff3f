use std::io::{self, Cursor};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, MessageId};
use crate::blockinfo::BlockInfo;

/// Codec of the length-prefixed peer wire protocol, used after the
/// handshake has switched the connection into message mode.
pub struct PeerCodec;

/// Raises an `InvalidData` error for a message whose payload length does
/// not fit its id.
fn invalid_len(id: MessageId, msg_len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("invalid length {} for message {:?}", msg_len, id),
    )
}

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                // a keep-alive is just a zero length prefix
                buf.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => {
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("id of a non keep-alive") as u8);
            }
            Have { piece_index } | Suggest { piece_index }
            | AllowedFast { piece_index } => {
                let id = msg.id().expect("id of a non keep-alive") as u8;
                buf.put_u32(1 + 4);
                buf.put_u8(id);
                buf.put_u32(index_to_wire(piece_index)?);
            }
            Bitfield(bitfield) => {
                buf.put_u32(1 + bitfield.as_raw_slice().len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bitfield.as_raw_slice());
            }
            Request(block) | Cancel(block) | Reject(block) => {
                let id = msg.id().expect("id of a non keep-alive") as u8;
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(id);
                buf.put_u32(index_to_wire(block.piece_index)?);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 2 * 4 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(index_to_wire(piece_index)?);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Extended { id, payload } => {
                buf.put_u32(1 + 1 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without advancing the cursor, as the
        // rest of the message may not have arrived yet
        let mut tmp_buf = Cursor::new(&buf);
        let msg_len = tmp_buf.get_u32() as usize;

        if msg_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if buf.len() < 4 + msg_len {
            // preallocate for the rest of the message, typically a block
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        let id_byte = buf.get_u8();
        let id = MessageId::try_from_u8(id_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message id: {}", id_byte),
            )
        })?;

        use MessageId::*;
        let msg = match id {
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => {
                if msg_len != 1 {
                    return Err(invalid_len(id, msg_len));
                }
                match id {
                    Choke => Message::Choke,
                    Unchoke => Message::Unchoke,
                    Interested => Message::Interested,
                    NotInterested => Message::NotInterested,
                    HaveAll => Message::HaveAll,
                    HaveNone => Message::HaveNone,
                    _ => unreachable!(),
                }
            }
            Have | Suggest | AllowedFast => {
                if msg_len != 1 + 4 {
                    return Err(invalid_len(id, msg_len));
                }
                let piece_index = buf.get_u32() as usize;
                match id {
                    Have => Message::Have { piece_index },
                    Suggest => Message::Suggest { piece_index },
                    AllowedFast => Message::AllowedFast { piece_index },
                    _ => unreachable!(),
                }
            }
            Bitfield => {
                let data = buf.split_to(msg_len - 1);
                Message::Bitfield(crate::Bitfield::from_vec(data.to_vec()))
            }
            Request | Cancel | Reject => {
                if msg_len != 1 + 3 * 4 {
                    return Err(invalid_len(id, msg_len));
                }
                let block = BlockInfo {
                    piece_index: buf.get_u32() as usize,
                    offset: buf.get_u32(),
                    len: buf.get_u32(),
                };
                match id {
                    Request => Message::Request(block),
                    Cancel => Message::Cancel(block),
                    Reject => Message::Reject(block),
                    _ => unreachable!(),
                }
            }
            Piece => {
                if msg_len < 1 + 2 * 4 {
                    return Err(invalid_len(id, msg_len));
                }
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let data = buf.split_to(msg_len - 9).to_vec();
                Message::Piece {
                    piece_index,
                    offset,
                    data,
                }
            }
            Extended => {
                if msg_len < 2 {
                    return Err(invalid_len(id, msg_len));
                }
                let ext_id = buf.get_u8();
                let payload = buf.split_to(msg_len - 2).to_vec();
                Message::Extended {
                    id: ext_id,
                    payload,
                }
            }
        };

        Ok(Some(msg))
    }
}

/// On the wire piece indices are 4-byte big-endian integers.
fn index_to_wire(index: usize) -> io::Result<u32> {
    u32::try_from(index).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("piece index {} does not fit the wire", index),
        )
    })
}
