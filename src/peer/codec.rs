//! The codecs of the peer wire protocol: the 68 byte handshake and the
//! length prefixed messages that follow it.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The protocol string transferred in the handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// An upper bound on the frames we accept. The largest legitimate message is
/// a block (16 KiB payload) or a bitfield, both far below this; anything
/// larger is a peer trying to make us buffer indefinitely.
const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// The handshake exchanged as the first message on every peer connection.
///
/// It is not length prefixed like the rest of the protocol: it is always
/// exactly 68 bytes long.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Eight reserved bytes, all zero as we use no protocol extensions.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash.
    pub info_hash: Sha1Hash,
    /// The sending client's arbitrary peer id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a new protocol version 1 handshake with the given info hash
    /// and peer id.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Codec for the handshake. Used on a fresh connection, after which the
/// socket is switched over to [`PeerCodec`], carrying over any extra bytes
/// the peer sent after its handshake.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        buf.reserve(68);
        buf.put_u8(prot.len() as u8);
        buf.put_slice(&prot);
        buf.put_slice(&reserved);
        buf.put_slice(&info_hash);
        buf.put_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the protocol length is checked before waiting for the rest of the
        // handshake so that a bogus greeting fails fast
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::InvalidHandshake);
        }

        // protocol length prefix + protocol string + reserved + info hash
        // + peer id
        if buf.len() < 68 {
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidHandshake);
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
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

/// The id of a framed message, the byte after the length prefix.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(id: u8) -> std::result::Result<Self, u8> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            id => Err(id),
        }
    }
}

/// A peer protocol message, decoded from or encoded into the framed wire
/// layout `<length: u32 big endian><id: u8><payload>`. The length counts the
/// id and the payload but not itself; a length of zero is a keep alive.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
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
    /// The payload of a `Request` we made earlier. The canonical name of
    /// this message is "piece", even though it carries a single block.
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the id of the message, or `None` for a keep alive, which has
    /// no id on the wire.
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
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

/// Codec for the protocol messages that follow the handshake.
///
/// Together with `tokio_util::codec::Framed` this turns the connection's
/// byte stream into a lazy sequence of messages: the length prefix is peeked
/// without consuming input until the whole frame is buffered, frames with
/// unknown ids are skipped, and at EOF any fully buffered frames are still
/// yielded before the stream terminates. A trailing partial frame at EOF is
/// discarded and the stream terminates cleanly.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let data = bitfield.as_slice();
                buf.put_u32(1 + data.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(data);
            }
            Message::Request(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 2 * 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }

        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        // frames with unknown ids are skipped, so decoding continues with
        // the next buffered frame rather than returning
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at the length prefix without consuming it, as the whole
            // frame may not be buffered yet
            let mut prefix = [0; 4];
            prefix.copy_from_slice(&buf[0..4]);
            let frame_len = u32::from_be_bytes(prefix) as usize;

            if frame_len > MAX_FRAME_LEN {
                return Err(Error::Codec(format!(
                    "frame length {} exceeds limit",
                    frame_len
                )));
            }

            if frame_len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if buf.len() < 4 + frame_len {
                buf.reserve(4 + frame_len - buf.len());
                return Ok(None);
            }
            buf.advance(4);
            let mut frame = buf.split_to(frame_len);

            let id = frame.get_u8();
            let msg_id = match MessageId::try_from(id) {
                Ok(msg_id) => msg_id,
                Err(id) => {
                    log::debug!("Skipping frame with unknown message id {}", id);
                    continue;
                }
            };

            let msg = match msg_id {
                MessageId::Choke => expect_empty(frame, Message::Choke)?,
                MessageId::Unchoke => expect_empty(frame, Message::Unchoke)?,
                MessageId::Interested => {
                    expect_empty(frame, Message::Interested)?
                }
                MessageId::NotInterested => {
                    expect_empty(frame, Message::NotInterested)?
                }
                MessageId::Have => {
                    expect_payload(&frame, 4, MessageId::Have)?;
                    Message::Have {
                        piece_index: frame.get_u32() as PieceIndex,
                    }
                }
                MessageId::Bitfield => {
                    Message::Bitfield(Bitfield::from_vec(frame.to_vec()))
                }
                MessageId::Request => {
                    expect_payload(&frame, 3 * 4, MessageId::Request)?;
                    Message::Request(decode_block_info(&mut frame))
                }
                MessageId::Block => {
                    if frame.remaining() < 2 * 4 {
                        return Err(Error::Codec(format!(
                            "block message with {} byte payload",
                            frame.remaining()
                        )));
                    }
                    Message::Block {
                        piece_index: frame.get_u32() as PieceIndex,
                        offset: frame.get_u32(),
                        data: frame.to_vec(),
                    }
                }
                MessageId::Cancel => {
                    expect_payload(&frame, 3 * 4, MessageId::Cancel)?;
                    Message::Cancel(decode_block_info(&mut frame))
                }
            };

            return Ok(Some(msg));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        // any complete frames still buffered at EOF are yielded as usual; a
        // trailing partial frame cannot become a message anymore, so the
        // leftover bytes are dropped and the stream ends
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None => {
                if !buf.is_empty() {
                    log::debug!(
                        "Discarding {} byte partial frame at EOF",
                        buf.len()
                    );
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

/// Checks that a fixed layout message has exactly the expected payload size.
fn expect_payload(
    frame: &BytesMut,
    expected: usize,
    id: MessageId,
) -> Result<()> {
    if frame.remaining() != expected {
        Err(Error::Codec(format!(
            "{:?} message with {} byte payload, expected {}",
            id,
            frame.remaining(),
            expected
        )))
    } else {
        Ok(())
    }
}

/// Checks that a message defined to have no payload indeed has none.
fn expect_empty(frame: BytesMut, msg: Message) -> Result<Message> {
    if !frame.is_empty() {
        Err(Error::Codec(format!(
            "{:?} message with a {} byte payload",
            msg.id(),
            frame.len()
        )))
    } else {
        Ok(msg)
    }
}

fn decode_block_info(frame: &mut BytesMut) -> BlockInfo {
    BlockInfo {
        piece_index: frame.get_u32() as PieceIndex,
        offset: frame.get_u32(),
        len: frame.get_u32(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode_msg(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_handshake_roundtrip() {
        let peer_id = *b"-PC0001-000000000000";
        let handshake = Handshake::new([0; 20], peer_id);

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &[0; 20]);
        assert_eq!(&buf[48..68], peer_id.as_ref());

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_incomplete() {
        let mut buf = BytesMut::new();
        HandshakeCodec
            .encode(Handshake::new([0xab; 20], [1; 20]), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(67);
        assert_eq!(HandshakeCodec.decode(&mut partial).unwrap(), None);

        // once the last byte arrives the handshake is complete
        partial.unsplit(buf);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_handshake_invalid_protocol() {
        let mut buf = BytesMut::new();
        buf.put_u8(11);
        buf.put_slice(b"hello world");
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_have() {
        let mut buf = BytesMut::from(
            &[0x00, 0x00, 0x00, 0x05, 0x04, 0x00, 0x00, 0x00, 0x2a][..],
        );
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Have { piece_index: 42 });
    }

    #[test]
    fn test_encode_request() {
        let buf = encode_msg(Message::Request(BlockInfo {
            piece_index: 1,
            offset: 16384,
            len: 16384,
        }));
        assert_eq!(
            &buf[..],
            &[
                0x00, 0x00, 0x00, 0x0d, 0x06, 0x00, 0x00, 0x00, 0x01, 0x00,
                0x00, 0x40, 0x00, 0x00, 0x00, 0x40, 0x00
            ][..]
        );
    }

    #[test]
    fn test_keep_alive() {
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00, 0x00][..]);
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::KeepAlive);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bitfield_roundtrip() {
        let bitfield = Bitfield::from_vec(vec![0b1010_0000]);
        let mut buf = encode_msg(Message::Bitfield(bitfield));
        assert_eq!(&buf[..], &[0x00, 0x00, 0x00, 0x02, 0x05, 0b1010_0000][..]);

        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Bitfield(decoded) => {
                // indexing is MSB first: the first piece is the highest bit
                assert!(decoded[0]);
                assert!(!decoded[1]);
                assert!(decoded[2]);
            }
            msg => panic!("expected bitfield, got {:?}", msg),
        }
    }

    #[test]
    fn test_block_roundtrip() {
        let data = vec![0xfe; 100];
        let mut buf = encode_msg(Message::Block {
            piece_index: 3,
            offset: 16384,
            data: data.clone(),
        });
        assert_eq!(buf.len(), 4 + 9 + data.len());

        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            Message::Block {
                piece_index: 3,
                offset: 16384,
                data,
            }
        );
    }

    #[test]
    fn test_decode_chunked_frames() {
        let mut wire = BytesMut::new();
        let msgs = vec![
            Message::Unchoke,
            Message::Have { piece_index: 7 },
            Message::KeepAlive,
            Message::Block {
                piece_index: 0,
                offset: 0,
                data: vec![1, 2, 3, 4, 5],
            },
            Message::Choke,
        ];
        for msg in msgs.iter().cloned() {
            PeerCodec.encode(msg, &mut wire).unwrap();
        }

        // feed the wire bytes to the decoder in 3 byte chunks, mimicking
        // arbitrary TCP segmentation
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        while !wire.is_empty() {
            let n = wire.len().min(3);
            buf.extend_from_slice(&wire.split_to(n));
            while let Some(msg) = PeerCodec.decode(&mut buf).unwrap() {
                decoded.push(msg);
            }
        }

        assert_eq!(decoded, msgs);
    }

    #[test]
    fn test_skip_unknown_message_id() {
        let mut buf = BytesMut::new();
        // a 5 byte frame with the unassigned id 20
        buf.put_u32(5);
        buf.put_u8(20);
        buf.put_slice(&[0xff; 4]);
        PeerCodec.encode(Message::Interested, &mut buf).unwrap();

        // the unknown frame is skipped and the next one decoded instead
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Interested);
    }

    #[test]
    fn test_decode_eof_with_partial_frame() {
        let mut buf = encode_msg(Message::Have { piece_index: 1 });
        // a truncated frame follows the complete one
        buf.put_slice(&[0x00, 0x00, 0x00, 0x05, 0x04]);

        // the complete frame is still yielded, then the stream terminates
        // despite the leftover bytes
        let msg = PeerCodec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Have { piece_index: 1 });
        assert_eq!(PeerCodec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reject_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN as u32 + 1);
        buf.put_u8(MessageId::Bitfield as u8);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_reject_wrong_payload_size() {
        // a have message whose length prefix claims a 2 byte payload
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(MessageId::Have as u8);
        buf.put_slice(&[0x00, 0x2a]);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }
}
