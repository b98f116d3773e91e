use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::block::{Block, BlockData, BlockRequest};
use crate::Bitfield;

use super::PeerError;

/// Message IDs, including the fast extension (BEP 6).
mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const SUGGEST_PIECE: u8 = 13;
    pub const HAVE_ALL: u8 = 14;
    pub const HAVE_NONE: u8 = 15;
    pub const REJECT: u8 = 16;
    pub const ALLOWED_FAST: u8 = 17;
    pub const EXTENDED: u8 = 20;
}

#[cfg_attr(test, derive(Debug, Clone, PartialEq, Eq))]
pub enum Message {
    /// Advises the peer not to close the connection in the absence of other traffic.
    KeepAlive,

    /// Tells a peer that no further requests will be satisfied until an unchoke.
    Choke,

    /// Signifies that requests from the peer will now be served.
    Unchoke,

    /// Notifies a peer that the client is interested in making requests for blocks.
    Interested,

    /// Notifies a peer the client is no longer interested in requesting blocks.
    NotInterested,

    /// Tells a peer that the client has a piece, referenced by its index.
    Have { idx: u32 },

    /// Short form for communicating the whole of a client's pieces, sent once,
    /// directly after the handshake.
    Bitfield(Bitfield),

    /// Requests a block of a piece, naming its offset and length (usually 16 KiB).
    Request(BlockRequest),

    /// Carries a block's payload, referencing piece index and block offset.
    Block(Block),

    /// Cancels a previously sent request.
    Cancel(BlockRequest),

    /// Informs the peer of the port number a local DHT node would listen on.
    Port { port: u32 },

    /// Fast extension: "you should request this piece" (BEP 6).
    SuggestPiece { idx: u32 },

    /// Fast extension: in lieu of a bitfield, the sender has every piece.
    HaveAll,

    /// Fast extension: in lieu of a bitfield, the sender has no pieces.
    HaveNone,

    /// Fast extension: refuses a request that would otherwise go unanswered.
    Reject(BlockRequest),

    /// Fast extension: this piece may be requested even while choked.
    AllowedFast { idx: u32 },

    /// Extension protocol (BEP 10) handshake/message envelope; payload is the
    /// raw bencoded dictionary (and trailing bytes for ut_metadata/ut_pex),
    /// left for the embedder to interpret.
    Extended { id: u8, payload: Vec<u8> },
}

pub struct MessageCodec {
    pub fast_extension_enabled: bool,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self { fast_extension_enabled: false }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => dst.put_u32(0),

            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(id::CHOKE);
            }

            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(id::UNCHOKE);
            }

            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(id::INTERESTED);
            }

            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(id::NOT_INTERESTED);
            }

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(id::HAVE);
                dst.put_u32(idx);
            }

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(id::BITFIELD);
                dst.extend_from_slice(raw);
            }

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(id::REQUEST);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            }

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                let data = block.data.as_ref();
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(id::PIECE);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(data);
            }

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(id::CANCEL);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            }

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(id::PORT);
                dst.put_u32(port);
            }

            Message::SuggestPiece { idx } => {
                dst.put_u32(5);
                dst.put_u8(id::SUGGEST_PIECE);
                dst.put_u32(idx);
            }

            Message::HaveAll => {
                dst.put_u32(1);
                dst.put_u8(id::HAVE_ALL);
            }

            Message::HaveNone => {
                dst.put_u32(1);
                dst.put_u8(id::HAVE_NONE);
            }

            Message::Reject(block) => {
                dst.put_u32(13);
                dst.put_u8(id::REJECT);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            }

            Message::AllowedFast { idx } => {
                dst.put_u32(5);
                dst.put_u8(id::ALLOWED_FAST);
                dst.put_u32(idx);
            }

            Message::Extended { id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(id::EXTENDED);
                dst.put_u8(id);
                dst.extend_from_slice(&payload);
            }
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Can't read message length yet.
        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src);
        let msg_len: usize = peeker.get_u32() as usize;

        if src.remaining() >= 4 + msg_len {
            src.advance(4);
            if msg_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }
        } else {
            // Haven't received the whole message yet.
            return Ok(None);
        }

        let msg = match src.get_u8() {
            id::CHOKE => Message::Choke,
            id::UNCHOKE => Message::Unchoke,
            id::INTERESTED => Message::Interested,
            id::NOT_INTERESTED => Message::NotInterested,
            id::HAVE => Message::Have { idx: src.get_u32() },
            id::BITFIELD => {
                let mut bitfield = vec![0; msg_len - 1];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            }
            id::REQUEST => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Request(BlockRequest { piece_idx, offset, len })
            }
            id::PIECE => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let mut data = vec![0; msg_len - 9];
                src.copy_to_slice(&mut data);
                Message::Block(Block { piece_idx, offset, data: BlockData::Owned(data) })
            }
            id::CANCEL => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Cancel(BlockRequest { piece_idx, offset, len })
            }
            id::PORT => Message::Port { port: src.get_u32() },
            id::SUGGEST_PIECE => Message::SuggestPiece { idx: src.get_u32() },
            id::HAVE_ALL => Message::HaveAll,
            id::HAVE_NONE => Message::HaveNone,
            id::REJECT => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Reject(BlockRequest { piece_idx, offset, len })
            }
            id::ALLOWED_FAST => Message::AllowedFast { idx: src.get_u32() },
            id::EXTENDED => {
                let ext_id = src.get_u8();
                let mut payload = vec![0; msg_len - 2];
                src.copy_to_slice(&mut payload);
                Message::Extended { id: ext_id, payload }
            }
            msg_id => {
                tracing::warn!("invalid message id: {}", msg_id);
                return Err(PeerError::InvalidMessageId(msg_id));
            }
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(
                f,
                "request for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx, block.offset, block.len,
            ),
            Message::Block(block) => write!(
                f,
                "block data {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(
                f,
                "cancel for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx, block.offset, block.len
            ),
            Message::Port { port } => write!(f, "port {}", port),
            Message::SuggestPiece { idx } => write!(f, "suggest piece {}", idx),
            Message::HaveAll => write!(f, "have all"),
            Message::HaveNone => write!(f, "have none"),
            Message::Reject(block) => write!(
                f,
                "reject for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx, block.offset, block.len
            ),
            Message::AllowedFast { idx } => write!(f, "allowed fast piece {}", idx),
            Message::Extended { id, payload } => {
                write!(f, "extended message id {} ({} bytes)", id, payload.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;
    use bytes::BytesMut;

    #[test]
    fn test_msg_stream() {
        let mut out_buf = BytesMut::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 0]); // keep alive
        buf.extend_from_slice(&[0, 0, 0, 1, 0]); // choke
        buf.extend_from_slice(&[0, 0, 0, 1, 1]); // unchoke
        buf.extend_from_slice(&[0, 0, 0, 1, 2]); // interested
        buf.extend_from_slice(&[0, 0, 0, 1, 3]); // not interested
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]); // have
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]); // bitfield
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]); // request
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]); // piece

        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xb },
            Message::Bitfield(BitVec::<u8, Msb0>::from_slice(&[0x1, 0x2, 0x3])),
            Message::Request(BlockRequest { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::Block(Block {
                piece_idx: 0xb,
                offset: 0x134000,
                data: BlockData::Owned(vec![0x1, 0x2, 0x3]),
            }),
        ];
        let expected_buf = buf.clone();

        for msg in expected.into_iter() {
            let mut codec = MessageCodec::default();
            codec.encode(msg.clone(), &mut out_buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoded message does not match expected");
        }

        assert_eq!(out_buf, expected_buf, "encoded stream does not match expected");
    }

    #[test]
    fn test_msg_decode_chunked() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[0, 0, 0]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[1, 2]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Interested);

        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[0x2, 0x3]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Message::Block(Block {
                piece_idx: 0xb,
                offset: 0x134000,
                data: BlockData::Owned(vec![0x1, 0x2, 0x3]),
            }),
        );
    }

    #[test]
    fn test_msg_decode_empty() {
        let mut src = BytesMut::new();
        let mut codec = MessageCodec::default();
        assert_eq!(codec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn test_msg_decode_incomplete_message() {
        let mut src = BytesMut::from(&[0u8, 1, 2][..]);
        let mut codec = MessageCodec::default();
        assert_eq!(codec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn test_msg_decode_invalid_id() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 255][..]);
        let mut codec = MessageCodec::default();
        match codec.decode(&mut src) {
            Ok(_) => panic!("expected an error, got Ok(_)"),
            Err(PeerError::InvalidMessageId(id)) => assert_eq!(id, 255),
            Err(_) => panic!("expected PeerError::InvalidMessageId"),
        }
    }

    #[test]
    fn test_fast_extension_messages() {
        let mut codec = MessageCodec { fast_extension_enabled: true };
        let mut buf = BytesMut::new();

        for msg in [
            Message::HaveAll,
            Message::HaveNone,
            Message::SuggestPiece { idx: 7 },
            Message::AllowedFast { idx: 3 },
            Message::Reject(BlockRequest { piece_idx: 1, offset: 0, len: 0x4000 }),
        ] {
            codec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
        }
    }
}
