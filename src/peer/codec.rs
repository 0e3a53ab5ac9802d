//! The BitTorrent wire protocol codecs: the fixed size handshake frame and
//! the length prefixed message frames exchanged after it.
//!
//! Covers the BEP-3 core messages, the BEP-5 `port` message, the BEP-6 fast
//! extension messages, and the BEP-10 `extended` envelope (whose bencoded
//! payloads are interpreted a layer up, in the metadata and peer exchange
//! code).

use std::{convert::TryFrom, io};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PieceIndex};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Until the metainfo (and with it the piece length) is known, frames up to
/// this size are accepted. 2 MiB covers the largest piece length the torrent
/// creator produces.
pub(crate) const DEFAULT_MAX_FRAME_LEN: u32 = 2 * 1024 * 1024 + 16;

/// The handshake is the first message exchanged in both directions on a new
/// connection. It is a fixed 68 byte frame with no length prefix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal "BitTorrent protocol", as
    /// otherwise the connection is aborted.
    pub prot: [u8; 19],
    /// The reserved field, in which the client's supported protocol
    /// extensions are announced bit by bit.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash, used to identify the torrent in the
    /// handshake and to verify the peer.
    pub info_hash: [u8; 20],
    /// The arbitrary peer id, usually used to identify the torrent client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates the handshake we send, advertising extension protocol and
    /// fast extension support.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        // BEP-10 extension protocol
        reserved[5] |= 0x10;
        // BEP-6 fast extension
        reserved[7] |= 0x04;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the peer supports the BEP-10 extension protocol.
    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    /// Whether the peer supports the BEP-6 fast extension.
    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & 0x04 != 0
    }

    /// Whether the peer supports DHT (BEP-5) and may send us a `port`
    /// message.
    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & 0x01 != 0
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
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
    Port = 9,
    // BEP-6 fast extension
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // BEP-10 extension protocol
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;
    fn try_from(id: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Block),
            8 => Ok(Cancel),
            9 => Ok(Port),
            13 => Ok(Suggest),
            14 => Ok(HaveAll),
            15 => Ok(HaveNone),
            16 => Ok(Reject),
            17 => Ok(AllowedFast),
            20 => Ok(Extended),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unknown message id",
            )),
        }
    }
}

/// A post-handshake protocol message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { info: BlockInfo, data: Vec<u8> },
    Cancel(BlockInfo),
    /// The peer's DHT node port (BEP-5). Forwarded to the DHT plug-in, if
    /// any.
    Port(u16),
    /// The peer suggests we download this piece (BEP-6).
    Suggest { piece_index: PieceIndex },
    /// Fast extension replacements for an all-ones/all-zeros bitfield.
    HaveAll,
    HaveNone,
    /// The peer will not serve this request (BEP-6).
    Reject(BlockInfo),
    /// We may request this piece even while choked (BEP-6).
    AllowedFast { piece_index: PieceIndex },
    /// A BEP-10 extension message. Id 0 is the extended handshake;
    /// anything else is dispatched through the ids agreed in it.
    Extended { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Returns the message's id, or `None` for a keepalive, which has none.
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
            Self::Port(_) => Some(MessageId::Port),
            Self::Suggest { .. } => Some(MessageId::Suggest),
            Self::HaveAll => Some(MessageId::HaveAll),
            Self::HaveNone => Some(MessageId::HaveNone),
            Self::Reject(_) => Some(MessageId::Reject),
            Self::AllowedFast { .. } => Some(MessageId::AllowedFast),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}

pub(crate) struct HandshakeCodec;

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

        // protocol string length prefix
        debug_assert_eq!(prot.len(), 19);
        buf.put_u8(prot.len() as u8);
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

        // `get_u8` advances the buffer so only peek here: the rest of the
        // frame may not have arrived yet
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "handshake protocol string must be \"BitTorrent protocol\"",
            ));
        }

        // check that the full frame is in the buffer
        let payload_len = prot_len + 8 + 20 + 20;
        if buf.remaining() < 1 + payload_len {
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "handshake protocol string must be \"BitTorrent protocol\"",
            ));
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

/// Codec for the length prefixed frames:
/// `[length u32 big endian][message id u8][payload]`.
///
/// A zero length frame is a keepalive. Frames larger than the cap (derived
/// from the torrent's piece length once known) abort the connection.
pub(crate) struct PeerCodec {
    /// The largest frame we accept.
    max_frame_len: u32,
}

impl PeerCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Tightens the frame cap once the piece length is known: no valid
    /// message is larger than a whole piece plus the block message header.
    pub fn set_max_frame_len(&mut self, piece_len: u32) {
        self.max_frame_len = piece_len + 16;
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;

        // the id is written after the length prefix for every message but
        // the keepalive
        let id = msg.id();

        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => {
                // message length prefix: 1 byte message id, no payload
                buf.put_u32(1);
                buf.put_u8(id.unwrap() as u8);
            }
            Have { piece_index } | Suggest { piece_index }
            | AllowedFast { piece_index } => {
                // 1 byte message id and 4 byte piece index
                buf.put_u32(1 + 4);
                buf.put_u8(id.unwrap() as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                // 1 byte message id and n byte bitfield
                //
                // NOTE: take the length of the underlying storage to get the
                // number of _bytes_, as `bitfield.len()` returns the number
                // of _bits_
                let msg_len = 1 + bitfield.as_raw_slice().len();
                buf.put_u32(msg_len as u32);
                buf.put_u8(id.unwrap() as u8);
                buf.extend_from_slice(bitfield.as_raw_slice());
            }
            Request(block) | Cancel(block) | Reject(block) => {
                // 1 byte message id, 4 byte piece index, 4 byte offset,
                // 4 byte length
                buf.put_u32(1 + 12);
                buf.put_u8(id.unwrap() as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block { info, data } => {
                // 1 byte message id, 4 byte piece index, 4 byte offset, and
                // n byte block
                debug_assert_eq!(info.len as usize, data.len());
                let msg_len = 1 + 8 + data.len();
                buf.put_u32(msg_len as u32);
                buf.put_u8(id.unwrap() as u8);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.extend_from_slice(&data);
            }
            Port(port) => {
                // 1 byte message id and 2 byte port
                buf.put_u32(1 + 2);
                buf.put_u8(id.unwrap() as u8);
                buf.put_u16(port);
            }
            Extended { id: ext_id, payload } => {
                // 1 byte message id, 1 byte extended id, n byte payload
                let msg_len = 1 + 1 + payload.len();
                buf.put_u32(msg_len as u32);
                buf.put_u8(id.unwrap() as u8);
                buf.put_u8(ext_id);
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
        // the message length header must be present at the minimum,
        // otherwise we can't determine the message size
        if buf.len() < 4 {
            return Ok(None);
        }

        let msg_len =
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        // refuse oversized frames before buffering them
        if msg_len > self.max_frame_len as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds maximum message size",
            ));
        }

        // the message length is only 0 if this is a keepalive (all other
        // message types have at least the message id)
        if msg_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        // check that the full frame is in the buffer
        if buf.remaining() < 4 + msg_len {
            // reserve space for the rest of the frame to avoid repeated
            // reallocations as it trickles in
            buf.reserve(4 + msg_len - buf.remaining());
            return Ok(None);
        }
        buf.advance(4);

        let msg_id = MessageId::try_from(buf.get_u8())?;

        let check_payload_len = |expected: usize| {
            if msg_len == 1 + expected {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message payload length mismatch",
                ))
            }
        };

        let msg = match msg_id {
            MessageId::Choke => {
                check_payload_len(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                check_payload_len(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                check_payload_len(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                check_payload_len(0)?;
                Message::NotInterested
            }
            MessageId::HaveAll => {
                check_payload_len(0)?;
                Message::HaveAll
            }
            MessageId::HaveNone => {
                check_payload_len(0)?;
                Message::HaveNone
            }
            MessageId::Have => {
                check_payload_len(4)?;
                Message::Have {
                    piece_index: buf.get_u32() as PieceIndex,
                }
            }
            MessageId::Suggest => {
                check_payload_len(4)?;
                Message::Suggest {
                    piece_index: buf.get_u32() as PieceIndex,
                }
            }
            MessageId::AllowedFast => {
                check_payload_len(4)?;
                Message::AllowedFast {
                    piece_index: buf.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                // the bitfield length is the message length without the id
                let mut bitfield = vec![0; msg_len - 1];
                buf.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            }
            MessageId::Request => {
                check_payload_len(12)?;
                Message::Request(decode_block_info(buf))
            }
            MessageId::Cancel => {
                check_payload_len(12)?;
                Message::Cancel(decode_block_info(buf))
            }
            MessageId::Reject => {
                check_payload_len(12)?;
                Message::Reject(decode_block_info(buf))
            }
            MessageId::Block => {
                if msg_len < 1 + 8 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "block message too short",
                    ));
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                // the block length is the message length without the header
                let mut data = vec![0; msg_len - 9];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    info: BlockInfo {
                        piece_index,
                        offset,
                        len: data.len() as u32,
                    },
                    data,
                }
            }
            MessageId::Port => {
                check_payload_len(2)?;
                Message::Port(buf.get_u16())
            }
            MessageId::Extended => {
                if msg_len < 2 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "extended message too short",
                    ));
                }
                let id = buf.get_u8();
                let mut payload = vec![0; msg_len - 2];
                buf.copy_to_slice(&mut payload);
                Message::Extended { id, payload }
            }
        };

        Ok(Some(msg))
    }
}

fn decode_block_info(buf: &mut BytesMut) -> BlockInfo {
    let piece_index = buf.get_u32() as PieceIndex;
    let offset = buf.get_u32();
    let len = buf.get_u32();
    BlockInfo {
        piece_index,
        offset,
        len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    // Tests a stream of arbitrary messages to ensure that not only do they
    // encode and then decode correctly, but that the buffer cursor is
    // properly advanced by the codec in both cases.
    #[test]
    fn test_message_stream() {
        let (handshake, encoded_handshake) = make_handshake();
        let msgs = [
            make_choke(),
            make_unchoke(),
            make_interested(),
            make_not_interested(),
            make_bitfield(),
            make_have(),
            make_request(),
            make_block(),
            make_port(),
            make_have_all(),
            make_have_none(),
            make_reject(),
            make_allowed_fast(),
            make_extended(),
            make_cancel(),
            make_choke(),
        ];

        // create a byte stream of all the above messages
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded_handshake);
        for (_, encoded) in &msgs {
            buf.extend_from_slice(encoded);
        }

        // decode the messages in the order they were encoded, starting with
        // the handshake
        let decoded_handshake = HandshakeCodec.decode(&mut buf).unwrap();
        assert_eq!(decoded_handshake, Some(handshake));
        let mut codec = PeerCodec::new();
        for (msg, _) in &msgs {
            let decoded_msg = codec.decode(&mut buf).unwrap();
            assert_eq!(decoded_msg.unwrap(), *msg);
        }
        assert!(buf.is_empty());
    }

    // Tests the encoding and subsequent decoding of a valid handshake.
    #[test]
    fn test_handshake_codec() {
        let (handshake, expected_encoded) = make_handshake();

        let mut encoded = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut encoded).unwrap();
        assert_eq!(encoded, expected_encoded);

        // don't decode a handshake from a partial frame
        let mut partial_encoded: BytesMut = encoded[0..30].into();
        let decoded = HandshakeCodec.decode(&mut partial_encoded).unwrap();
        assert_eq!(decoded, None);

        let decoded = HandshakeCodec.decode(&mut encoded).unwrap();
        assert_eq!(decoded, Some(handshake));
    }

    // Tests that decoding a handshake with an invalid protocol string
    // results in an error.
    #[test]
    fn test_invalid_handshake_decoding() {
        let mut invalid_encoded = {
            let prot = "not the BitTorrent protocol";
            let mut buf = BytesMut::new();
            buf.put_u8(prot.len() as u8);
            buf.extend_from_slice(prot.as_bytes());
            buf.extend_from_slice(&[0; 8 + 20 + 20]);
            buf
        };
        assert!(HandshakeCodec.decode(&mut invalid_encoded).is_err());
    }

    // Tests that the handshake we send advertises the extensions we
    // implement, and that the bits are recognized when decoding.
    #[test]
    fn test_handshake_reserved_bits() {
        let handshake = Handshake::new([0; 20], [0; 20]);
        assert!(handshake.supports_extended());
        assert!(handshake.supports_fast());
        assert!(!handshake.supports_dht());

        let mut all_zeros = handshake;
        all_zeros.reserved = [0; 8];
        assert!(!all_zeros.supports_extended());
        assert!(!all_zeros.supports_fast());
    }

    // Tests that a frame whose advertised length exceeds the cap is
    // rejected without waiting for its payload to arrive.
    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = PeerCodec::new();
        codec.set_max_frame_len(BLOCK_LEN);

        let mut buf = BytesMut::new();
        buf.put_u32(BLOCK_LEN + 17);
        buf.put_u8(MessageId::Block as u8);
        assert!(codec.decode(&mut buf).is_err());

        // a frame at exactly the cap is fine
        let mut buf = BytesMut::new();
        buf.put_u32(BLOCK_LEN + 16);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_message_id_rejected() {
        let mut codec = PeerCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        assert!(codec.decode(&mut buf).is_err());
    }

    // Tests that a message whose payload doesn't match its id's fixed
    // length is rejected.
    #[test]
    fn test_payload_length_mismatch_rejected() {
        let mut codec = PeerCodec::new();
        let mut buf = BytesMut::new();
        // a `have` message with a 2 byte payload
        buf.put_u32(3);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u16(42);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_keep_alive_codec() {
        let mut codec = PeerCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::KeepAlive)
        );
    }

    #[test]
    fn test_simple_message_codecs() {
        for (msg, encoded) in [
            make_choke(),
            make_unchoke(),
            make_interested(),
            make_not_interested(),
            make_have(),
            make_bitfield(),
            make_request(),
            make_block(),
            make_cancel(),
            make_port(),
            make_have_all(),
            make_have_none(),
            make_reject(),
            make_allowed_fast(),
            make_extended(),
        ] {
            assert_message_codec(msg, encoded);
        }
    }

    // Asserts that a message encodes into the expected bytes and decodes
    // back into itself, and that a partial frame decodes to nothing.
    fn assert_message_codec(msg: Message, expected_encoded: Vec<u8>) {
        let mut codec = PeerCodec::new();

        let mut encoded = BytesMut::new();
        codec.encode(msg.clone(), &mut encoded).unwrap();
        assert_eq!(&encoded[..], &expected_encoded[..], "{:?}", msg);

        // don't decode a message from a partial frame
        let mut partial_encoded: BytesMut =
            encoded[0..encoded.len() - 1].into();
        assert_eq!(codec.decode(&mut partial_encoded).unwrap(), None);

        assert_eq!(codec.decode(&mut encoded).unwrap(), Some(msg));
    }

    fn make_handshake() -> (Handshake, Vec<u8>) {
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(b"da39a3ee5e6b4b0d3255");
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(b"-TT0100-000000000000");

        let handshake = Handshake::new(info_hash, peer_id);

        let mut encoded = Vec::with_capacity(68);
        encoded.push(19);
        encoded.extend_from_slice(PROTOCOL_STRING.as_bytes());
        encoded.extend_from_slice(&handshake.reserved);
        encoded.extend_from_slice(&info_hash);
        encoded.extend_from_slice(&peer_id);

        (handshake, encoded)
    }

    // Helper producing the encoding of messages that have only an id.
    fn make_empty_msg(msg: Message, id: MessageId) -> (Message, Vec<u8>) {
        (msg, vec![0, 0, 0, 1, id as u8])
    }

    fn make_choke() -> (Message, Vec<u8>) {
        make_empty_msg(Message::Choke, MessageId::Choke)
    }

    fn make_unchoke() -> (Message, Vec<u8>) {
        make_empty_msg(Message::Unchoke, MessageId::Unchoke)
    }

    fn make_interested() -> (Message, Vec<u8>) {
        make_empty_msg(Message::Interested, MessageId::Interested)
    }

    fn make_not_interested() -> (Message, Vec<u8>) {
        make_empty_msg(Message::NotInterested, MessageId::NotInterested)
    }

    fn make_have_all() -> (Message, Vec<u8>) {
        make_empty_msg(Message::HaveAll, MessageId::HaveAll)
    }

    fn make_have_none() -> (Message, Vec<u8>) {
        make_empty_msg(Message::HaveNone, MessageId::HaveNone)
    }

    fn make_have() -> (Message, Vec<u8>) {
        let encoded = vec![0, 0, 0, 5, MessageId::Have as u8, 0, 0, 0, 42];
        (Message::Have { piece_index: 42 }, encoded)
    }

    fn make_allowed_fast() -> (Message, Vec<u8>) {
        let encoded =
            vec![0, 0, 0, 5, MessageId::AllowedFast as u8, 0, 0, 0, 7];
        (Message::AllowedFast { piece_index: 7 }, encoded)
    }

    fn make_bitfield() -> (Message, Vec<u8>) {
        let bitfield =
            Bitfield::from_vec(vec![0b1100_1001, 0b1000_0011, 0b1111_1011]);
        let encoded = vec![
            0,
            0,
            0,
            4,
            MessageId::Bitfield as u8,
            0b1100_1001,
            0b1000_0011,
            0b1111_1011,
        ];
        (Message::Bitfield(bitfield), encoded)
    }

    fn block_info() -> BlockInfo {
        BlockInfo {
            piece_index: 42,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        }
    }

    // Helper producing the encoding of the three messages carrying a block
    // info payload.
    fn make_block_info_msg(
        msg: Message,
        id: MessageId,
    ) -> (Message, Vec<u8>) {
        let mut encoded = vec![0, 0, 0, 13, id as u8];
        encoded.extend_from_slice(&42u32.to_be_bytes());
        encoded.extend_from_slice(&BLOCK_LEN.to_be_bytes());
        encoded.extend_from_slice(&BLOCK_LEN.to_be_bytes());
        (msg, encoded)
    }

    fn make_request() -> (Message, Vec<u8>) {
        make_block_info_msg(Message::Request(block_info()), MessageId::Request)
    }

    fn make_cancel() -> (Message, Vec<u8>) {
        make_block_info_msg(Message::Cancel(block_info()), MessageId::Cancel)
    }

    fn make_reject() -> (Message, Vec<u8>) {
        make_block_info_msg(Message::Reject(block_info()), MessageId::Reject)
    }

    fn make_block() -> (Message, Vec<u8>) {
        let data = vec![0xfa; 16];
        let info = BlockInfo {
            piece_index: 42,
            offset: BLOCK_LEN,
            len: data.len() as u32,
        };
        let mut encoded = vec![0, 0, 0, 9 + 16, MessageId::Block as u8];
        encoded.extend_from_slice(&42u32.to_be_bytes());
        encoded.extend_from_slice(&BLOCK_LEN.to_be_bytes());
        encoded.extend_from_slice(&data);
        (Message::Block { info, data }, encoded)
    }

    fn make_port() -> (Message, Vec<u8>) {
        let encoded = vec![0, 0, 0, 3, MessageId::Port as u8, 0x1a, 0xe1];
        (Message::Port(6881), encoded)
    }

    fn make_extended() -> (Message, Vec<u8>) {
        let payload = b"d8:msg_typei0e5:piecei0ee".to_vec();
        let mut encoded =
            vec![0, 0, 0, 2 + payload.len() as u8, MessageId::Extended as u8, 3];
        encoded.extend_from_slice(&payload);
        (
            Message::Extended { id: 3, payload },
            encoded,
        )
    }
}
