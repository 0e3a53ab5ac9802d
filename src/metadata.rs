//! The extension protocol payloads (BEP-10) and the metadata exchange
//! (BEP-9) that rides on it.
//!
//! A torrent started from a magnet link has no metainfo; peers advertising
//! the `ut_metadata` extension serve the raw `info` dictionary in 16 KiB
//! pieces, which [`MetadataDownload`] reassembles and validates against the
//! info hash. The flip side, serving our own metadata to magnet peers, uses
//! the same message forms. Peer exchange (`ut_pex`) payloads are parsed
//! here too.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};

use crate::{
    bencode::{self, Value},
    Sha1Hash,
};

/// The size of one metadata piece (BEP-9).
pub(crate) const METADATA_PIECE_LEN: usize = 0x4000;

/// An upper bound on accepted metadata sizes. Real info dictionaries are a
/// few hundred KiB at most; this guards the receive buffer allocation
/// against bogus advertisements.
pub(crate) const MAX_METADATA_LEN: usize = 8 * 1024 * 1024;

/// A metadata piece is re-requested at most this often.
pub(crate) const METADATA_REQUEST_INTERVAL: Duration = Duration::from_secs(3);

/// The extended message ids we assign to the extensions we speak. Peers use
/// these ids when sending to us; we use the ids from the peer's extended
/// handshake when sending to them.
pub(crate) const UT_PEX_ID: u8 = 1;
pub(crate) const UT_METADATA_ID: u8 = 3;

/// The payload of the extended handshake (extended message id 0).
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ExtendedHandshake {
    /// The id the peer assigned to `ut_metadata`, if it supports it.
    pub ut_metadata: Option<u8>,
    /// The id the peer assigned to `ut_pex`, if it supports it.
    pub ut_pex: Option<u8>,
    /// The size of the peer's metadata, if it has it. Mandatory for
    /// metadata exchange to start.
    pub metadata_size: Option<usize>,
    /// The peer's client name and version, free form.
    pub client: Option<String>,
}

impl ExtendedHandshake {
    /// The handshake we send: our extension ids and, when we have the
    /// metainfo, its size.
    pub fn ours(metadata_size: Option<usize>) -> Self {
        Self {
            ut_metadata: Some(UT_METADATA_ID),
            ut_pex: Some(UT_PEX_ID),
            metadata_size,
            client: Some(
                concat!("tidetorrent ", env!("CARGO_PKG_VERSION")).to_owned(),
            ),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut m = Vec::new();
        if let Some(id) = self.ut_metadata {
            m.push((b"ut_metadata".to_vec(), Value::Int(id as i64)));
        }
        if let Some(id) = self.ut_pex {
            m.push((b"ut_pex".to_vec(), Value::Int(id as i64)));
        }
        let mut entries = vec![(b"m".to_vec(), Value::Dict(m))];
        if let Some(size) = self.metadata_size {
            entries
                .push((b"metadata_size".to_vec(), Value::Int(size as i64)));
        }
        if let Some(client) = &self.client {
            entries.push((b"v".to_vec(), Value::from_str(client)));
        }
        Value::Dict(entries).encode()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, bencode::Error> {
        let value = bencode::parse(buf)?;
        let ext_id = |name: &[u8]| {
            value
                .lookup(b"m")
                .and_then(|m| m.lookup(name))
                .and_then(Value::as_int)
                // id 0 means the peer disabled the extension
                .filter(|id| (1..=255).contains(id))
                .map(|id| id as u8)
        };
        Ok(Self {
            ut_metadata: ext_id(b"ut_metadata"),
            ut_pex: ext_id(b"ut_pex"),
            metadata_size: value
                .lookup(b"metadata_size")
                .and_then(Value::as_int)
                .filter(|size| *size > 0)
                .map(|size| size as usize),
            client: value
                .lookup(b"v")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }
}

/// A `ut_metadata` message (BEP-9).
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MetadataMsg {
    /// Request for one metadata piece.
    Request { piece: usize },
    /// One metadata piece. The raw piece bytes trail the bencoded header.
    Data {
        piece: usize,
        total_size: usize,
        payload: Vec<u8>,
    },
    /// The peer won't serve the piece (it may not have the metadata after
    /// all).
    Reject { piece: usize },
}

mod msg_type {
    pub const REQUEST: i64 = 0;
    pub const DATA: i64 = 1;
    pub const REJECT: i64 = 2;
}

impl MetadataMsg {
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, piece) = match self {
            Self::Request { piece } => (msg_type::REQUEST, *piece),
            Self::Data { piece, .. } => (msg_type::DATA, *piece),
            Self::Reject { piece } => (msg_type::REJECT, *piece),
        };
        let mut entries = vec![
            (b"msg_type".to_vec(), Value::Int(msg_type)),
            (b"piece".to_vec(), Value::Int(piece as i64)),
        ];
        if let Self::Data { total_size, .. } = self {
            entries
                .push((b"total_size".to_vec(), Value::Int(*total_size as i64)));
        }
        let mut buf = Value::Dict(entries).encode();
        if let Self::Data { payload, .. } = self {
            buf.extend_from_slice(payload);
        }
        buf
    }

    /// Decodes a `ut_metadata` payload. The bencoded header is followed by
    /// the raw piece bytes for data messages, so parsing must stop at the
    /// end of the dictionary rather than insist on consuming the whole
    /// buffer.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        // find where the header dict ends by parsing increasing prefixes is
        // wasteful; instead rely on the header being a flat dict and scan
        // for its terminator
        let header_end = find_dict_end(buf)?;
        let value = bencode::parse(&buf[..header_end]).ok()?;

        let msg_type = value.lookup(b"msg_type").and_then(Value::as_int)?;
        let piece = value
            .lookup(b"piece")
            .and_then(Value::as_int)
            .filter(|piece| *piece >= 0)? as usize;

        match msg_type {
            msg_type::REQUEST => Some(Self::Request { piece }),
            msg_type::REJECT => Some(Self::Reject { piece }),
            msg_type::DATA => {
                let total_size = value
                    .lookup(b"total_size")
                    .and_then(Value::as_int)
                    .filter(|size| *size > 0)?
                    as usize;
                let payload = buf[header_end..].to_vec();
                if payload.is_empty() || payload.len() > METADATA_PIECE_LEN {
                    return None;
                }
                Some(Self::Data {
                    piece,
                    total_size,
                    payload,
                })
            }
            _ => None,
        }
    }
}

/// Returns one past the index of the byte that closes the outermost dict
/// starting at the buffer's first byte. Only handles the flat
/// integer/string dicts the metadata header uses.
fn find_dict_end(buf: &[u8]) -> Option<usize> {
    if buf.first() != Some(&b'd') {
        return None;
    }
    let mut pos = 1;
    loop {
        match buf.get(pos)? {
            b'e' => return Some(pos + 1),
            b'i' => {
                pos += 1;
                while *buf.get(pos)? != b'e' {
                    pos += 1;
                }
                pos += 1;
            }
            b'0'..=b'9' => {
                let start = pos;
                while *buf.get(pos)? != b':' {
                    pos += 1;
                }
                let len: usize =
                    std::str::from_utf8(&buf[start..pos]).ok()?.parse().ok()?;
                pos += 1 + len;
            }
            _ => return None,
        }
    }
}

/// Reassembles the metainfo from `ut_metadata` pieces fetched from the
/// swarm.
pub(crate) struct MetadataDownload {
    /// The reassembly buffer, sized from the peers' advertised
    /// metadata_size.
    buf: Vec<u8>,
    /// Per piece: whether it has been received, and when it was last
    /// requested (for the request spacing).
    pieces: Vec<MetadataPiece>,
}

#[derive(Clone, Copy, Debug, Default)]
struct MetadataPiece {
    received: bool,
    last_requested: Option<Instant>,
}

impl MetadataDownload {
    /// Creates a download for a metadata of the given advertised size.
    /// Returns `None` for sizes that are implausible.
    pub fn new(metadata_size: usize) -> Option<Self> {
        if metadata_size == 0 || metadata_size > MAX_METADATA_LEN {
            return None;
        }
        let piece_count =
            (metadata_size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;
        Some(Self {
            buf: vec![0; metadata_size],
            pieces: vec![MetadataPiece::default(); piece_count],
        })
    }

    pub fn metadata_size(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next piece that should be requested: not yet received
    /// and not requested within the last [`METADATA_REQUEST_INTERVAL`].
    /// Marks the returned piece as requested now.
    pub fn next_request(&mut self, now: Instant) -> Option<usize> {
        let index = self.pieces.iter().position(|piece| {
            !piece.received
                && piece
                    .last_requested
                    .map(|at| now.duration_since(at) >= METADATA_REQUEST_INTERVAL)
                    .unwrap_or(true)
        })?;
        self.pieces[index].last_requested = Some(now);
        Some(index)
    }

    /// Stores a received piece. Out of bounds pieces and payloads of the
    /// wrong length are ignored.
    pub fn on_data(&mut self, piece: usize, payload: &[u8]) {
        if piece >= self.pieces.len() {
            return;
        }
        let offset = piece * METADATA_PIECE_LEN;
        // every piece is 16 KiB except the last, which is whatever remains
        let expected_len =
            METADATA_PIECE_LEN.min(self.buf.len() - offset);
        if payload.len() != expected_len {
            return;
        }
        self.buf[offset..offset + expected_len].copy_from_slice(payload);
        self.pieces[piece].received = true;
    }

    /// A rejected piece may be requested again immediately, from another
    /// peer.
    pub fn on_reject(&mut self, piece: usize) {
        if let Some(piece) = self.pieces.get_mut(piece) {
            piece.last_requested = None;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|piece| piece.received)
    }

    /// Validates the reassembled buffer against the torrent's info hash and
    /// returns it on a match.
    ///
    /// On a mismatch the whole download is restarted: some peer fed us
    /// garbage and there is no telling which pieces are good.
    pub fn verify(&mut self, info_hash: &Sha1Hash) -> Option<&[u8]> {
        debug_assert!(self.is_complete());
        let digest: [u8; 20] = Sha1::digest(&self.buf).into();
        if &digest == info_hash {
            Some(&self.buf)
        } else {
            log::warn!("Reassembled metadata fails info hash check");
            for piece in self.pieces.iter_mut() {
                *piece = MetadataPiece::default();
            }
            None
        }
    }

    /// Cuts the metadata we hold into the piece to serve for a request, or
    /// `None` for an out of bounds request.
    pub fn piece_of(metadata: &[u8], piece: usize) -> Option<&[u8]> {
        let offset = piece.checked_mul(METADATA_PIECE_LEN)?;
        if offset >= metadata.len() {
            return None;
        }
        let end = (offset + METADATA_PIECE_LEN).min(metadata.len());
        Some(&metadata[offset..end])
    }
}

/// A `ut_pex` (BEP-11) payload: peers the sender recently saw joining and
/// leaving the swarm. Only the compact address lists are interpreted; the
/// flag lists are ignored.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PexMsg {
    pub added: Vec<SocketAddr>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMsg {
    pub fn encode(&self) -> Vec<u8> {
        let compact = |peers: &[SocketAddr]| {
            let mut buf = Vec::new();
            for peer in peers {
                if let IpAddr::V4(ip) = peer.ip() {
                    buf.extend_from_slice(&ip.octets());
                    buf.extend_from_slice(&peer.port().to_be_bytes());
                }
            }
            buf
        };
        Value::Dict(vec![
            (b"added".to_vec(), Value::Bytes(compact(&self.added))),
            (b"dropped".to_vec(), Value::Bytes(compact(&self.dropped))),
        ])
        .encode()
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let value = bencode::parse(buf).ok()?;
        let peers = |key: &[u8]| {
            value
                .lookup(key)
                .and_then(Value::as_bytes)
                .map(|compact| {
                    compact
                        .chunks_exact(6)
                        .map(|entry| {
                            let ip = Ipv4Addr::new(
                                entry[0], entry[1], entry[2], entry[3],
                            );
                            let port = u16::from_be_bytes([entry[4], entry[5]]);
                            SocketAddr::new(IpAddr::V4(ip), port)
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        Some(Self {
            added: peers(b"added"),
            dropped: peers(b"dropped"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_handshake_roundtrip() {
        let ours = ExtendedHandshake::ours(Some(12345));
        let decoded = ExtendedHandshake::decode(&ours.encode()).unwrap();
        assert_eq!(decoded.ut_metadata, Some(UT_METADATA_ID));
        assert_eq!(decoded.ut_pex, Some(UT_PEX_ID));
        assert_eq!(decoded.metadata_size, Some(12345));
    }

    // Tests that a peer disabling an extension by assigning it id 0 is
    // treated as not supporting it.
    #[test]
    fn test_extended_handshake_zero_id() {
        let buf = b"d1:md11:ut_metadatai0eee";
        let decoded = ExtendedHandshake::decode(buf).unwrap();
        assert_eq!(decoded.ut_metadata, None);
        assert_eq!(decoded.metadata_size, None);
    }

    #[test]
    fn test_metadata_msg_roundtrip() {
        for msg in [
            MetadataMsg::Request { piece: 2 },
            MetadataMsg::Reject { piece: 0 },
            MetadataMsg::Data {
                piece: 1,
                total_size: 17000,
                payload: vec![0xee; 612],
            },
        ] {
            assert_eq!(MetadataMsg::decode(&msg.encode()), Some(msg));
        }
    }

    // Tests that a data message's trailing payload doesn't confuse the
    // header parse.
    #[test]
    fn test_metadata_data_with_binary_payload() {
        // payload starting with 'e' and containing dict-like bytes
        let payload = b"ed3:abci1ee".to_vec();
        let msg = MetadataMsg::Data {
            piece: 0,
            total_size: payload.len(),
            payload: payload.clone(),
        };
        match MetadataMsg::decode(&msg.encode()).unwrap() {
            MetadataMsg::Data { payload: decoded, .. } => {
                assert_eq!(decoded, payload)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    // Tests the full metadata download flow: request spacing, piece
    // receipt, and hash validation.
    #[test]
    fn test_metadata_download() {
        // 1.5 pieces worth of metadata
        let metadata = vec![0x5a; METADATA_PIECE_LEN + 100];
        let info_hash: [u8; 20] = Sha1::digest(&metadata).into();

        let mut download = MetadataDownload::new(metadata.len()).unwrap();
        let start = Instant::now();

        // both pieces are requested once, then the spacing suppresses
        // re-requests
        assert_eq!(download.next_request(start), Some(0));
        assert_eq!(download.next_request(start), Some(1));
        assert_eq!(download.next_request(start), None);

        // after the interval the still-missing pieces can be requested
        // again
        let later = start + METADATA_REQUEST_INTERVAL;
        assert_eq!(download.next_request(later), Some(0));

        // a wrong sized payload for piece 0 is ignored
        download.on_data(0, &metadata[..10]);
        assert!(!download.is_complete());

        download.on_data(0, MetadataDownload::piece_of(&metadata, 0).unwrap());
        download.on_data(1, MetadataDownload::piece_of(&metadata, 1).unwrap());
        assert!(download.is_complete());

        assert_eq!(download.verify(&info_hash), Some(&metadata[..]));
    }

    // Tests that a hash mismatch restarts the download from scratch.
    #[test]
    fn test_metadata_hash_mismatch_restarts() {
        let metadata = vec![0x5a; 100];
        let mut download = MetadataDownload::new(metadata.len()).unwrap();
        download.on_data(0, &metadata);
        assert!(download.is_complete());

        assert_eq!(download.verify(&[0; 20]), None);
        assert!(!download.is_complete());
        // pieces are requestable again
        assert_eq!(download.next_request(Instant::now()), Some(0));
    }

    #[test]
    fn test_reject_resets_request_timer() {
        let mut download =
            MetadataDownload::new(METADATA_PIECE_LEN).unwrap();
        let now = Instant::now();
        assert_eq!(download.next_request(now), Some(0));
        assert_eq!(download.next_request(now), None);
        download.on_reject(0);
        assert_eq!(download.next_request(now), Some(0));
    }

    #[test]
    fn test_implausible_metadata_size_rejected() {
        assert!(MetadataDownload::new(0).is_none());
        assert!(MetadataDownload::new(MAX_METADATA_LEN + 1).is_none());
    }

    #[test]
    fn test_pex_roundtrip() {
        let msg = PexMsg {
            added: vec![
                "1.2.3.4:6881".parse().unwrap(),
                "5.6.7.8:51413".parse().unwrap(),
            ],
            dropped: vec!["9.9.9.9:1024".parse().unwrap()],
        };
        assert_eq!(PexMsg::decode(&msg.encode()), Some(msg));
    }
}
