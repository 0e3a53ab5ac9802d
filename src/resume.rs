//! Per torrent resume records.
//!
//! A resume record is a small bencoded dictionary persisted next to the
//! engine's other state that lets a torrent restart without re-verifying
//! everything from scratch: which pieces were complete, which files are
//! wanted and at what priority, where the download lives, and the transfer
//! statistics that outlive a session.

use std::{
    fmt, fs,
    io::{self, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
};

use crate::{
    bencode::{self, Value},
    FilePriority,
};

/// The most recently seen peer addresses kept in a resume record.
const MAX_RESUME_PEERS: usize = 50;

/// The persisted state of one torrent.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ResumeData {
    /// The completion bitfield, packed most significant bit first, one bit
    /// per piece. May be shorter than the piece count if the torrent was
    /// saved before its metadata arrived (magnet starts).
    pub bitfield: Vec<u8>,
    /// Per file priority, in metainfo file order.
    pub priorities: Vec<FilePriority>,
    /// Per file wanted bit, in metainfo file order.
    pub wanted: Vec<bool>,
    /// Where the torrent's content is (to be) placed.
    pub download_dir: PathBuf,
    /// UNIX timestamps of when the torrent was added, last had activity, and
    /// completed (0 = never).
    pub added_date: i64,
    pub activity_date: i64,
    pub done_date: i64,
    /// Per torrent rate caps in bytes per second, if set.
    pub download_rate_limit: Option<u64>,
    pub upload_rate_limit: Option<u64>,
    /// Recently connected peers, capped at [`MAX_RESUME_PEERS`].
    pub peers: Vec<SocketAddr>,
    /// Lifetime transfer statistics.
    pub downloaded_ever: u64,
    pub uploaded_ever: u64,
    pub corrupt_ever: u64,
}

/// The ways loading a resume record can fail.
#[derive(Debug)]
pub(crate) enum ResumeError {
    Io(io::Error),
    Bencode(bencode::Error),
    /// A required field is absent or has the wrong type.
    MissingField(&'static str),
}

impl fmt::Display for ResumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{}", e),
            Self::Bencode(e) => write!(f, "{}", e),
            Self::MissingField(field) => {
                write!(f, "resume field `{}` missing or invalid", field)
            }
        }
    }
}

impl From<io::Error> for ResumeError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<bencode::Error> for ResumeError {
    fn from(e: bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl ResumeData {
    /// Serializes the record into its bencoded form.
    pub fn encode(&self) -> Vec<u8> {
        let mut peers = self.peers.clone();
        peers.truncate(MAX_RESUME_PEERS);

        let entries = vec![
            (
                b"activity-date".to_vec(),
                Value::Int(self.activity_date),
            ),
            (b"added-date".to_vec(), Value::Int(self.added_date)),
            (
                b"bitfield".to_vec(),
                Value::Bytes(self.bitfield.clone()),
            ),
            (
                b"corrupt-ever".to_vec(),
                Value::Int(self.corrupt_ever as i64),
            ),
            (
                b"destination".to_vec(),
                Value::from_bytes(
                    self.download_dir.to_string_lossy().as_bytes().to_vec(),
                ),
            ),
            (b"done-date".to_vec(), Value::Int(self.done_date)),
            (
                b"downloaded-ever".to_vec(),
                Value::Int(self.downloaded_ever as i64),
            ),
            (b"peers".to_vec(), Value::Bytes(encode_peers_v4(&peers))),
            (b"peers6".to_vec(), Value::Bytes(encode_peers_v6(&peers))),
            (
                b"priorities".to_vec(),
                Value::Bytes(
                    self.priorities.iter().map(|p| *p as u8).collect(),
                ),
            ),
            (
                b"speed-limit-down".to_vec(),
                Value::Int(
                    self.download_rate_limit.map(|l| l as i64).unwrap_or(-1),
                ),
            ),
            (
                b"speed-limit-up".to_vec(),
                Value::Int(
                    self.upload_rate_limit.map(|l| l as i64).unwrap_or(-1),
                ),
            ),
            (
                b"uploaded-ever".to_vec(),
                Value::Int(self.uploaded_ever as i64),
            ),
            (
                b"wanted".to_vec(),
                Value::Bytes(
                    self.wanted.iter().map(|w| *w as u8).collect(),
                ),
            ),
        ];
        Value::Dict(entries).encode()
    }

    /// Parses a record from its bencoded form.
    pub fn decode(buf: &[u8]) -> Result<Self, ResumeError> {
        let value = bencode::parse(buf)?;

        let int = |key: &'static str| {
            value
                .lookup(key.as_bytes())
                .and_then(Value::as_int)
                .ok_or(ResumeError::MissingField(key))
        };
        let bytes = |key: &'static str| {
            value
                .lookup(key.as_bytes())
                .and_then(Value::as_bytes)
                .ok_or(ResumeError::MissingField(key))
        };

        let mut peers = decode_peers_v4(bytes("peers")?);
        peers.extend(decode_peers_v6(bytes("peers6")?));

        let speed_limit = |key| -> Result<Option<u64>, ResumeError> {
            let limit = int(key)?;
            Ok(if limit < 0 { None } else { Some(limit as u64) })
        };

        Ok(Self {
            bitfield: bytes("bitfield")?.to_vec(),
            priorities: bytes("priorities")?
                .iter()
                .map(|p| FilePriority::from_u8(*p))
                .collect(),
            wanted: bytes("wanted")?.iter().map(|w| *w != 0).collect(),
            download_dir: PathBuf::from(
                String::from_utf8_lossy(bytes("destination")?).into_owned(),
            ),
            added_date: int("added-date")?,
            activity_date: int("activity-date")?,
            done_date: int("done-date")?,
            download_rate_limit: speed_limit("speed-limit-down")?,
            upload_rate_limit: speed_limit("speed-limit-up")?,
            peers,
            downloaded_ever: int("downloaded-ever")? as u64,
            uploaded_ever: int("uploaded-ever")? as u64,
            corrupt_ever: int("corrupt-ever")? as u64,
        })
    }

    /// Atomically writes the record to the path, via a temporary file and
    /// rename so that a crash can't leave a truncated record behind.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let tmp_path = path.with_extension("resume.tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&self.encode())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    }

    /// Loads a record from the path.
    pub fn load(path: &Path) -> Result<Self, ResumeError> {
        let buf = fs::read(path)?;
        Self::decode(&buf)
    }
}

/// Encodes IPv4 peers in the compact 6 bytes per peer form.
fn encode_peers_v4(peers: &[SocketAddr]) -> Vec<u8> {
    let mut buf = Vec::new();
    for peer in peers {
        if let IpAddr::V4(ip) = peer.ip() {
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&peer.port().to_be_bytes());
        }
    }
    buf
}

/// Encodes IPv6 peers in the compact 18 bytes per peer form.
fn encode_peers_v6(peers: &[SocketAddr]) -> Vec<u8> {
    let mut buf = Vec::new();
    for peer in peers {
        if let IpAddr::V6(ip) = peer.ip() {
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&peer.port().to_be_bytes());
        }
    }
    buf
}

fn decode_peers_v4(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(6)
        .map(|entry| {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

fn decode_peers_v6(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(18)
        .map(|entry| {
            let mut octets = [0; 16];
            octets.copy_from_slice(&entry[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([entry[16], entry[17]]);
            SocketAddr::new(IpAddr::V6(ip), port)
        })
        .collect()
}
