//! The parsed and validated torrent metainfo.
//!
//! Correct bencode is not enough: the metainfo is only accepted if it is
//! semantically valid too (piece hash table a multiple of 20 bytes, file
//! sizes consistent with the piece table, no path traversal in file paths,
//! and so on). The info hash is computed over the `info` dictionary's bytes
//! exactly as they appeared in the source buffer, never over
//! a re-serialization.

use std::{fmt, path::PathBuf};

use sha1::{Digest, Sha1};

use crate::{
    bencode::{self, Value},
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

pub(crate) type Result<T, E = MetainfoError> = std::result::Result<T, E>;

/// The ways in which a syntactically valid metainfo may still be rejected.
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum MetainfoError {
    /// The bencoding itself was invalid.
    Bencode(bencode::Error),
    /// A required field is absent or has the wrong type. Carries the field
    /// name.
    MissingField(&'static str),
    /// The `pieces` string is not a multiple of 20 bytes, or is empty.
    BadPieceHashLength,
    /// The sum of file lengths does not fit the piece table.
    InconsistentSizes,
    /// A multi-file torrent with an empty `files` list.
    EmptyFiles,
    /// A file path component was empty, `.`, `..`, or contained a path
    /// separator.
    PathTraversal,
}

impl fmt::Display for MetainfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bencode(e) => write!(f, "{}", e),
            Self::MissingField(field) => {
                write!(f, "metainfo field `{}` missing or invalid", field)
            }
            Self::BadPieceHashLength => {
                write!(f, "metainfo piece hashes not a multiple of 20 bytes")
            }
            Self::InconsistentSizes => {
                write!(f, "metainfo file sizes don't match piece table")
            }
            Self::EmptyFiles => write!(f, "metainfo has no files"),
            Self::PathTraversal => {
                write!(f, "metainfo file path contains invalid components")
            }
        }
    }
}

impl std::error::Error for MetainfoError {}

impl From<bencode::Error> for MetainfoError {
    fn from(e: bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

/// The parsed and validated torrent metainfo file, containing all arguments
/// needed for starting a torrent.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The name of the torrent, which is usually used to form the download
    /// path.
    pub name: String,
    /// This hash is used to identify a torrent with trackers and peers. It
    /// is the SHA-1 digest of the `info` dictionary's bytes as they appeared
    /// in the source file.
    pub info_hash: Sha1Hash,
    /// The concatenation of the 20 byte SHA-1 hash of each piece in torrent.
    /// This is used to verify the data sent to us by peers.
    pub pieces: Vec<u8>,
    /// The nominal length of a piece, that is, the length of all but
    /// potentially the last piece, which may be smaller.
    pub piece_len: u32,
    /// The paths and lengths of the download's files.
    pub structure: FsStructure,
    /// Whether the torrent is private (BEP-27): peers may only be obtained
    /// from its own trackers, never from DHT or peer exchange.
    pub is_private: bool,
    /// The announce URLs, grouped into tiers (BEP-12). Trackers within
    /// a tier are alternatives for each other; tiers are fallbacks.
    pub trackers: Vec<Vec<String>>,
    /// HTTP seed URLs (`url-list`), if any.
    pub webseeds: Vec<String>,
    /// Free form comment from the torrent's creator.
    pub comment: Option<String>,
    /// The application that created the torrent.
    pub created_by: Option<String>,
    /// Creation time as a UNIX timestamp.
    pub creation_date: Option<i64>,
    /// The verbatim bytes of the `info` dictionary. Kept so that the torrent
    /// file can be re-emitted byte exactly and so that the metadata can be
    /// served to peers over the extension protocol.
    pub info_bytes: Vec<u8>,
}

impl Metainfo {
    /// Parses a .torrent file's contents into a [`Metainfo`] instance, or
    /// aborts with an error.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (value, info_range) = bencode::parse_with_info_range(buf)?;
        let info_range = info_range.ok_or(MetainfoError::MissingField("info"))?;
        let info = value
            .lookup(b"info")
            .ok_or(MetainfoError::MissingField("info"))?;

        let mut metainfo =
            Self::from_info_value(info, &buf[info_range.clone()])?;
        metainfo.trackers = parse_trackers(&value);
        metainfo.webseeds = parse_webseeds(&value);
        metainfo.comment = value
            .lookup(b"comment")
            .and_then(Value::as_str)
            .map(str::to_owned);
        metainfo.created_by = value
            .lookup(b"created by")
            .and_then(Value::as_str)
            .map(str::to_owned);
        metainfo.creation_date =
            value.lookup(b"creation date").and_then(Value::as_int);

        Ok(metainfo)
    }

    /// Builds a [`Metainfo`] from the raw bytes of an `info` dictionary, as
    /// reassembled by the metadata exchange from a magnet start.
    ///
    /// The caller is responsible for having checked the buffer's SHA-1
    /// digest against the expected info hash before calling this; the hash
    /// is recomputed here from the buffer either way.
    pub fn from_info_bytes(buf: &[u8]) -> Result<Self> {
        let info = bencode::parse(buf)?;
        Self::from_info_value(&info, buf)
    }

    fn from_info_value(info: &Value, info_bytes: &[u8]) -> Result<Self> {
        let name = info
            .lookup(b"name")
            .and_then(Value::as_str)
            .ok_or(MetainfoError::MissingField("name"))?
            .to_owned();
        // the torrent name becomes a path component of the download
        validate_path_component(&name)?;

        let piece_len = info
            .lookup(b"piece length")
            .and_then(Value::as_int)
            .filter(|len| *len > 0 && *len <= u32::MAX as i64)
            .ok_or(MetainfoError::MissingField("piece length"))?
            as u32;

        // the pieces field is a concatenation of 20 byte SHA-1 hashes, so it
        // must be a non-empty multiple of 20
        let pieces = info
            .lookup(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or(MetainfoError::MissingField("pieces"))?
            .to_vec();
        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(MetainfoError::BadPieceHashLength);
        }

        // if the info dict has `length` it is a single file torrent named by
        // `name`; otherwise `files` is mandatory
        let structure = if let Some(len) = info.lookup(b"length") {
            let len = len
                .as_int()
                .filter(|len| *len >= 0)
                .ok_or(MetainfoError::MissingField("length"))?;
            FsStructure::File(FileInfo {
                path: PathBuf::from(&name),
                torrent_offset: 0,
                len: len as u64,
            })
        } else {
            let files = info
                .lookup(b"files")
                .and_then(Value::as_list)
                .ok_or(MetainfoError::MissingField("files"))?;
            if files.is_empty() {
                return Err(MetainfoError::EmptyFiles);
            }

            let mut file_infos = Vec::with_capacity(files.len());
            let mut torrent_offset = 0;
            for file in files {
                let len = file
                    .lookup(b"length")
                    .and_then(Value::as_int)
                    .filter(|len| *len >= 0)
                    .ok_or(MetainfoError::MissingField("length"))?
                    as u64;
                let path_components = file
                    .lookup(b"path")
                    .and_then(Value::as_list)
                    .ok_or(MetainfoError::MissingField("path"))?;
                if path_components.is_empty() {
                    return Err(MetainfoError::PathTraversal);
                }
                let mut path = PathBuf::new();
                for component in path_components {
                    let component = component
                        .as_str()
                        .ok_or(MetainfoError::MissingField("path"))?;
                    validate_path_component(component)?;
                    path.push(component);
                }
                file_infos.push(FileInfo {
                    path,
                    torrent_offset,
                    len,
                });
                torrent_offset += len;
            }
            FsStructure::Archive { files: file_infos }
        };

        // the piece table must exactly cover the download: the last piece is
        // 1 to piece_len bytes, every other piece is piece_len bytes
        let piece_count = (pieces.len() / 20) as u64;
        let download_len = structure.download_len();
        let min_len = (piece_count - 1) * piece_len as u64;
        if download_len <= min_len || download_len > piece_count * piece_len as u64
        {
            return Err(MetainfoError::InconsistentSizes);
        }

        let is_private = info
            .lookup(b"private")
            .and_then(Value::as_int)
            .map(|p| p == 1)
            .unwrap_or(false);

        // create the info hash over the verbatim bytes as a last step
        let digest = Sha1::digest(info_bytes);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);

        Ok(Self {
            name,
            info_hash,
            pieces,
            piece_len,
            structure,
            is_private,
            trackers: Vec::new(),
            webseeds: Vec::new(),
            comment: None,
            created_by: None,
            creation_date: None,
            info_bytes: info_bytes.to_vec(),
        })
    }

    /// Returns the number of pieces in this torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Returns the expected hash of the piece at the index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn piece_hash(&self, index: usize) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.pieces[index * 20..index * 20 + 20]);
        hash
    }

    /// Returns the total download size in bytes.
    pub fn download_len(&self) -> u64 {
        self.structure.download_len()
    }

    /// Re-emits the metainfo as .torrent file bytes.
    ///
    /// The `info` dictionary is spliced in verbatim from the stored bytes so
    /// the info hash of the output equals [`Self::info_hash`].
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(b'd');
        // keys must be emitted in sorted order: announce, announce-list,
        // comment, created by, creation date, info, url-list
        if let Some(tracker) = self.trackers.first().and_then(|t| t.first()) {
            encode_entry(&mut buf, b"announce", &Value::from_str(tracker));
        }
        if !self.trackers.is_empty() {
            let tiers = Value::List(
                self.trackers
                    .iter()
                    .map(|tier| {
                        Value::List(
                            tier.iter().map(|t| Value::from_str(t)).collect(),
                        )
                    })
                    .collect(),
            );
            encode_entry(&mut buf, b"announce-list", &tiers);
        }
        if let Some(comment) = &self.comment {
            encode_entry(&mut buf, b"comment", &Value::from_str(comment));
        }
        if let Some(created_by) = &self.created_by {
            encode_entry(&mut buf, b"created by", &Value::from_str(created_by));
        }
        if let Some(date) = self.creation_date {
            encode_entry(&mut buf, b"creation date", &Value::Int(date));
        }
        buf.extend_from_slice(b"4:info");
        buf.extend_from_slice(&self.info_bytes);
        if !self.webseeds.is_empty() {
            let webseeds = Value::List(
                self.webseeds.iter().map(|w| Value::from_str(w)).collect(),
            );
            encode_entry(&mut buf, b"url-list", &webseeds);
        }
        buf.push(b'e');
        buf
    }
}

fn encode_entry(buf: &mut Vec<u8>, key: &[u8], value: &Value) {
    buf.extend_from_slice(key.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(key);
    buf.extend_from_slice(&value.encode());
}

/// Extracts the announce tiers: `announce-list` if present and well formed,
/// otherwise the single `announce` URL as a one tracker tier.
fn parse_trackers(value: &Value) -> Vec<Vec<String>> {
    if let Some(tiers) = value.lookup(b"announce-list").and_then(Value::as_list)
    {
        let tiers: Vec<Vec<String>> = tiers
            .iter()
            .filter_map(|tier| {
                let urls: Vec<String> = tier
                    .as_list()?
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect();
                if urls.is_empty() {
                    None
                } else {
                    Some(urls)
                }
            })
            .collect();
        if !tiers.is_empty() {
            return tiers;
        }
    }
    value
        .lookup(b"announce")
        .and_then(Value::as_str)
        .map(|url| vec![vec![url.to_owned()]])
        .unwrap_or_default()
}

fn parse_webseeds(value: &Value) -> Vec<String> {
    match value.lookup(b"url-list") {
        // a single string is also accepted here for historic reasons
        Some(Value::Bytes(url)) => std::str::from_utf8(url)
            .map(|url| vec![url.to_owned()])
            .unwrap_or_default(),
        Some(Value::List(urls)) => urls
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

/// A path component must be non-empty, must not be `.` or `..`, and must not
/// contain a path separator; anything else could escape the download
/// directory.
fn validate_path_component(component: &str) -> Result<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(MetainfoError::PathTraversal);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds the bencoding of a minimal valid single file torrent.
    fn make_single_file_torrent() -> Vec<u8> {
        let info = Value::Dict(vec![
            (b"length".to_vec(), Value::Int(48)),
            (b"name".to_vec(), Value::from_str("test.bin")),
            (b"piece length".to_vec(), Value::Int(32)),
            (b"pieces".to_vec(), Value::Bytes(vec![0xab; 40])),
        ]);
        Value::Dict(vec![
            (
                b"announce".to_vec(),
                Value::from_str("http://tracker.example/announce"),
            ),
            (b"info".to_vec(), info),
        ])
        .encode()
    }

    fn make_multi_file_info(paths: Vec<Vec<&str>>) -> Value {
        let files = paths
            .into_iter()
            .map(|components| {
                Value::Dict(vec![
                    (b"length".to_vec(), Value::Int(16)),
                    (
                        b"path".to_vec(),
                        Value::List(
                            components
                                .into_iter()
                                .map(Value::from_str)
                                .collect(),
                        ),
                    ),
                ])
            })
            .collect();
        Value::Dict(vec![
            (b"files".to_vec(), Value::List(files)),
            (b"name".to_vec(), Value::from_str("archive")),
            (b"piece length".to_vec(), Value::Int(32)),
            (b"pieces".to_vec(), Value::Bytes(vec![0xcd; 20])),
        ])
    }

    // Tests that the info hash is computed over the info dict's bytes as
    // they appear in the file, not over a re-serialization.
    #[test]
    fn test_info_hash_over_verbatim_bytes() {
        let buf = make_single_file_torrent();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        // find the info dict's bytes in the torrent and hash them directly
        let start = {
            let needle = b"4:info";
            buf.windows(needle.len())
                .position(|w| w == needle)
                .unwrap()
                + needle.len()
        };
        // the info value extends to just before the outer dict's final 'e'
        let info_bytes = &buf[start..buf.len() - 1];
        let expected: [u8; 20] = Sha1::digest(info_bytes).into();

        assert_eq!(metainfo.info_hash, expected);
        assert_eq!(metainfo.info_bytes, info_bytes);
    }

    #[test]
    fn test_parse_single_file() {
        let metainfo =
            Metainfo::from_bytes(&make_single_file_torrent()).unwrap();
        assert_eq!(metainfo.name, "test.bin");
        assert_eq!(metainfo.piece_len, 32);
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.download_len(), 48);
        assert!(!metainfo.is_private);
        assert_eq!(
            metainfo.trackers,
            vec![vec!["http://tracker.example/announce".to_owned()]]
        );
        assert!(matches!(metainfo.structure, FsStructure::File(_)));
    }

    #[test]
    fn test_parse_multi_file() {
        let buf = Value::Dict(vec![(
            b"info".to_vec(),
            make_multi_file_info(vec![vec!["a.bin"], vec!["sub", "b.bin"]]),
        )])
        .encode();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        match &metainfo.structure {
            FsStructure::Archive { files } => {
                assert_eq!(files.len(), 2);
                assert_eq!(files[0].path, PathBuf::from("a.bin"));
                assert_eq!(files[0].torrent_offset, 0);
                assert_eq!(files[1].path, PathBuf::from("sub/b.bin"));
                assert_eq!(files[1].torrent_offset, 16);
            }
            _ => panic!("expected multi file structure"),
        }
    }

    // Tests that path components that could escape the download directory
    // are rejected.
    #[test]
    fn test_path_traversal() {
        for component in ["..", ".", "", "a/b"] {
            let buf = Value::Dict(vec![(
                b"info".to_vec(),
                make_multi_file_info(vec![vec![component, "b.bin"]]),
            )])
            .encode();
            assert_eq!(
                Metainfo::from_bytes(&buf).unwrap_err(),
                MetainfoError::PathTraversal,
                "component {:?}",
                component
            );
        }
    }

    #[test]
    fn test_inconsistent_sizes() {
        // 2 piece hashes for 32 byte pieces only cover (32, 64] bytes
        for len in [32, 65] {
            let info = Value::Dict(vec![
                (b"length".to_vec(), Value::Int(len)),
                (b"name".to_vec(), Value::from_str("test.bin")),
                (b"piece length".to_vec(), Value::Int(32)),
                (b"pieces".to_vec(), Value::Bytes(vec![0xab; 40])),
            ]);
            let buf = Value::Dict(vec![(b"info".to_vec(), info)]).encode();
            assert_eq!(
                Metainfo::from_bytes(&buf).unwrap_err(),
                MetainfoError::InconsistentSizes,
                "len {}",
                len
            );
        }
    }

    #[test]
    fn test_bad_piece_hash_length() {
        let info = Value::Dict(vec![
            (b"length".to_vec(), Value::Int(48)),
            (b"name".to_vec(), Value::from_str("test.bin")),
            (b"piece length".to_vec(), Value::Int(32)),
            (b"pieces".to_vec(), Value::Bytes(vec![0xab; 41])),
        ]);
        let buf = Value::Dict(vec![(b"info".to_vec(), info)]).encode();
        assert_eq!(
            Metainfo::from_bytes(&buf).unwrap_err(),
            MetainfoError::BadPieceHashLength
        );
    }

    // Tests that announce tiers are taken from announce-list when present,
    // falling back to the single announce URL.
    #[test]
    fn test_announce_tiers() {
        let info = Value::Dict(vec![
            (b"length".to_vec(), Value::Int(48)),
            (b"name".to_vec(), Value::from_str("test.bin")),
            (b"piece length".to_vec(), Value::Int(32)),
            (b"pieces".to_vec(), Value::Bytes(vec![0xab; 40])),
        ]);
        let buf = Value::Dict(vec![
            (b"announce".to_vec(), Value::from_str("http://a/ann")),
            (
                b"announce-list".to_vec(),
                Value::List(vec![
                    Value::List(vec![
                        Value::from_str("http://a/ann"),
                        Value::from_str("http://b/ann"),
                    ]),
                    Value::List(vec![Value::from_str("udp://c:80/ann")]),
                ]),
            ),
            (b"info".to_vec(), info),
        ])
        .encode();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(
            metainfo.trackers,
            vec![
                vec!["http://a/ann".to_owned(), "http://b/ann".to_owned()],
                vec!["udp://c:80/ann".to_owned()],
            ]
        );
    }

    // Tests that re-emitting a parsed torrent produces bytes with the same
    // info hash.
    #[test]
    fn test_encode_preserves_info_hash() {
        let buf = make_single_file_torrent();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let reencoded = metainfo.encode();
        let reparsed = Metainfo::from_bytes(&reencoded).unwrap();
        assert_eq!(reparsed.info_hash, metainfo.info_hash);
        assert_eq!(reparsed.trackers, metainfo.trackers);
    }

    // Tests building a metainfo from raw info dict bytes, the magnet
    // metadata exchange path.
    #[test]
    fn test_from_info_bytes() {
        let buf = make_single_file_torrent();
        let full = Metainfo::from_bytes(&buf).unwrap();
        let from_info = Metainfo::from_info_bytes(&full.info_bytes).unwrap();
        assert_eq!(from_info.info_hash, full.info_hash);
        assert_eq!(from_info.name, full.name);
        assert_eq!(from_info.piece_count(), full.piece_count());
        // trackers aren't part of the info dict
        assert!(from_info.trackers.is_empty());
    }
}
