//! Magnet URI parsing (BEP-9).
//!
//! A magnet link carries only the info hash and some optional hints; the
//! piece table and file list are fetched from peers via the metadata
//! exchange once the torrent is running.

use std::fmt;

use data_encoding::{BASE32, HEXLOWER_PERMISSIVE};
use url::Url;

use crate::Sha1Hash;

const SCHEME: &str = "magnet";
const INFO_HASH_PREFIX: &str = "urn:btih:";

/// The ways in which parsing a magnet URI can fail.
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum MagnetError {
    /// Not a URL or not a `magnet:` URL.
    InvalidUri,
    /// The `xt` parameter is missing or doesn't carry a `urn:btih:` hash.
    MissingInfoHash,
    /// The info hash was neither 40 hex digits nor 32 base32 digits.
    InvalidInfoHash,
}

impl fmt::Display for MagnetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUri => write!(f, "invalid magnet URI"),
            Self::MissingInfoHash => {
                write!(f, "magnet URI has no `xt=urn:btih:` info hash")
            }
            Self::InvalidInfoHash => {
                write!(f, "magnet URI info hash malformed")
            }
        }
    }
}

impl std::error::Error for MagnetError {}

/// The parsed form of a magnet link.
///
/// Only the info hash is mandatory. Unknown query parameters are ignored.
#[derive(Clone, Debug)]
pub struct MagnetUri {
    /// The torrent's info hash, from the `xt` parameter.
    pub info_hash: Sha1Hash,
    /// The display name from the `dn` parameter, used as the torrent's name
    /// until the real one arrives with the metadata.
    pub name: Option<String>,
    /// Tracker URLs from `tr` parameters. Each becomes its own tier, in
    /// order, which is how magnet links are conventionally interpreted.
    pub trackers: Vec<String>,
    /// Webseed URLs from `ws` parameters.
    pub webseeds: Vec<String>,
}

impl MagnetUri {
    /// Parses a `magnet:?xt=urn:btih:...` URI.
    pub fn parse(uri: &str) -> Result<Self, MagnetError> {
        let url = Url::parse(uri).map_err(|_| MagnetError::InvalidUri)?;
        if url.scheme() != SCHEME {
            return Err(MagnetError::InvalidUri);
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        let mut webseeds = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(encoded) = value.strip_prefix(INFO_HASH_PREFIX)
                    {
                        info_hash = Some(decode_info_hash(encoded)?);
                    }
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "ws" => webseeds.push(value.into_owned()),
                // extra parameters are ignored
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            name,
            trackers,
            webseeds,
        })
    }
}

/// Decodes the 40 hex digit or 32 base32 digit info hash forms.
fn decode_info_hash(encoded: &str) -> Result<Sha1Hash, MagnetError> {
    let mut info_hash = [0; 20];
    let encoded = encoded.as_bytes();
    let result = match encoded.len() {
        40 => HEXLOWER_PERMISSIVE.decode_mut(encoded, &mut info_hash),
        32 => BASE32.decode_mut(encoded, &mut info_hash),
        _ => return Err(MagnetError::InvalidInfoHash),
    };
    if result.is_err() {
        return Err(MagnetError::InvalidInfoHash);
    }
    Ok(info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_HASH: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

    #[test]
    fn test_parse_hex_magnet() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=test%20name\
             &tr=http%3A%2F%2Ftracker.example%2Fannounce\
             &tr=udp%3A%2F%2Ftracker2.example%3A6969\
             &ws=http%3A%2F%2Fseed.example%2Ffile",
            HEX_HASH
        );
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(hex::encode(magnet.info_hash), HEX_HASH);
        assert_eq!(magnet.name.as_deref(), Some("test name"));
        assert_eq!(
            magnet.trackers,
            vec![
                "http://tracker.example/announce".to_owned(),
                "udp://tracker2.example:6969".to_owned(),
            ]
        );
        assert_eq!(magnet.webseeds, vec!["http://seed.example/file"]);
    }

    // Tests that the base32 form decodes to the same hash as its hex
    // spelling.
    #[test]
    fn test_parse_base32_magnet() {
        let base32 = BASE32.encode(&hex::decode(HEX_HASH).unwrap());
        assert_eq!(base32.len(), 32);
        let uri = format!("magnet:?xt=urn:btih:{}", base32);
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(hex::encode(magnet.info_hash), HEX_HASH);
        assert!(magnet.name.is_none());
        assert!(magnet.trackers.is_empty());
    }

    #[test]
    fn test_unknown_params_ignored() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&x.pe=1.2.3.4%3A80&foo=bar",
            HEX_HASH
        );
        assert!(MagnetUri::parse(&uri).is_ok());
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            MagnetUri::parse("http://example.com").unwrap_err(),
            MagnetError::InvalidUri
        );
        assert_eq!(
            MagnetUri::parse("magnet:?dn=test").unwrap_err(),
            MagnetError::MissingInfoHash
        );
        assert_eq!(
            MagnetUri::parse("magnet:?xt=urn:btih:abcd").unwrap_err(),
            MagnetError::InvalidInfoHash
        );
    }
}
