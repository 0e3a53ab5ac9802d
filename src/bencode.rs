//! A bencode codec operating on an in-memory variant type.
//!
//! The codec is used for .torrent files, resume records, extended peer
//! messages, and anything else where we need to control the exact bytes
//! produced. Tracker announce responses keep using serde based
//! deserialization as their shape is fixed and byte-exactness does not
//! matter there.
//!
//! Parsing records the byte range of the top level `info` dictionary, as the
//! torrent's info hash must be computed over the bytes of that dictionary
//! exactly as they appeared in the source buffer. Hashing a re-serialization
//! instead produces a different (wrong) info hash whenever the source used
//! unknown keys or a different integer spelling.

use std::{fmt, ops::Range};

/// Parsers and encoders refuse to recurse deeper than this.
pub(crate) const MAX_DEPTH: usize = 32;

/// A single bencoded value.
///
/// Dictionary entries preserve their order. The parser only accepts input
/// whose dictionary keys are in sorted order (the canonical encoding), so an
/// in-memory dictionary produced by the parser is always sorted.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A signed 64 bit integer, e.g. `i-42e`.
    Int(i64),
    /// A length prefixed byte string, e.g. `4:spam`. Not necessarily UTF-8.
    Bytes(Vec<u8>),
    /// An ordered list of values, e.g. `l4:spami42ee`.
    List(Vec<Value>),
    /// A dictionary with byte string keys, e.g. `d3:cow3:mooe`.
    Dict(Vec<(Vec<u8>, Value)>),
}

impl Value {
    /// Creates a byte string value from anything byte-like.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(b.into())
    }

    /// Creates a byte string value from a string slice.
    pub fn from_str(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as a string slice, if it is a valid UTF-8 byte
    /// string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, Value)]> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a dictionary entry by key. Returns `None` if the value is not
    /// a dictionary or has no such key.
    pub fn lookup(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Self::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_slice() == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Serializes the value into its canonical bencoding.
    ///
    /// Dictionary keys are emitted in lexicographic byte order regardless of
    /// their in-memory order.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Int(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(bytes) => {
                buf.extend_from_slice(bytes.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(bytes);
            }
            Self::List(items) => {
                buf.push(b'l');
                for item in items {
                    item.encode_into(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(entries) => {
                buf.push(b'd');
                let mut sorted: Vec<_> = entries.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                for (key, value) in sorted {
                    buf.extend_from_slice(key.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(key);
                    value.encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }
}

/// The ways in which parsing a bencoded buffer can fail.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Error {
    /// The input ended in the middle of a value.
    TruncatedInput,
    /// An integer or length prefix contained an invalid digit sequence (also
    /// covers leading zeros and `-0`, which the canonical encoding forbids).
    InvalidDigit,
    /// A value started with a byte that doesn't introduce any bencode type.
    InvalidPrefix(u8),
    /// A dictionary key was not a byte string.
    InvalidDictKey,
    /// Dictionary keys were not in sorted order. Only the canonical encoding
    /// is accepted as the info hash is defined over it.
    UnorderedDictKeys,
    /// The same key occurred twice in one dictionary.
    DuplicateKey,
    /// The buffer contained extra bytes after the first complete value.
    TrailingData,
    /// Values were nested deeper than [`MAX_DEPTH`].
    DepthExceeded,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedInput => write!(f, "truncated bencode input"),
            Self::InvalidDigit => write!(f, "invalid digit in bencode input"),
            Self::InvalidPrefix(b) => {
                write!(f, "invalid bencode prefix byte 0x{:02x}", b)
            }
            Self::InvalidDictKey => write!(f, "bencode dict key not a string"),
            Self::UnorderedDictKeys => {
                write!(f, "bencode dict keys not in sorted order")
            }
            Self::DuplicateKey => write!(f, "duplicate bencode dict key"),
            Self::TrailingData => {
                write!(f, "trailing data after bencode value")
            }
            Self::DepthExceeded => write!(f, "bencode nesting too deep"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Parses a buffer holding exactly one bencoded value.
pub fn parse(buf: &[u8]) -> Result<Value> {
    let (value, _) = parse_with_info_range(buf)?;
    Ok(value)
}

/// Parses a buffer holding exactly one bencoded value and, if the value is
/// a dictionary with an `info` entry, also returns the byte range that
/// entry's value occupied in the buffer.
///
/// The range is what the info hash must be computed over.
pub fn parse_with_info_range(
    buf: &[u8],
) -> Result<(Value, Option<Range<usize>>)> {
    let mut parser = Parser {
        buf,
        pos: 0,
        info_range: None,
    };
    let value = parser.parse_value(0)?;
    if parser.pos != buf.len() {
        return Err(Error::TrailingData);
    }
    Ok((value, parser.info_range))
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
    info_range: Option<Range<usize>>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or(Error::TruncatedInput)
    }

    fn parse_value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::DepthExceeded);
        }

        match self.peek()? {
            b'i' => self.parse_int(),
            b'0'..=b'9' => self.parse_bytes().map(Value::Bytes),
            b'l' => self.parse_list(depth),
            b'd' => self.parse_dict(depth),
            other => Err(Error::InvalidPrefix(other)),
        }
    }

    fn parse_int(&mut self) -> Result<Value> {
        // skip 'i'
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.buf[start..self.pos];
        // skip 'e'
        self.pos += 1;

        // the canonical encoding has no leading zeros and no negative zero
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty()
            || (unsigned.len() > 1 && unsigned[0] == b'0')
            || digits == b"-0"
        {
            return Err(Error::InvalidDigit);
        }

        let n = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(Error::InvalidDigit)?;
        Ok(Value::Int(n))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }
        let digits = &self.buf[start..self.pos];
        // skip ':'
        self.pos += 1;

        if digits.is_empty()
            || (digits.len() > 1 && digits[0] == b'0')
            || !digits.iter().all(u8::is_ascii_digit)
        {
            return Err(Error::InvalidDigit);
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(Error::InvalidDigit)?;

        if self.buf.len() - self.pos < len {
            return Err(Error::TruncatedInput);
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn parse_list(&mut self, depth: usize) -> Result<Value> {
        // skip 'l'
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value(depth + 1)?);
        }
        // skip 'e'
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn parse_dict(&mut self, depth: usize) -> Result<Value> {
        let dict_start = self.pos;
        // skip 'd'
        self.pos += 1;
        let mut entries: Vec<(Vec<u8>, Value)> = Vec::new();
        while self.peek()? != b'e' {
            // keys must be byte strings
            if !self.peek()?.is_ascii_digit() {
                return Err(Error::InvalidDictKey);
            }
            let key = self.parse_bytes()?;

            // enforce the canonical strictly ascending key order
            if let Some((prev, _)) = entries.last() {
                if *prev == key {
                    return Err(Error::DuplicateKey);
                }
                if prev.as_slice() > key.as_slice() {
                    return Err(Error::UnorderedDictKeys);
                }
            }

            let value_start = self.pos;
            let value = self.parse_value(depth + 1)?;

            // record where the top level `info` dict's value lives, for info
            // hash computation (depth 0 is the torrent's outermost dict)
            if depth == 0 && dict_start == 0 && key == b"info" {
                self.info_range = Some(value_start..self.pos);
            }

            entries.push((key, value));
        }
        // skip 'e'
        self.pos += 1;
        Ok(Value::Dict(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that the canonical examples from the BEP-3 spec parse into the
    // expected variants and re-encode into identical bytes.
    #[test]
    fn test_roundtrip_canonical() {
        let cases: &[&[u8]] = &[
            b"i42e",
            b"i-42e",
            b"i0e",
            b"4:spam",
            b"0:",
            b"l4:spam4:eggse",
            b"le",
            b"d3:cow3:moo4:spam4:eggse",
            b"d4:spaml1:a1:bee",
            b"de",
            b"d1:ad2:aai1e2:abi2ee1:bli1ei2eee",
        ];
        for case in cases {
            let value = parse(case).unwrap();
            assert_eq!(value.encode(), *case, "roundtrip of {:?}", case);
        }
    }

    // Tests that parsing produces the expected in-memory structure.
    #[test]
    fn test_parse_structure() {
        let value = parse(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(
            value,
            Value::Dict(vec![
                (b"cow".to_vec(), Value::from_str("moo")),
                (b"spam".to_vec(), Value::from_str("eggs")),
            ])
        );

        let value = parse(b"d4:spaml1:a1:bee").unwrap();
        assert_eq!(
            value.lookup(b"spam").unwrap(),
            &Value::List(vec![Value::from_str("a"), Value::from_str("b")])
        );
    }

    // Tests that a dictionary with keys out of sorted order is rejected, as
    // only the canonical encoding is valid.
    #[test]
    fn test_unordered_dict_keys() {
        assert_eq!(
            parse(b"d1:bi1e1:ai2ee").unwrap_err(),
            Error::UnorderedDictKeys
        );
    }

    #[test]
    fn test_duplicate_dict_key() {
        assert_eq!(
            parse(b"d1:ai1e1:ai2ee").unwrap_err(),
            Error::DuplicateKey
        );
    }

    #[test]
    fn test_invalid_ints() {
        for case in [&b"i03e"[..], b"i-0e", b"ie", b"i1xe"] {
            assert_eq!(parse(case).unwrap_err(), Error::InvalidDigit, "{:?}", case);
        }
    }

    #[test]
    fn test_truncated_input() {
        for case in [&b"i42"[..], b"4:spa", b"l4:spam", b"d3:cow"] {
            assert_eq!(
                parse(case).unwrap_err(),
                Error::TruncatedInput,
                "{:?}",
                case
            );
        }
    }

    #[test]
    fn test_trailing_data() {
        assert_eq!(parse(b"i42ei43e").unwrap_err(), Error::TrailingData);
    }

    #[test]
    fn test_depth_limit() {
        // one more nested list than the parser accepts
        let mut buf = Vec::new();
        for _ in 0..MAX_DEPTH + 2 {
            buf.push(b'l');
        }
        for _ in 0..MAX_DEPTH + 2 {
            buf.push(b'e');
        }
        assert_eq!(parse(&buf).unwrap_err(), Error::DepthExceeded);
    }

    // Tests that the parser records the byte range of the top level `info`
    // dictionary as it appeared in the input, which is what the info hash is
    // computed over.
    #[test]
    fn test_info_range() {
        let buf = b"d8:announce3:url4:infod4:name1:x6:lengthi1eee";
        let (value, range) = parse_with_info_range(buf).unwrap();
        let range = range.unwrap();
        assert_eq!(&buf[range.clone()], b"d4:name1:x6:lengthi1ee");
        // the recorded range re-parses into the same value as the in-memory
        // info entry
        assert_eq!(
            parse(&buf[range]).unwrap(),
            *value.lookup(b"info").unwrap()
        );
    }

    // Tests that an `info` key in a nested dictionary is not mistaken for
    // the top level one.
    #[test]
    fn test_nested_info_not_recorded() {
        let buf = b"d1:ad4:infoi1eee";
        let (_, range) = parse_with_info_range(buf).unwrap();
        assert!(range.is_none());
    }

    // Tests that encoding sorts dictionary keys even if they were inserted
    // out of order.
    #[test]
    fn test_encode_sorts_keys() {
        let value = Value::Dict(vec![
            (b"zebra".to_vec(), Value::Int(1)),
            (b"apple".to_vec(), Value::Int(2)),
        ]);
        assert_eq!(value.encode(), b"d5:applei2e5:zebrai1ee");
    }
}
