//! Peer blocklists: ordered IPv4 range sets loaded from the two common
//! textual formats and compiled into a packed binary cache.
//!
//! Malformed lines are skipped rather than failing the whole load, as real
//! world blocklists are full of them. After loading, overlapping and
//! adjacent ranges are merged so that membership testing is a single binary
//! search over disjoint ranges.

use std::{
    fs,
    io::{self, Read, Write},
    net::{IpAddr, Ipv4Addr},
    path::Path,
};

/// A single inclusive IPv4 range in host byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpRange {
    pub begin: u32,
    pub end: u32,
}

/// An immutable set of blocked IPv4 ranges.
///
/// Invariant: ranges are sorted, non-overlapping and non-adjacent, that is,
/// `ranges[i].end + 1 < ranges[i + 1].begin` holds for all i.
#[derive(Clone, Debug, Default)]
pub struct Blocklist {
    ranges: Vec<IpRange>,
}

impl Blocklist {
    /// Parses a blocklist from text in either the "P2P plaintext"
    /// (`comment:a.b.c.d-e.f.g.h`) or the "DAT"
    /// (`a.b.c.d - e.f.g.h , 000 , comment`) format, detected per line.
    ///
    /// Returns the blocklist and the number of lines that were skipped as
    /// malformed.
    pub fn parse(text: &str) -> (Self, usize) {
        let mut ranges = Vec::new();
        let mut skipped = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some(range) => ranges.push(range),
                None => skipped += 1,
            }
        }
        (Self::from_ranges(ranges), skipped)
    }

    /// Reads and parses a textual blocklist file.
    pub fn load(path: &Path) -> io::Result<(Self, usize)> {
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Builds a blocklist from arbitrary ranges, sorting them and merging
    /// overlapping and adjacent ones in a single pass.
    fn from_ranges(mut ranges: Vec<IpRange>) -> Self {
        ranges.sort_by_key(|r| r.begin);

        let mut merged: Vec<IpRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                // a range is absorbed if it begins at or before one past the
                // previous range's end
                Some(prev) if range.begin <= prev.end.saturating_add(1) => {
                    prev.end = prev.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    /// Returns whether the address is covered by any blocked range.
    ///
    /// IPv6 addresses are never blocked as the list format is IPv4 only.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = match addr {
            IpAddr::V4(addr) => u32::from(addr),
            IpAddr::V6(_) => return false,
        };
        self.ranges
            .binary_search_by(|range| {
                if addr < range.begin {
                    std::cmp::Ordering::Greater
                } else if addr > range.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Returns the number of (merged) ranges in the list.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Writes the compiled form: a packed array of little endian
    /// `(u32 begin, u32 end)` pairs. Loading this back skips the text parse
    /// and merge entirely.
    pub fn write_cache(&self, path: &Path) -> io::Result<()> {
        let mut buf = Vec::with_capacity(self.ranges.len() * 8);
        for range in &self.ranges {
            buf.extend_from_slice(&range.begin.to_le_bytes());
            buf.extend_from_slice(&range.end.to_le_bytes());
        }
        let mut file = fs::File::create(path)?;
        file.write_all(&buf)
    }

    /// Loads a compiled blocklist cache written by [`Self::write_cache`].
    pub fn load_cache(path: &Path) -> io::Result<Self> {
        let mut buf = Vec::new();
        fs::File::open(path)?.read_to_end(&mut buf)?;
        if buf.len() % 8 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "blocklist cache length not a multiple of 8",
            ));
        }
        let mut ranges = Vec::with_capacity(buf.len() / 8);
        for pair in buf.chunks_exact(8) {
            let begin = u32::from_le_bytes(pair[0..4].try_into().unwrap());
            let end = u32::from_le_bytes(pair[4..8].try_into().unwrap());
            if begin > end {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "blocklist cache range inverted",
                ));
            }
            ranges.push(IpRange { begin, end });
        }
        // the cache was written sorted and merged but don't trust it blindly
        Ok(Self::from_ranges(ranges))
    }
}

/// Parses one line in either supported format, returning `None` if the line
/// is malformed.
fn parse_line(line: &str) -> Option<IpRange> {
    // DAT lines have comma separated fields with the range first; P2P lines
    // have the range after the last colon (the comment may contain colons)
    let range = if let Some((range, _)) = line.split_once(',') {
        range
    } else if let Some((_, range)) = line.rsplit_once(':') {
        range
    } else {
        line
    };

    let (begin, end) = range.split_once('-')?;
    let begin: Ipv4Addr = begin.trim().parse().ok()?;
    let end: Ipv4Addr = end.trim().parse().ok()?;
    let (mut begin, mut end) = (u32::from(begin), u32::from(end));
    if begin > end {
        std::mem::swap(&mut begin, &mut end);
    }
    Some(IpRange { begin, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    // Tests that overlapping ranges are merged on load and that lookups hit
    // the merged ranges and miss the gaps.
    #[test]
    fn test_merge_and_lookup() {
        let (list, skipped) = Blocklist::parse(
            "bad corp:0.0.0.100-0.0.0.200\n\
             worse corp:0.0.0.150-0.0.0.250\n\
             other corp:0.0.1.144-0.0.1.244\n",
        );
        assert_eq!(skipped, 0);
        assert_eq!(list.len(), 2);
        assert_eq!(
            list.ranges,
            vec![
                IpRange { begin: 100, end: 250 },
                IpRange { begin: 400, end: 500 },
            ]
        );
        assert!(list.contains(addr("0.0.0.150")));
        assert!(list.contains(addr("0.0.0.100")));
        assert!(list.contains(addr("0.0.0.250")));
        assert!(!list.contains(addr("0.0.1.44")));
        assert!(!list.contains(addr("0.0.0.99")));
        assert!(!list.contains(addr("0.0.2.0")));
    }

    // Tests that ranges that merely touch are merged too, as there is no
    // unblocked address between them.
    #[test]
    fn test_adjacent_ranges_merged() {
        let (list, _) = Blocklist::parse(
            "a:0.0.0.1-0.0.0.10\n\
             b:0.0.0.11-0.0.0.20\n",
        );
        assert_eq!(list.len(), 1);
        assert_eq!(list.ranges, vec![IpRange { begin: 1, end: 20 }]);
    }

    #[test]
    fn test_dat_format() {
        let (list, skipped) = Blocklist::parse(
            "# comment line\n\
             001.002.003.000 - 001.002.003.255 , 000 , some corp\n",
        );
        assert_eq!(skipped, 0);
        assert_eq!(list.len(), 1);
        assert!(list.contains(addr("1.2.3.77")));
        assert!(!list.contains(addr("1.2.4.0")));
    }

    // Tests that malformed lines are skipped and counted without affecting
    // the valid ones.
    #[test]
    fn test_malformed_lines_skipped() {
        let (list, skipped) = Blocklist::parse(
            "valid:1.2.3.4-1.2.3.8\n\
             not an entry at all\n\
             bad range:1.2.3.4-999.2.3.4\n",
        );
        assert_eq!(skipped, 2);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_ipv6_never_blocked() {
        let (list, _) = Blocklist::parse("all:0.0.0.0-255.255.255.255\n");
        assert!(list.contains(addr("10.0.0.1")));
        assert!(!list.contains(addr("::1")));
        assert!(!list.contains(addr("2001:db8::1")));
    }

    // Tests that the disjointness invariant holds after loading: every
    // range's end is strictly below the next range's begin.
    #[test]
    fn test_disjoint_invariant() {
        let (list, _) = Blocklist::parse(
            "c:9.0.0.0-9.0.0.4\n\
             a:1.0.0.0-1.0.0.255\n\
             b:1.0.0.128-2.0.0.0\n\
             d:9.0.0.5-9.0.0.6\n",
        );
        for pair in list.ranges.windows(2) {
            assert!(pair[0].begin <= pair[0].end);
            assert!(pair[0].end < pair[1].begin);
        }
    }

    // Tests the compiled cache roundtrip.
    #[test]
    fn test_cache_roundtrip() {
        let (list, _) = Blocklist::parse(
            "a:1.2.3.4-1.2.3.200\n\
             b:10.0.0.0-10.255.255.255\n",
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklist.bin");
        list.write_cache(&path).unwrap();

        let loaded = Blocklist::load_cache(&path).unwrap();
        assert_eq!(loaded.ranges, list.ranges);
        assert!(loaded.contains(addr("10.20.30.40")));
        assert!(!loaded.contains(addr("11.0.0.0")));
    }
}
