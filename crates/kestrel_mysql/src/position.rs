use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use kestrel_common::error::PositionError;

const FLAVOR_MYSQL56: &str = "MySQL56";
const FLAVOR_FILEPOS: &str = "FilePos";

/// A 16-byte server UUID, the per-server namespace of a GTID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceUuid(pub [u8; 16]);

impl fmt::Display for SourceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12],
            b[13], b[14], b[15]
        )
    }
}

impl Serialize for SourceUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SourceUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

impl FromStr for SourceUuid {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| PositionError::Malformed {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 || !hex.is_ascii() {
            return Err(malformed("UUID must contain 32 hex digits"));
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|_| malformed("UUID contains non-hex digit"))?;
        }
        Ok(SourceUuid(bytes))
    }
}

/// An inclusive interval of GTID sequence numbers, `start <= end`, `start >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start >= 1 && start <= end);
        Self { start, end }
    }

    fn parse(s: &str, input: &str) -> Result<Self, PositionError> {
        let malformed = |reason: String| PositionError::Malformed {
            input: input.to_string(),
            reason,
        };
        let (start, end) = match s.split_once('-') {
            Some((lo, hi)) => (
                lo.parse::<u64>()
                    .map_err(|e| malformed(format!("bad interval start {lo:?}: {e}")))?,
                hi.parse::<u64>()
                    .map_err(|e| malformed(format!("bad interval end {hi:?}: {e}")))?,
            ),
            None => {
                let n = s
                    .parse::<u64>()
                    .map_err(|e| malformed(format!("bad sequence number {s:?}: {e}")))?;
                (n, n)
            }
        };
        if start < 1 || end < start {
            return Err(malformed(format!("invalid interval {start}-{end}")));
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A MySQL 5.6-style GTID set: source UUID → normalized interval list.
///
/// Normalized means sorted, non-overlapping, non-adjacent, and non-empty per
/// UUID. Every constructor and operation maintains this.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mysql56GtidSet {
    intervals: BTreeMap<SourceUuid, Vec<Interval>>,
}

impl Mysql56GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Insert intervals for a source UUID, renormalizing.
    pub fn add_intervals(&mut self, uuid: SourceUuid, intervals: impl IntoIterator<Item = Interval>) {
        let mut merged = self.intervals.remove(&uuid).unwrap_or_default();
        merged.extend(intervals);
        let merged = normalize(merged);
        if !merged.is_empty() {
            self.intervals.insert(uuid, merged);
        }
    }

    /// True iff every GTID in `self` is also in `other`.
    pub fn subset_of(&self, other: &Mysql56GtidSet) -> bool {
        self.intervals.iter().all(|(uuid, intervals)| {
            let Some(cover) = other.intervals.get(uuid) else {
                return false;
            };
            intervals.iter().all(|iv| {
                cover
                    .iter()
                    .any(|c| c.start <= iv.start && iv.end <= c.end)
            })
        })
    }

    /// Set union.
    pub fn union(&self, other: &Mysql56GtidSet) -> Mysql56GtidSet {
        let mut out = self.clone();
        for (uuid, intervals) in &other.intervals {
            out.add_intervals(*uuid, intervals.iter().copied());
        }
        out
    }

    /// GTIDs in `self` that are not in `other`.
    pub fn subtract(&self, other: &Mysql56GtidSet) -> Mysql56GtidSet {
        let mut out = Mysql56GtidSet::new();
        for (uuid, intervals) in &self.intervals {
            let remaining = match other.intervals.get(uuid) {
                None => intervals.clone(),
                Some(holes) => subtract_intervals(intervals, holes),
            };
            if !remaining.is_empty() {
                out.intervals.insert(*uuid, remaining);
            }
        }
        out
    }

    /// Remove every GTID sourced from `uuid`, returning the remainder.
    pub fn without_source(&self, uuid: &SourceUuid) -> Mysql56GtidSet {
        let mut out = self.clone();
        out.intervals.remove(uuid);
        out
    }

    fn parse_body(body: &str, input: &str) -> Result<Self, PositionError> {
        let mut set = Mysql56GtidSet::new();
        for clause in body.split(',') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let mut parts = clause.split(':');
            let uuid: SourceUuid = parts
                .next()
                .unwrap_or_default()
                .parse()
                .map_err(|_| PositionError::Malformed {
                    input: input.to_string(),
                    reason: format!("bad source UUID in clause {clause:?}"),
                })?;
            let mut intervals = Vec::new();
            for range in parts {
                intervals.push(Interval::parse(range, input)?);
            }
            if intervals.is_empty() {
                return Err(PositionError::Malformed {
                    input: input.to_string(),
                    reason: format!("clause {clause:?} has no intervals"),
                });
            }
            set.add_intervals(uuid, intervals);
        }
        Ok(set)
    }
}

impl fmt::Display for Mysql56GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.intervals {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{uuid}")?;
            for iv in intervals {
                write!(f, ":{iv}")?;
            }
        }
        Ok(())
    }
}

/// Sort and coalesce overlapping or adjacent intervals.
fn normalize(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort();
    let mut out: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals {
        match out.last_mut() {
            Some(last) if iv.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(iv.end);
            }
            _ => out.push(iv),
        }
    }
    out
}

/// Subtract `holes` from `intervals`. Both inputs are normalized.
fn subtract_intervals(intervals: &[Interval], holes: &[Interval]) -> Vec<Interval> {
    let mut out = Vec::new();
    for &iv in intervals {
        let mut cursor = iv.start;
        for hole in holes {
            if hole.end < cursor {
                continue;
            }
            if hole.start > iv.end {
                break;
            }
            if hole.start > cursor {
                out.push(Interval::new(cursor, hole.start - 1));
            }
            cursor = hole.end.saturating_add(1);
            if cursor > iv.end {
                break;
            }
        }
        if cursor <= iv.end {
            out.push(Interval::new(cursor, iv.end));
        }
    }
    out
}

/// A binary-log file position: totally ordered by (file, offset).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct FilePosition {
    pub file: String,
    pub offset: u64,
}

impl FilePosition {
    pub fn is_empty(&self) -> bool {
        self.file.is_empty() && self.offset == 0
    }
}

impl fmt::Display for FilePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// A replication position of either flavor.
///
/// The external representation is `<flavor>/<payload>`; the empty string is
/// the zero position (an uninitialized replica reports it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    Mysql56(Mysql56GtidSet),
    FilePos(FilePosition),
}

impl Default for Position {
    fn default() -> Self {
        Position::Mysql56(Mysql56GtidSet::new())
    }
}

impl Position {
    pub fn flavor(&self) -> &'static str {
        match self {
            Position::Mysql56(_) => FLAVOR_MYSQL56,
            Position::FilePos(_) => FLAVOR_FILEPOS,
        }
    }

    /// The zero position: nothing has been applied.
    pub fn is_zero(&self) -> bool {
        match self {
            Position::Mysql56(set) => set.is_empty(),
            Position::FilePos(fp) => fp.is_empty(),
        }
    }

    /// True iff `self` is a subset of `other`. Cross-flavor is always false.
    pub fn subset_of(&self, other: &Position) -> bool {
        match (self, other) {
            (Position::Mysql56(a), Position::Mysql56(b)) => a.subset_of(b),
            (Position::FilePos(a), Position::FilePos(b)) => a <= b,
            _ => false,
        }
    }

    /// "Has caught up": every GTID in `reference` is present in `self`.
    pub fn at_least(&self, reference: &Position) -> bool {
        reference.subset_of(self)
    }

    /// Strictly ahead: superset and not equal.
    pub fn ahead_of(&self, other: &Position) -> bool {
        other.subset_of(self) && self != other
    }

    /// Neither position contains the other.
    pub fn diverges_from(&self, other: &Position) -> bool {
        !self.subset_of(other) && !other.subset_of(self)
    }

    pub fn union(&self, other: &Position) -> Result<Position, PositionError> {
        match (self, other) {
            (Position::Mysql56(a), Position::Mysql56(b)) => Ok(Position::Mysql56(a.union(b))),
            (Position::FilePos(a), Position::FilePos(b)) => {
                Ok(Position::FilePos(a.clone().max(b.clone())))
            }
            _ => Err(self.flavor_mismatch(other)),
        }
    }

    pub fn subtract(&self, other: &Position) -> Result<Position, PositionError> {
        match (self, other) {
            (Position::Mysql56(a), Position::Mysql56(b)) => Ok(Position::Mysql56(a.subtract(b))),
            (Position::FilePos(a), Position::FilePos(b)) => Ok(if *a <= *b {
                Position::FilePos(FilePosition::default())
            } else {
                self.clone()
            }),
            _ => Err(self.flavor_mismatch(other)),
        }
    }

    /// GTIDs present in `self` but absent from the agreed-upon reference
    /// history. Non-empty means promoting this position would resurrect an
    /// unacknowledged write.
    pub fn errant_gtids(&self, reference: &Position) -> Result<Position, PositionError> {
        self.subtract(reference)
    }

    fn flavor_mismatch(&self, other: &Position) -> PositionError {
        PositionError::FlavorMismatch {
            left: self.flavor(),
            right: other.flavor(),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return Ok(());
        }
        match self {
            Position::Mysql56(set) => write!(f, "{FLAVOR_MYSQL56}/{set}"),
            Position::FilePos(fp) => write!(f, "{FLAVOR_FILEPOS}/{fp}"),
        }
    }
}

impl FromStr for Position {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Position::default());
        }
        let (flavor, body) = s.split_once('/').ok_or_else(|| PositionError::Malformed {
            input: s.to_string(),
            reason: "expected <flavor>/<position>".to_string(),
        })?;
        match flavor {
            FLAVOR_MYSQL56 => Ok(Position::Mysql56(Mysql56GtidSet::parse_body(body, s)?)),
            FLAVOR_FILEPOS => {
                let (file, offset) =
                    body.rsplit_once(':')
                        .ok_or_else(|| PositionError::Malformed {
                            input: s.to_string(),
                            reason: "expected <file>:<offset>".to_string(),
                        })?;
                let offset = offset.parse::<u64>().map_err(|e| PositionError::Malformed {
                    input: s.to_string(),
                    reason: format!("bad offset: {e}"),
                })?;
                Ok(Position::FilePos(FilePosition {
                    file: file.to_string(),
                    offset,
                }))
            }
            other => Err(PositionError::UnknownFlavor(other.to_string())),
        }
    }
}

// Positions travel on the wire in their external text form.
impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const U1: &str = "00000000-0000-0000-0000-000000000001";
    const U2: &str = "00000000-0000-0000-0000-000000000002";

    fn pos(s: &str) -> Position {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_display_round_trip() {
        let input = format!("MySQL56/{U1}:1-21,{U2}:1-5:8");
        let p = pos(&input);
        assert_eq!(p.to_string(), input);
    }

    #[test]
    fn test_parse_single_sequence_as_interval() {
        let p = pos(&format!("MySQL56/{U1}:7"));
        assert_eq!(p.to_string(), format!("MySQL56/{U1}:7"));
    }

    #[test]
    fn test_zero_position() {
        let p = pos("");
        assert!(p.is_zero());
        assert_eq!(p.to_string(), "");
        // Zero is a subset of everything, including itself.
        assert!(p.subset_of(&pos(&format!("MySQL56/{U1}:1-5"))));
        assert!(p.subset_of(&pos("")));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("MySQL56/not-a-uuid:1-5".parse::<Position>().is_err());
        assert!(format!("MySQL56/{U1}").parse::<Position>().is_err());
        assert!(format!("MySQL56/{U1}:5-1").parse::<Position>().is_err());
        assert!(format!("MySQL56/{U1}:0-3").parse::<Position>().is_err());
        assert!("Maria10/0-1-5".parse::<Position>().is_err());
        assert!("garbage".parse::<Position>().is_err());
    }

    #[test]
    fn test_normalization_merges_adjacent_and_overlapping() {
        let a = pos(&format!("MySQL56/{U1}:1-5:6-10:12"));
        assert_eq!(a.to_string(), format!("MySQL56/{U1}:1-10:12"));
        let b = pos(&format!("MySQL56/{U1}:3-8:1-5"));
        assert_eq!(b.to_string(), format!("MySQL56/{U1}:1-8"));
    }

    #[test]
    fn test_subset_and_ahead() {
        let small = pos(&format!("MySQL56/{U1}:1-21"));
        let big = pos(&format!("MySQL56/{U1}:1-26"));
        assert!(small.subset_of(&big));
        assert!(!big.subset_of(&small));
        assert!(big.ahead_of(&small));
        assert!(!small.ahead_of(&big));
        assert!(!big.ahead_of(&big));
        assert!(big.at_least(&small));
        assert!(big.at_least(&big));
    }

    #[test]
    fn test_subset_requires_every_uuid() {
        let a = pos(&format!("MySQL56/{U1}:1-10,{U2}:1"));
        let b = pos(&format!("MySQL56/{U1}:1-20"));
        assert!(!a.subset_of(&b));
        assert!(b.at_least(&pos(&format!("MySQL56/{U1}:5-10"))));
    }

    #[test]
    fn test_divergence() {
        let a = pos(&format!("MySQL56/{U1}:1-21,{U2}:1-5"));
        let b = pos(&format!("MySQL56/{U1}:1-22"));
        assert!(a.diverges_from(&b));
        assert!(b.diverges_from(&a));
        let c = pos(&format!("MySQL56/{U1}:1-22,{U2}:1-5"));
        assert!(!a.diverges_from(&c));
    }

    #[test]
    fn test_union() {
        let a = pos(&format!("MySQL56/{U1}:1-10"));
        let b = pos(&format!("MySQL56/{U1}:8-15,{U2}:3"));
        let u = a.union(&b).unwrap();
        assert_eq!(u.to_string(), format!("MySQL56/{U1}:1-15,{U2}:3"));
    }

    #[test]
    fn test_subtract_carves_holes() {
        let a = pos(&format!("MySQL56/{U1}:1-20"));
        let b = pos(&format!("MySQL56/{U1}:5-8:15"));
        let d = a.subtract(&b).unwrap();
        assert_eq!(d.to_string(), format!("MySQL56/{U1}:1-4:9-14:16-20"));
    }

    #[test]
    fn test_subtract_to_empty() {
        let a = pos(&format!("MySQL56/{U1}:1-20"));
        let d = a.subtract(&a).unwrap();
        assert!(d.is_zero());
    }

    #[test]
    fn test_errant_gtids() {
        let replica = pos(&format!("MySQL56/{U1}:1-19,{U2}:1"));
        let reference = pos(&format!("MySQL56/{U1}:1-20"));
        let errant = replica.errant_gtids(&reference).unwrap();
        assert_eq!(errant.to_string(), format!("MySQL56/{U2}:1"));
    }

    #[test]
    fn test_without_source() {
        let set = match pos(&format!("MySQL56/{U1}:1-19,{U2}:1")) {
            Position::Mysql56(s) => s,
            _ => unreachable!(),
        };
        let uuid: SourceUuid = U1.parse().unwrap();
        let rest = set.without_source(&uuid);
        assert_eq!(rest.to_string(), format!("{U2}:1"));
    }

    #[test]
    fn test_filepos_ordering() {
        let a = pos("FilePos/binlog.000001:1000");
        let b = pos("FilePos/binlog.000002:50");
        assert!(a.subset_of(&b));
        assert!(b.ahead_of(&a));
        assert_eq!(
            a.union(&b).unwrap().to_string(),
            "FilePos/binlog.000002:50"
        );
    }

    #[test]
    fn test_cross_flavor() {
        let g = pos(&format!("MySQL56/{U1}:1-5"));
        let f = pos("FilePos/binlog.000001:4");
        assert!(!g.subset_of(&f));
        assert!(!f.subset_of(&g));
        assert!(matches!(
            g.union(&f),
            Err(PositionError::FlavorMismatch { .. })
        ));
        assert!(matches!(
            f.subtract(&g),
            Err(PositionError::FlavorMismatch { .. })
        ));
    }

    #[test]
    fn test_uuid_case_insensitive_parse_canonical_display() {
        let upper = "8BC65C84-3FE4-11ED-A912-257F0FCDD6C9";
        let uuid: SourceUuid = upper.parse().unwrap();
        assert_eq!(uuid.to_string(), upper.to_lowercase());
    }

    #[test]
    fn test_serde_as_string() {
        let p = pos(&format!("MySQL56/{U1}:1-21"));
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, format!("\"MySQL56/{U1}:1-21\""));
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
