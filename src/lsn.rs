// ABOUTME: Log Sequence Number type shared by the copy and streaming pipelines
// ABOUTME: Wraps the 64-bit WAL byte offset with its textual X/X representation

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A byte position in the source's write-ahead log.
///
/// Formatted as two 32-bit hexadecimal halves separated by a slash, the way
/// Postgres prints `pg_lsn` values (e.g. `0/24E3C48`). `Lsn(0)` is the
/// invalid position and means "unset" everywhere in this crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// WAL segment number containing this position.
    pub fn segment_number(self, wal_segment_size: u64) -> u64 {
        self.0 / wal_segment_size
    }

    /// WAL segment file name containing this position, as named by the
    /// server: 24 hex digits made of the timeline and the two halves of the
    /// segment number.
    pub fn segment_file_name(self, timeline: u32, wal_segment_size: u64) -> String {
        let seg_no = self.segment_number(wal_segment_size);
        let segments_per_xlog_id = 0x1_0000_0000u64 / wal_segment_size;
        format!(
            "{:08X}{:08X}{:08X}",
            timeline,
            seg_no / segments_per_xlog_id,
            seg_no % segments_per_xlog_id
        )
    }

    /// First position of the next WAL segment after this one.
    pub fn next_segment_start(self, wal_segment_size: u64) -> Lsn {
        Lsn((self.segment_number(wal_segment_size) + 1) * wal_segment_size)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((hi, lo)) = s.split_once('/') else {
            bail!("Invalid LSN \"{}\": expected two halves separated by '/'", s);
        };
        let hi = u64::from_str_radix(hi, 16)
            .with_context(|| format!("Invalid LSN \"{}\": bad upper half", s))?;
        let lo = u64::from_str_radix(lo, 16)
            .with_context(|| format!("Invalid LSN \"{}\": bad lower half", s))?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            bail!("Invalid LSN \"{}\": half out of range", s);
        }
        Ok(Lsn(hi << 32 | lo))
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
