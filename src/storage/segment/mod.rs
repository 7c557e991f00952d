// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Segment files.
//!
//! A segment is an immutable, self-describing columnar file:
//!
//! ```plain
//! | column pages ... | footer (JSON) | footer len (4B) | checksum (4B crc32) | magic (4B) |
//! ```
//!
//! Pages of one column are contiguous. Columns written by a vertical writer are appended
//! group by group, and the footer is written once all groups are written.

mod iterator;
mod predicate;
mod reader;
mod writer;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

pub use self::iterator::*;
pub use self::predicate::*;
pub use self::reader::*;
pub use self::writer::*;
use super::column::ColumnMeta;
use crate::types::{ColumnId, DataValue, Row};

pub const SEGMENT_MAGIC: u32 = 0x5345_474d;
pub const SEGMENT_TAIL_SIZE: usize = 4 + 4 + 4;

/// Footer of a segment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFooter {
    pub num_rows: u64,
    pub columns: Vec<ColumnMeta>,
    pub short_key_index: ShortKeyIndex,
    /// Full key of the first row. Empty if the segment has no rows.
    pub min_key: Row,
    /// Full key of the last row. Empty if the segment has no rows.
    pub max_key: Row,
}

impl SegmentFooter {
    /// Position and metadata of the column with `unique_id`.
    pub fn column(&self, unique_id: ColumnId) -> Option<(usize, &ColumnMeta)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.unique_id == unique_id)
    }
}

/// Summary of a segment kept in the rowset metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub num_rows: u64,
    pub min_key: Row,
    pub max_key: Row,
    pub data_size: u64,
}

/// A sparse index of short keys, sampled every `interval` rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShortKeyIndex {
    pub interval: u64,
    pub keys: Vec<Row>,
}

impl ShortKeyIndex {
    /// A row ordinal at or before the first row whose key is not less than `key`.
    pub fn seek_lower(&self, key: &[DataValue]) -> u64 {
        let pp = self
            .keys
            .partition_point(|sample| compare_prefix(sample, key) == Ordering::Less);
        pp.saturating_sub(1) as u64 * self.interval
    }

    /// A row ordinal after the last row whose key is not greater than `key`.
    pub fn seek_upper(&self, key: &[DataValue], num_rows: u64) -> u64 {
        let pp = self
            .keys
            .partition_point(|sample| compare_prefix(sample, key) != Ordering::Greater);
        (pp as u64 * self.interval).min(num_rows)
    }
}

/// Compare two keys on their common prefix.
pub fn compare_prefix(left: &[DataValue], right: &[DataValue]) -> Ordering {
    let len = left.len().min(right.len());
    left[..len].cmp(&right[..len])
}

/// Path of a segment of a rowset.
pub fn segment_file_name(rowset_id: u64, segment_id: u32) -> String {
    format!("{rowset_id}_{segment_id}.dat")
}

/// Path of a temporary segment created by a final merge.
pub fn temp_segment_file_name(rowset_id: u64, segment_id: u32) -> String {
    format!("{rowset_id}_{segment_id}.tmp")
}

/// Parse `<rowset_id>_<segment_id>.<ext>` file names.
pub fn parse_segment_file_name(name: &str) -> Option<(u64, u32)> {
    let (stem, ext) = name.rsplit_once('.')?;
    if ext != "dat" && ext != "tmp" {
        return None;
    }
    let (rowset_id, segment_id) = stem.split_once('_')?;
    Some((rowset_id.parse().ok()?, segment_id.parse().ok()?))
}
