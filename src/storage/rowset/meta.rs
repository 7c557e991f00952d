// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::segment::SegmentMeta;
use crate::types::{ColumnId, SchemaId, TabletId};

/// Id of a rowset, assigned monotonically by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowsetId(pub u64);

impl fmt::Display for RowsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inclusive range of tablet versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub start: i64,
    pub end: i64,
}

impl Version {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// A version range holding a single version.
    pub fn single(version: i64) -> Self {
        Self::new(version, version)
    }

    pub fn contains(&self, other: &Version) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowsetState {
    /// Being written. Never reachable from a tablet.
    Writing,
    /// Built, not yet visible to readers.
    Committed,
    /// Part of the version graph of a tablet.
    Visible,
    /// Replaced by compaction or dropped, waiting to be vacuumed.
    Discarded,
}

/// Whether the key ranges of the segments of a rowset overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentsOverlap {
    Unknown,
    Overlapping,
    NonOverlapping,
}

/// Persisted metadata of a rowset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsetMeta {
    pub rowset_id: RowsetId,
    pub tablet_id: TabletId,
    pub version: Version,
    pub num_rows: u64,
    pub num_segments: usize,
    pub total_disk_size: u64,
    pub schema_id: SchemaId,
    pub state: RowsetState,
    pub segments_overlap: SegmentsOverlap,
    /// Columns stored by a partial-column rowset. `None` if every column is stored.
    pub referenced_column_ids: Option<Vec<ColumnId>>,
    pub segments: Vec<SegmentMeta>,
    /// Seconds since the Unix epoch.
    pub creation_time: u64,
}

impl RowsetMeta {
    /// Whether the rowset holds no rows.
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }
}
