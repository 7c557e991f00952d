// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitvec::prelude::BitVec;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::RowsetId;

/// Deleted row ordinals of one segment, as of a tablet version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteVector {
    version: i64,
    deletes: Vec<u32>,
}

impl DeleteVector {
    pub fn new(version: i64, deletes: impl IntoIterator<Item = u32>) -> Self {
        let mut deletes = deletes.into_iter().collect_vec();
        deletes.sort_unstable();
        deletes.dedup();
        Self { version, deletes }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty()
    }

    pub fn contains(&self, row_id: u32) -> bool {
        self.deletes.binary_search(&row_id).is_ok()
    }

    /// A new delete vector at `version` with `more` rows deleted on top of this one.
    pub fn extend(&self, version: i64, more: impl IntoIterator<Item = u32>) -> Self {
        Self::new(version, self.deletes.iter().copied().chain(more))
    }

    /// Apply the current DV info to a visibility bitmap
    pub fn apply_to(&self, data: &mut BitVec, offset_row_id: u32) {
        let pos = self.deletes.partition_point(|x| *x < offset_row_id);

        let mut iter = self.deletes.iter().skip(pos).peekable();

        for (row_id, mut bitref) in (offset_row_id as usize..).zip(data.iter_mut()) {
            if let Some(unset_row_id) = iter.peek() {
                if **unset_row_id == row_id as u32 {
                    bitref.set(false);
                    iter.next();
                }
            }
        }
    }
}

/// Persisted form of the versioned delete vectors of one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteVectorEntry {
    pub rowset_id: RowsetId,
    pub segment_id: u32,
    pub versions: Vec<DeleteVector>,
}

/// Versioned delete vectors of every segment of a tablet.
///
/// Versions of one segment are kept in ascending order.
#[derive(Debug, Clone, Default)]
pub struct DeleteVectors {
    map: BTreeMap<(RowsetId, u32), Vec<Arc<DeleteVector>>>,
}

impl DeleteVectors {
    /// The newest delete vector whose version is not greater than `version`.
    pub fn get(&self, rowset_id: RowsetId, segment_id: u32, version: i64) -> Option<Arc<DeleteVector>> {
        let versions = self.map.get(&(rowset_id, segment_id))?;
        let pos = versions.partition_point(|dv| dv.version() <= version);
        pos.checked_sub(1).map(|idx| versions[idx].clone())
    }

    pub fn latest(&self, rowset_id: RowsetId, segment_id: u32) -> Option<Arc<DeleteVector>> {
        self.map.get(&(rowset_id, segment_id))?.last().cloned()
    }

    /// Add a new version. A delete vector with the same version replaces the old one.
    pub fn insert(&mut self, rowset_id: RowsetId, segment_id: u32, dv: DeleteVector) {
        let versions = self.map.entry((rowset_id, segment_id)).or_default();
        let pos = versions.partition_point(|v| v.version() < dv.version());
        if versions.get(pos).map_or(false, |v| v.version() == dv.version()) {
            versions[pos] = Arc::new(dv);
        } else {
            versions.insert(pos, Arc::new(dv));
        }
    }

    /// Drop delete vectors of a rowset that left the tablet.
    pub fn remove_rowset(&mut self, rowset_id: RowsetId) {
        self.map.retain(|(id, _), _| *id != rowset_id);
    }

    /// Drop versions that no reader at `min_read_version` or later can observe.
    pub fn gc(&mut self, min_read_version: i64) {
        for versions in self.map.values_mut() {
            let pos = versions.partition_point(|dv| dv.version() <= min_read_version);
            if pos > 1 {
                versions.drain(..pos - 1);
            }
        }
    }

    pub fn to_entries(&self) -> Vec<DeleteVectorEntry> {
        self.map
            .iter()
            .map(|((rowset_id, segment_id), versions)| DeleteVectorEntry {
                rowset_id: *rowset_id,
                segment_id: *segment_id,
                versions: versions.iter().map(|dv| dv.as_ref().clone()).collect(),
            })
            .collect()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = DeleteVectorEntry>) -> Self {
        let mut dvs = Self::default();
        for entry in entries {
            for dv in entry.versions {
                dvs.insert(entry.rowset_id, entry.segment_id, dv);
            }
        }
        dvs
    }
}
