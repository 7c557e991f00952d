// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Primary indexes of PRIMARY tablets.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex as PLMutex;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::iterator::ChunkIterator;
use super::segment::{SegmentIterator, SegmentReadOptions};
use super::tablet::{Tablet, TabletState};
use super::{DeleteVector, RowsetId, RowsetRef, StorageResult, TracedStorageError};
use crate::catalog::{KeysType, TabletSchemaRef};
use crate::types::{DataValue, Row, TabletId};

/// Where the latest version of a key is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowLocation {
    pub rowset_id: RowsetId,
    pub segment_id: u32,
    pub row_id: u32,
}

/// Key to location map of one tablet.
///
/// Rowsets are applied in version order. `applied_version` is the end version of the newest
/// rowset applied so far.
#[derive(Debug)]
pub struct PrimaryIndex {
    map: HashMap<Row, RowLocation>,
    applied_version: i64,
    loaded: bool,
}

impl Default for PrimaryIndex {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            applied_version: -1,
            loaded: false,
        }
    }
}

impl PrimaryIndex {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &[DataValue]) -> Option<RowLocation> {
        self.map.get(key).copied()
    }

    pub fn applied_version(&self) -> i64 {
        self.applied_version
    }
}

type DeletesBySegment = BTreeMap<(RowsetId, u32), Vec<u32>>;

/// Maintains the primary index of every PRIMARY tablet.
///
/// Updates of one tablet are serialized by its index lock. Different tablets update
/// concurrently.
#[derive(Default)]
pub struct UpdateManager {
    indexes: PLMutex<HashMap<TabletId, Arc<Mutex<PrimaryIndex>>>>,
    chunk_size: usize,
}

impl UpdateManager {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            indexes: PLMutex::new(HashMap::new()),
            chunk_size: chunk_size.max(1),
        }
    }

    /// The index lock of a tablet.
    pub fn index(&self, tablet_id: TabletId) -> Arc<Mutex<PrimaryIndex>> {
        self.indexes.lock().entry(tablet_id).or_default().clone()
    }

    pub fn remove_tablet(&self, tablet_id: TabletId) {
        self.indexes.lock().remove(&tablet_id);
    }

    fn check_primary(tablet: &Tablet) -> StorageResult<()> {
        if tablet.schema().keys_type() != KeysType::Primary {
            return Err(TracedStorageError::invalid_state(format!(
                "tablet {} is {}, not a primary key table",
                tablet.tablet_id(),
                tablet.schema().keys_type()
            )));
        }
        Ok(())
    }

    /// Commit `rowset` at `version` and apply it to the index, under the index lock, so that
    /// rowsets are applied in version order.
    pub async fn commit_rowset(
        &self,
        tablet: &Tablet,
        version: i64,
        rowset: RowsetRef,
    ) -> StorageResult<()> {
        Self::check_primary(tablet)?;
        let index = self.index(tablet.tablet_id());
        let mut index = index.lock().await;
        tablet.rowset_commit(version, rowset.clone()).await?;
        self.apply(tablet, &mut index, &rowset).await
    }

    /// Point every key of `rowset` at its new location and mark the rows they replace as
    /// deleted, as of the version of `rowset`.
    ///
    /// `rowset` must be visible in `tablet`. Older visible rowsets not applied yet are applied
    /// first. Applying a rowset twice, or after a newer one, has no effect.
    pub async fn on_rowset_finished(&self, tablet: &Tablet, rowset: &RowsetRef) -> StorageResult<()> {
        Self::check_primary(tablet)?;
        let index = self.index(tablet.tablet_id());
        let mut index = index.lock().await;
        self.apply(tablet, &mut index, rowset).await
    }

    async fn apply(
        &self,
        tablet: &Tablet,
        index: &mut PrimaryIndex,
        rowset: &RowsetRef,
    ) -> StorageResult<()> {
        let state = tablet.snapshot();
        if state.rowset(rowset.id()).is_none() {
            return Err(TracedStorageError::invalid_state(format!(
                "rowset {} is not visible in tablet {}",
                rowset.id(),
                tablet.tablet_id()
            )));
        }
        let version = rowset.version();
        self.ensure_loaded(tablet, &state, index, version.start - 1)
            .await?;
        if version.end <= index.applied_version {
            info!(
                tablet_id = tablet.tablet_id(),
                rowset_id = %rowset.id(),
                applied_version = index.applied_version,
                "index already applied, skipped"
            );
            return Ok(());
        }
        self.apply_pending(tablet, &state, index, version.end).await
    }

    /// Apply every visible rowset newer than the index, up to version `end`, oldest first.
    async fn apply_pending(
        &self,
        tablet: &Tablet,
        state: &TabletState,
        index: &mut PrimaryIndex,
        end: i64,
    ) -> StorageResult<()> {
        let pending = state
            .rowsets
            .iter()
            .filter(|rs| rs.version().end > index.applied_version && rs.version().end <= end)
            .cloned()
            .collect::<Vec<_>>();
        for rowset in &pending {
            self.apply_one(tablet, index, rowset).await?;
        }
        Ok(())
    }

    async fn apply_one(
        &self,
        tablet: &Tablet,
        index: &mut PrimaryIndex,
        rowset: &RowsetRef,
    ) -> StorageResult<()> {
        let key_schema = key_schema(tablet)?;
        let mut updates = vec![];
        for segment in rowset.segments().await? {
            let mut row_id = 0;
            let mut iter = SegmentIterator::new(
                segment.clone(),
                key_schema.clone(),
                SegmentReadOptions::new(self.chunk_size),
            )?;
            while let Some(chunk) = iter.next_batch().await? {
                for key in chunk.rows() {
                    let location = RowLocation {
                        rowset_id: rowset.id(),
                        segment_id: segment.segment_id(),
                        row_id,
                    };
                    updates.push((key, location));
                    row_id += 1;
                }
            }
        }
        let num_rows = updates.len();
        // A key repeated inside the rowset deletes its own earlier row.
        let mut staged: HashMap<Row, RowLocation> = HashMap::new();
        let mut deletes = DeletesBySegment::new();
        for (key, location) in updates {
            let old = match staged.get(&key) {
                Some(old) => Some(*old),
                None => index.map.get(&key).copied(),
            };
            if let Some(old) = old {
                deletes
                    .entry((old.rowset_id, old.segment_id))
                    .or_default()
                    .push(old.row_id);
            }
            staged.insert(key, location);
        }

        let version = rowset.version().end;
        let num_deletes: usize = deletes.values().map(|v| v.len()).sum();
        if !deletes.is_empty() {
            tablet
                .update_delvecs(|delvecs| {
                    for ((rowset_id, segment_id), rows) in deletes {
                        let dv = match delvecs.latest(rowset_id, segment_id) {
                            Some(old) => old.extend(version, rows),
                            None => DeleteVector::new(version, rows),
                        };
                        delvecs.insert(rowset_id, segment_id, dv);
                    }
                })
                .await?;
        }
        index.map.extend(staged);
        index.applied_version = version;
        info!(
            tablet_id = tablet.tablet_id(),
            rowset_id = %rowset.id(),
            version,
            num_rows,
            num_deletes,
            "index applied"
        );
        Ok(())
    }

    /// Publish the output of a compaction of a PRIMARY tablet.
    ///
    /// Keys of `output` whose latest location is one of `inputs` move to `output`. Keys
    /// that moved to a rowset outside `inputs` are marked deleted in `output`.
    pub async fn on_compaction_finished(
        &self,
        tablet: &Tablet,
        inputs: &[RowsetRef],
        output: &RowsetRef,
    ) -> StorageResult<()> {
        Self::check_primary(tablet)?;
        let index = self.index(tablet.tablet_id());
        let mut index = index.lock().await;
        let state = tablet.snapshot();
        self.ensure_loaded(tablet, &state, &mut index, state.max_version)
            .await?;
        self.apply_pending(tablet, &state, &mut index, state.max_version)
            .await?;

        let input_ids: HashSet<RowsetId> = inputs.iter().map(|rs| rs.id()).collect();
        let key_schema = key_schema(tablet)?;
        let mut moved = vec![];
        let mut deletes: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for segment in output.segments().await? {
            let mut row_id = 0;
            let mut iter = SegmentIterator::new(
                segment.clone(),
                key_schema.clone(),
                SegmentReadOptions::new(self.chunk_size),
            )?;
            while let Some(chunk) = iter.next_batch().await? {
                for key in chunk.rows() {
                    match index.map.get(&key) {
                        Some(old) if !input_ids.contains(&old.rowset_id) => {
                            deletes.entry(segment.segment_id()).or_default().push(row_id);
                        }
                        _ => moved.push((
                            key,
                            RowLocation {
                                rowset_id: output.id(),
                                segment_id: segment.segment_id(),
                                row_id,
                            },
                        )),
                    }
                    row_id += 1;
                }
            }
        }

        let version = state.max_version;
        let output_dvs = deletes
            .into_iter()
            .map(|(segment_id, rows)| (segment_id, DeleteVector::new(version, rows)))
            .collect::<Vec<_>>();
        tablet.replace_rowsets(inputs, output.clone(), output_dvs).await?;

        let num_moved = moved.len();
        index.map.extend(moved);
        debug!(
            tablet_id = tablet.tablet_id(),
            rowset_id = %output.id(),
            num_moved,
            "index re-pointed to compaction output"
        );
        Ok(())
    }

    /// Rebuild the index by replaying the visible rowsets that end at or before `upto`, in
    /// version order. Rows already marked deleted are skipped.
    async fn ensure_loaded(
        &self,
        tablet: &Tablet,
        state: &TabletState,
        index: &mut PrimaryIndex,
        upto: i64,
    ) -> StorageResult<()> {
        if index.loaded {
            return Ok(());
        }
        let key_schema = key_schema(tablet)?;
        for rowset in state.rowsets.iter().filter(|rs| rs.version().end <= upto) {
            for segment in rowset.segments().await? {
                let delete_vector = state.delvecs.latest(rowset.id(), segment.segment_id());
                let mut row_id = 0;
                let mut iter = SegmentIterator::new(
                    segment.clone(),
                    key_schema.clone(),
                    SegmentReadOptions::new(self.chunk_size),
                )?;
                while let Some(chunk) = iter.next_batch().await? {
                    for key in chunk.rows() {
                        if !delete_vector.as_ref().map_or(false, |dv| dv.contains(row_id)) {
                            index.map.insert(
                                key,
                                RowLocation {
                                    rowset_id: rowset.id(),
                                    segment_id: segment.segment_id(),
                                    row_id,
                                },
                            );
                        }
                        row_id += 1;
                    }
                }
            }
            index.applied_version = index.applied_version.max(rowset.version().end);
        }
        index.loaded = true;
        debug!(
            tablet_id = tablet.tablet_id(),
            num_keys = index.map.len(),
            "primary index loaded"
        );
        Ok(())
    }
}

fn key_schema(tablet: &Tablet) -> StorageResult<TabletSchemaRef> {
    let schema = tablet.schema();
    Ok(Arc::new(schema.project(&schema.key_column_ids())?))
}
