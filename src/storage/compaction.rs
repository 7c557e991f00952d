// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Compaction merges consecutive rowsets of a tablet into one rowset covering their version
//! range.
//!
//! Rows are merged by key and reconciled as reads would reconcile them. Tables with more
//! columns than `vertical_compaction_max_columns_per_group` compact vertically: the key
//! group is merged first while recording a [`RowSourcePlan`], which is then replayed for
//! every value group.

use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use tokio::sync::oneshot::Receiver;
use tracing::{info, warn};

use super::engine::StorageEngine;
use super::iterator::{
    AggregateIterator, BoxedChunkIterator, ChunkIterator, MaskMergeIterator, MergeIterator,
    RowSourcePlan,
};
use super::page::PageCache;
use super::tablet::{Tablet, TabletState};
use super::update_manager::UpdateManager;
use super::{
    RowsetId, RowsetReadOptions, RowsetRef, RowsetWriter, RowsetWriterContext, RowsetWriterType,
    StorageOptions, StorageResult, TracedStorageError, Version,
};
use crate::array::DataChunk;
use crate::catalog::{KeysType, TabletSchemaRef};
use crate::types::ColumnId;

/// Pick the inputs of the next compaction: the oldest run of at least two consecutive
/// visible rowsets, at most `max_inputs` long.
///
/// The initial empty rowset and partial-column rowsets are never picked.
pub fn pick_input_rowsets(state: &TabletState, max_inputs: usize) -> Vec<RowsetRef> {
    let max_inputs = max_inputs.max(2);
    let mut run: Vec<RowsetRef> = vec![];
    for rowset in &state.rowsets {
        let eligible = rowset.version().start > 0 && !rowset.is_partial();
        if !eligible {
            if run.len() >= 2 {
                break;
            }
            run.clear();
            continue;
        }
        run.push(rowset.clone());
        if run.len() == max_inputs {
            break;
        }
    }
    if run.len() < 2 {
        run.clear();
    }
    run
}

/// One compaction of a tablet.
pub struct CompactionTask {
    tablet: Arc<Tablet>,
    inputs: Vec<RowsetRef>,
    output_rowset_id: RowsetId,
}

impl CompactionTask {
    /// `inputs` must be non-empty and cover consecutive versions, oldest first.
    pub fn new(
        tablet: Arc<Tablet>,
        inputs: Vec<RowsetRef>,
        output_rowset_id: RowsetId,
    ) -> StorageResult<Self> {
        if inputs.is_empty() {
            return Err(TracedStorageError::invalid_state("no rowset to compact"));
        }
        if let Some((a, b)) = inputs
            .iter()
            .tuple_windows()
            .find(|(a, b)| a.version().end + 1 != b.version().start)
        {
            return Err(TracedStorageError::invalid_state(format!(
                "rowsets {} and {} are not consecutive",
                a.version(),
                b.version()
            )));
        }
        Ok(Self {
            tablet,
            inputs,
            output_rowset_id,
        })
    }

    pub fn inputs(&self) -> &[RowsetRef] {
        &self.inputs
    }

    /// The version range covered by the output.
    pub fn output_version(&self) -> Version {
        let start = self.inputs.first().map_or(0, |rs| rs.version().start);
        let end = self.inputs.last().map_or(0, |rs| rs.version().end);
        Version::new(start, end)
    }

    /// Build the output rowset and publish it in place of the inputs.
    ///
    /// The output files are removed if publishing fails, for example with `VersionConflict`
    /// when an input left the tablet meanwhile.
    pub async fn run(
        self,
        options: &StorageOptions,
        page_cache: PageCache,
        update_manager: &UpdateManager,
    ) -> StorageResult<RowsetRef> {
        let schema = self.tablet.schema().clone();
        let version = self.output_version();
        let max_columns_per_group = options.vertical_compaction_max_columns_per_group.max(1);
        let writer_type = if schema.num_columns() > max_columns_per_group {
            RowsetWriterType::Vertical
        } else {
            RowsetWriterType::Horizontal
        };
        let context = RowsetWriterContext::new(
            self.output_rowset_id,
            self.tablet.tablet_id(),
            schema.clone(),
            self.tablet.dir(),
            version,
        )
        .with_writer_type(writer_type);
        let mut writer = RowsetWriter::new(context, options, page_cache)?;

        // Rows deleted at the output version are dropped. Later deletes stay in the inputs'
        // delete vectors and are carried over by the primary index.
        let read_options = RowsetReadOptions {
            sorted: true,
            delvecs: Some(self.tablet.snapshot().delvecs.clone()),
            ..RowsetReadOptions::new(version.end, options.chunk_size.max(1))
        };
        let written = match writer_type {
            RowsetWriterType::Horizontal => {
                self.write_horizontal(&schema, &read_options, &mut writer).await
            }
            RowsetWriterType::Vertical => {
                self.write_vertical(&schema, max_columns_per_group, &read_options, &mut writer)
                    .await
            }
        };
        if let Err(err) = written {
            if let Err(abort_err) = writer.abort().await {
                warn!(
                    rowset_id = %self.output_rowset_id,
                    %abort_err,
                    "failed to abort compaction output"
                );
            }
            return Err(err);
        }
        let output = writer.build().await?;

        let published = if schema.keys_type() == KeysType::Primary {
            update_manager
                .on_compaction_finished(&self.tablet, &self.inputs, &output)
                .await
        } else {
            self.tablet
                .replace_rowsets(&self.inputs, output.clone(), vec![])
                .await
        };
        if let Err(err) = published {
            output.remove_files().await?;
            return Err(err);
        }

        info!(
            "compaction complete: {} -> {}",
            self.inputs.iter().map(|rs| rs.id()).join(","),
            output.id()
        );
        Ok(output)
    }

    /// Every segment of every input, oldest first, so that the merge resolves ties to the
    /// newest row.
    async fn open_inputs(
        &self,
        schema: &TabletSchemaRef,
        options: &RowsetReadOptions,
    ) -> StorageResult<Vec<BoxedChunkIterator>> {
        let mut iters = vec![];
        for rowset in &self.inputs {
            iters.extend(rowset.get_segment_iterators(schema, options).await?);
        }
        Ok(iters)
    }

    async fn write_horizontal(
        &self,
        schema: &TabletSchemaRef,
        options: &RowsetReadOptions,
        writer: &mut RowsetWriter,
    ) -> StorageResult<()> {
        let iters = self.open_inputs(schema, options).await?;
        let merge = MergeIterator::new(schema.clone(), iters, options.chunk_size);
        let mut iter = AggregateIterator::new(merge, options.chunk_size);
        while let Some(chunk) = iter.next_batch().await? {
            writer.add_chunk(&chunk).await?;
        }
        Ok(())
    }

    async fn write_vertical(
        &self,
        schema: &TabletSchemaRef,
        max_columns_per_group: usize,
        options: &RowsetReadOptions,
        writer: &mut RowsetWriter,
    ) -> StorageResult<()> {
        let mut plan: Option<Arc<RowSourcePlan>> = None;
        for (idx, group) in schema.column_groups(max_columns_per_group).iter().enumerate() {
            let group_schema: TabletSchemaRef = Arc::new(schema.project(group)?);
            let iters = self.open_inputs(&group_schema, options).await?;
            let is_key = idx == 0;
            if is_key {
                let merge = MergeIterator::new(group_schema.clone(), iters, options.chunk_size);
                let mut iter = AggregateIterator::new(merge, options.chunk_size).with_plan();
                write_group(&mut iter, group, true, writer).await?;
                plan = iter.take_plan().map(Arc::new);
            } else {
                let plan = plan
                    .clone()
                    .ok_or_else(|| TracedStorageError::invalid_state("row source plan missing"))?;
                let mut iter =
                    MaskMergeIterator::new(group_schema.clone(), iters, plan, options.chunk_size);
                write_group(&mut iter, group, false, writer).await?;
            }
        }
        writer.final_flush().await
    }
}

async fn write_group(
    iter: &mut dyn ChunkIterator,
    column_ids: &[ColumnId],
    is_key: bool,
    writer: &mut RowsetWriter,
) -> StorageResult<()> {
    // An empty chunk opens the group even when nothing survives the merge.
    let empty = DataChunk::from_rows(&iter.schema().data_types(), std::iter::empty());
    writer.add_columns(&empty, column_ids, is_key).await?;
    while let Some(chunk) = iter.next_batch().await? {
        writer.add_columns(&chunk, column_ids, is_key).await?;
    }
    writer.flush_columns().await
}

/// Compacts every tablet of an engine in the background until stopped.
pub struct Compactor {
    engine: Arc<StorageEngine>,
    stop: Receiver<()>,
}

impl Compactor {
    pub fn new(engine: Arc<StorageEngine>, stop: Receiver<()>) -> Self {
        Self { engine, stop }
    }

    /// Run one round over all tablets. Tablets being compacted by someone else are skipped.
    pub async fn compact_once(&self) {
        for tablet in self.engine.tablets() {
            let Some(_guard) = tablet.try_lock_compaction() else {
                continue;
            };
            if let Err(err) = self.engine.compact_locked(&tablet).await {
                warn!(tablet_id = tablet.tablet_id(), %err, "compaction failed");
            }
            if let Err(err) = tablet.vacuum().await {
                warn!(tablet_id = tablet.tablet_id(), %err, "vacuum failed");
            }
        }
    }

    pub async fn run(mut self) -> StorageResult<()> {
        let interval = Duration::from_millis(self.engine.options().compaction_interval_ms.max(1));
        loop {
            self.compact_once().await;
            tokio::select! {
                _ = &mut self.stop => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("compactor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{TabletColumn, TabletSchema};
    use crate::storage::iterator::test_util::{collect_rows, kv, kv_schema};
    use crate::storage::test_util::TestTablet;
    use crate::storage::{RowsetState, SegmentsOverlap, StorageError};
    use crate::types::{DataType, DataValue, Row};

    fn rows(keys: std::ops::Range<i32>, v: i64) -> Vec<Row> {
        keys.map(|k| kv(k, v)).collect()
    }

    async fn read_rowset(rowset: &RowsetRef) -> Vec<Row> {
        let options = RowsetReadOptions {
            sorted: true,
            ..RowsetReadOptions::new(rowset.version().end, 1024)
        };
        let mut iter = rowset.new_iterator(rowset.schema(), &options).await.unwrap();
        collect_rows(iter.as_mut()).await
    }

    async fn compact(t: &TestTablet, output_id: u64) -> StorageResult<RowsetRef> {
        let inputs = pick_input_rowsets(&t.tablet.snapshot(), t.options.max_compaction_input_rowsets);
        let task = CompactionTask::new(t.tablet.clone(), inputs, RowsetId(output_id))?;
        task.run(&t.options, t.cache.clone(), &UpdateManager::new(1024))
            .await
    }

    #[tokio::test]
    async fn test_pick_input_rowsets() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(KeysType::Duplicate)).await;
        assert!(pick_input_rowsets(&t.tablet.snapshot(), 10).is_empty());
        for i in 0..4 {
            t.commit(i + 1, i as i64 + 2, vec![rows(0..10, 1)]).await;
        }
        let picked = pick_input_rowsets(&t.tablet.snapshot(), 3);
        assert_eq!(
            picked.iter().map(|rs| rs.id()).collect::<Vec<_>>(),
            vec![RowsetId(1), RowsetId(2), RowsetId(3)]
        );
        assert_eq!(pick_input_rowsets(&t.tablet.snapshot(), 10).len(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(KeysType::Duplicate)).await;
        t.commit(1, 2, vec![rows(0..100, 1)]).await;
        t.commit(2, 3, vec![rows(50..150, 2)]).await;
        t.commit(3, 4, vec![rows(0..10, 3)]).await;

        let output = compact(&t, 4).await.unwrap();
        assert_eq!(output.version(), Version::new(2, 4));
        assert_eq!(output.num_rows(), 210);
        assert_eq!(output.state(), RowsetState::Visible);

        let state = t.tablet.snapshot();
        assert_eq!(state.rowsets.len(), 2);
        assert_eq!(state.stale.len(), 3);
        assert!(state.stale.iter().all(|rs| rs.state() == RowsetState::Discarded));
        let rows = read_rowset(&output).await;
        assert!(rows.windows(2).all(|w| w[0][0] <= w[1][0]));
    }

    #[tokio::test]
    async fn test_aggregate_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(KeysType::Aggregate)).await;
        t.commit(1, 2, vec![rows(0..100, 1)]).await;
        t.commit(2, 3, vec![rows(50..150, 2)]).await;

        let output = compact(&t, 3).await.unwrap();
        let rows = read_rowset(&output).await;
        assert_eq!(rows.len(), 150);
        assert_eq!(rows[10], kv(10, 1));
        assert_eq!(rows[60], kv(60, 3));
        assert_eq!(rows[120], kv(120, 2));
    }

    fn wide_schema() -> TabletSchemaRef {
        Arc::new(
            TabletSchema::new(
                1,
                KeysType::Unique,
                vec![
                    TabletColumn::new(0, "k1", DataType::Int32).key(),
                    TabletColumn::new(1, "k2", DataType::Int32).key(),
                    TabletColumn::new(2, "v1", DataType::Int64),
                    TabletColumn::new(3, "v2", DataType::String).nullable(),
                    TabletColumn::new(4, "v3", DataType::Int64),
                ],
                1,
            )
            .unwrap(),
        )
    }

    fn wide_row(k: i32, v: i64) -> Row {
        vec![
            DataValue::Int32(k),
            DataValue::Int32(k),
            DataValue::Int64(v),
            DataValue::String(format!("s{k}_{v}")),
            DataValue::Int64(v * 10),
        ]
    }

    fn wide_rows(keys: std::ops::Range<i32>, v: i64) -> Vec<Row> {
        keys.map(|k| wide_row(k, v)).collect()
    }

    /// Three overlapping rowsets of a Unique table, compacted with groups of `max` columns.
    async fn compact_wide(max_columns_per_group: usize) -> Vec<Row> {
        let dir = tempfile::tempdir().unwrap();
        let mut t = TestTablet::create(dir.path(), wide_schema()).await;
        t.options.vertical_compaction_max_columns_per_group = max_columns_per_group;
        t.options.max_rows_per_segment = 700;
        t.commit(1, 2, vec![wide_rows(0..1024, 1)]).await;
        t.commit(2, 3, vec![wide_rows(512..1536, 2)]).await;
        t.commit(3, 4, vec![wide_rows(1024..2048, 3)]).await;

        let output = compact(&t, 4).await.unwrap();
        assert_eq!(output.num_rows(), 2048);
        assert_eq!(output.segments_overlap(), SegmentsOverlap::NonOverlapping);
        read_rowset(&output).await
    }

    #[tokio::test]
    async fn test_vertical_compaction_matches_horizontal() {
        let expected = (0..2048)
            .map(|k| match k {
                0..=511 => wide_row(k, 1),
                512..=1023 => wide_row(k, 2),
                _ => wide_row(k, 3),
            })
            .collect::<Vec<_>>();
        let horizontal = compact_wide(5).await;
        assert_eq!(horizontal, expected);
        let vertical = compact_wide(2).await;
        assert_eq!(vertical, expected);
    }

    #[tokio::test]
    async fn test_conflict_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(KeysType::Duplicate)).await;
        t.commit(1, 2, vec![rows(0..10, 1)]).await;
        t.commit(2, 3, vec![rows(0..10, 2)]).await;

        let inputs = pick_input_rowsets(&t.tablet.snapshot(), 10);
        let first = CompactionTask::new(t.tablet.clone(), inputs.clone(), RowsetId(3)).unwrap();
        first
            .run(&t.options, t.cache.clone(), &UpdateManager::new(1024))
            .await
            .unwrap();

        let second = CompactionTask::new(t.tablet.clone(), inputs, RowsetId(4)).unwrap();
        let err = second
            .run(&t.options, t.cache.clone(), &UpdateManager::new(1024))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), StorageError::VersionConflict { .. }));
        assert!(!t.tablet.dir().join("4_0.dat").exists());
        assert!(t.tablet.dir().join("3_0.dat").exists());
    }

    #[tokio::test]
    async fn test_reject_gap() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(KeysType::Duplicate)).await;
        let a = t.commit(1, 2, vec![rows(0..10, 1)]).await;
        t.commit(2, 3, vec![rows(0..10, 2)]).await;
        let c = t.commit(3, 4, vec![rows(0..10, 3)]).await;
        let err = CompactionTask::new(t.tablet.clone(), vec![a, c], RowsetId(5)).err().unwrap();
        assert!(matches!(err.kind(), StorageError::InvalidState(_)));
    }
}
