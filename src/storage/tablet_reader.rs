// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use itertools::Itertools;

use super::iterator::{
    AggregateIterator, BoxedChunkIterator, EmptyIterator, FilterIterator, MergeIterator,
    ProjectIterator, UnionIterator,
};
use super::segment::{ColumnPredicate, KeyRange};
use super::tablet::{Tablet, TabletState};
use super::{RowsetReadOptions, RowsetRef, SegmentsOverlap, StorageResult, TracedStorageError};
use crate::catalog::{KeysType, TabletSchemaRef};
use crate::types::ColumnId;

/// What a [`TabletReader`] scans.
#[derive(Debug, Clone)]
pub struct TabletReaderParams {
    /// Output columns, in order. All columns of the tablet if `None`.
    pub projection: Option<Vec<ColumnId>>,
    pub predicates: Vec<ColumnPredicate>,
    pub key_range: KeyRange,
    /// Whether rows must come out in key order. Reads of tables that reconcile keys are
    /// always sorted.
    pub sorted: bool,
    pub chunk_size: usize,
}

impl TabletReaderParams {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            projection: None,
            predicates: vec![],
            key_range: KeyRange::default(),
            sorted: false,
            chunk_size,
        }
    }
}

/// Reads a tablet as of one version.
///
/// [`TabletReader::prepare`] captures the rowsets and delete vectors of that version. Later
/// commits and compactions do not affect a prepared reader, and the rowsets it holds are
/// not vacuumed until it is dropped.
pub struct TabletReader {
    tablet: Arc<Tablet>,
    version: i64,
    schema: TabletSchemaRef,
    snapshot: Option<(Arc<TabletState>, Vec<RowsetRef>)>,
}

impl TabletReader {
    pub fn new(tablet: Arc<Tablet>, version: i64) -> Self {
        Self {
            schema: tablet.schema().clone(),
            tablet,
            version,
            snapshot: None,
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn schema(&self) -> &TabletSchemaRef {
        &self.schema
    }

    /// Capture the rowsets covering `[0, version]`.
    pub fn prepare(&mut self) -> StorageResult<()> {
        self.snapshot = Some(self.tablet.pin(self.version)?);
        Ok(())
    }

    /// Rowsets read, oldest first.
    pub fn rowsets(&self) -> &[RowsetRef] {
        match &self.snapshot {
            Some((_, rowsets)) => rowsets,
            None => &[],
        }
    }

    fn prepared(&self) -> StorageResult<&(Arc<TabletState>, Vec<RowsetRef>)> {
        self.snapshot
            .as_ref()
            .ok_or_else(|| TracedStorageError::invalid_state("tablet reader is not prepared"))
    }

    /// Columns read from segments: keys, projected columns and predicate columns.
    fn read_schema(&self, params: &TabletReaderParams) -> StorageResult<TabletSchemaRef> {
        let Some(projection) = &params.projection else {
            return Ok(self.schema.clone());
        };
        let ids = projection
            .iter()
            .chain(params.predicates.iter().map(|p| &p.column_id))
            .copied()
            .unique()
            .collect_vec();
        Ok(Arc::new(self.schema.partial(&ids)?))
    }

    /// Split predicates into those evaluated inside segments and those evaluated after
    /// reconciliation.
    ///
    /// A value predicate on a table that reconciles keys must see the reconciled value, so
    /// only key predicates are pushed down for such tables.
    fn split_predicates(
        &self,
        params: &TabletReaderParams,
    ) -> (Vec<ColumnPredicate>, Vec<ColumnPredicate>) {
        if self.schema.keys_type() == KeysType::Duplicate {
            return (params.predicates.clone(), vec![]);
        }
        let key_ids = self.schema.key_column_ids();
        params
            .predicates
            .iter()
            .cloned()
            .partition(|p| key_ids.contains(&p.column_id))
    }

    async fn segment_iterators(
        &self,
        schema: &TabletSchemaRef,
        params: &TabletReaderParams,
        predicates: Vec<ColumnPredicate>,
    ) -> StorageResult<Vec<BoxedChunkIterator>> {
        let (state, rowsets) = self.prepared()?;
        let options = RowsetReadOptions {
            sorted: params.sorted,
            version: self.version,
            predicates,
            key_range: params.key_range.clone(),
            chunk_size: params.chunk_size.max(1),
            delvecs: Some(state.delvecs.clone()),
        };
        let mut iters = vec![];
        for rowset in rowsets {
            iters.extend(rowset.get_segment_iterators(schema, &options).await?);
        }
        Ok(iters)
    }

    /// One iterator per segment of every captured rowset, oldest first, without
    /// reconciliation.
    pub async fn get_segment_iterators(
        &self,
        params: &TabletReaderParams,
    ) -> StorageResult<Vec<BoxedChunkIterator>> {
        let schema = self.read_schema(params)?;
        let (pushed, _) = self.split_predicates(params);
        self.segment_iterators(&schema, params, pushed).await
    }

    /// A scan of the tablet at the reader's version.
    pub async fn new_iterator(
        &self,
        params: &TabletReaderParams,
    ) -> StorageResult<BoxedChunkIterator> {
        let schema = self.read_schema(params)?;
        let (pushed, remaining) = self.split_predicates(params);
        let mut iters = self.segment_iterators(&schema, params, pushed).await?;
        let chunk_size = params.chunk_size.max(1);

        let rowsets = self.rowsets();
        let disjoint = rowsets.iter().filter(|rs| rs.num_segments() > 0).count() <= 1
            && rowsets
                .iter()
                .all(|rs| rs.segments_overlap() == SegmentsOverlap::NonOverlapping);
        let reconcile = schema.need_reconcile() && !disjoint;
        let mut iter: BoxedChunkIterator = match iters.len() {
            0 => Box::new(EmptyIterator::new(schema.clone())),
            1 => iters.remove(0),
            _ if reconcile => {
                let merge = MergeIterator::new(schema.clone(), iters, chunk_size);
                Box::new(AggregateIterator::new(merge, chunk_size))
            }
            _ if params.sorted && !disjoint => {
                Box::new(MergeIterator::new(schema.clone(), iters, chunk_size))
            }
            _ => Box::new(UnionIterator::new(schema.clone(), iters)),
        };
        if !remaining.is_empty() {
            iter = Box::new(FilterIterator::new(iter, remaining)?);
        }
        match &params.projection {
            Some(ids) => ProjectIterator::new_if_needed(iter, ids),
            None => Ok(iter),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::storage::iterator::test_util::{collect_rows, kv, kv_schema};
    use crate::storage::segment::CompareOp;
    use crate::storage::test_util::TestTablet;
    use crate::storage::update_manager::UpdateManager;
    use crate::storage::{RowsetId, RowsetWriter, RowsetWriterContext, StorageError, Version};
    use crate::types::{DataValue, Row};

    fn rows(keys: std::ops::Range<i32>, v: i64) -> Vec<Row> {
        keys.map(|k| kv(k, v)).collect()
    }

    async fn read(tablet: &Arc<Tablet>, version: i64, params: TabletReaderParams) -> Vec<Row> {
        let mut reader = TabletReader::new(tablet.clone(), version);
        reader.prepare().unwrap();
        let mut iter = reader.new_iterator(&params).await.unwrap();
        collect_rows(iter.as_mut()).await
    }

    #[test_case(KeysType::Unique, 10; "unique")]
    #[test_case(KeysType::Aggregate, 10; "aggregate")]
    #[test_case(KeysType::Duplicate, 15; "duplicate")]
    #[tokio::test]
    async fn test_reconcile_across_rowsets(keys_type: KeysType, expected_rows: usize) {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(keys_type)).await;
        t.commit(1, 2, vec![rows(0..10, 5)]).await;
        t.commit(2, 3, vec![rows(0..5, 1)]).await;

        let rows = read(&t.tablet, 3, TabletReaderParams::new(4)).await;
        assert_eq!(rows.len(), expected_rows);
        match keys_type {
            KeysType::Unique => assert_eq!(rows[0], kv(0, 1)),
            KeysType::Aggregate => assert_eq!(rows[0], kv(0, 6)),
            _ => {}
        }
    }

    #[tokio::test]
    async fn test_value_predicate_after_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(KeysType::Unique)).await;
        t.commit(1, 2, vec![rows(0..10, 5)]).await;
        t.commit(2, 3, vec![rows(0..5, 1)]).await;

        let params = TabletReaderParams {
            predicates: vec![ColumnPredicate::new(1, CompareOp::Gt, 3i64)],
            ..TabletReaderParams::new(1024)
        };
        let rows = read(&t.tablet, 3, params).await;
        assert_eq!(rows, (5..10).map(|k| kv(k, 5)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_key_predicate_and_projection() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(KeysType::Unique)).await;
        t.commit(1, 2, vec![rows(0..10, 5)]).await;
        t.commit(2, 3, vec![rows(0..5, 1)]).await;

        let params = TabletReaderParams {
            projection: Some(vec![1]),
            predicates: vec![ColumnPredicate::new(0, CompareOp::Lt, 3i32)],
            ..TabletReaderParams::new(1024)
        };
        let rows = read(&t.tablet, 3, params).await;
        assert_eq!(rows, vec![vec![DataValue::Int64(1)]; 3]);
    }

    #[tokio::test]
    async fn test_read_old_version() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(KeysType::Unique)).await;
        t.commit(1, 2, vec![rows(0..10, 5)]).await;

        let mut reader = TabletReader::new(t.tablet.clone(), 2);
        reader.prepare().unwrap();
        t.commit(2, 3, vec![rows(0..5, 1)]).await;

        let mut iter = reader.new_iterator(&TabletReaderParams::new(1024)).await.unwrap();
        assert_eq!(collect_rows(iter.as_mut()).await, rows(0..10, 5));

        let mut future = TabletReader::new(t.tablet.clone(), 4);
        let err = future.prepare().unwrap_err();
        assert!(matches!(err.kind(), StorageError::VersionNotFound(4)));
    }

    #[tokio::test]
    async fn test_primary_reads_latest() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(KeysType::Primary)).await;
        let manager = UpdateManager::new(1024);
        for (id, version, v) in [(1, 2, 1), (2, 3, 2), (3, 4, 3)] {
            let rowset = t.write(id, version, vec![rows(0..100, v)]).await;
            manager
                .commit_rowset(&t.tablet, version, rowset)
                .await
                .unwrap();
        }
        assert_eq!(read(&t.tablet, 4, TabletReaderParams::new(64)).await, rows(0..100, 3));
        assert_eq!(read(&t.tablet, 3, TabletReaderParams::new(64)).await, rows(0..100, 2));

        // Delete vectors alone leave one live row per key.
        let mut reader = TabletReader::new(t.tablet.clone(), 4);
        reader.prepare().unwrap();
        let mut total = 0;
        for mut iter in reader
            .get_segment_iterators(&TabletReaderParams::new(64))
            .await
            .unwrap()
        {
            total += collect_rows(iter.as_mut()).await.len();
        }
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn test_partial_rowset() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(KeysType::Unique)).await;
        t.commit(1, 2, vec![rows(0..10, 5)]).await;

        let context = RowsetWriterContext::new(
            RowsetId(2),
            1,
            t.tablet.schema().clone(),
            t.tablet.dir(),
            Version::single(3),
        )
        .with_referenced_column_ids(vec![0]);
        let mut writer = RowsetWriter::new(context, &t.options, t.cache.clone()).unwrap();
        let keys = (10..15).map(|k| vec![DataValue::Int32(k)]).collect::<Vec<_>>();
        let chunk = crate::array::DataChunk::from_rows(
            &writer.schema().data_types(),
            keys.iter().map(|r| r.as_slice()),
        );
        writer.add_chunk(&chunk).await.unwrap();
        let rowset = writer.build().await.unwrap();
        assert!(rowset.is_partial());
        t.tablet.rowset_commit(3, rowset).await.unwrap();

        let mut reader = TabletReader::new(t.tablet.clone(), 3);
        reader.prepare().unwrap();
        let err = reader
            .new_iterator(&TabletReaderParams::new(1024))
            .await
            .err()
            .unwrap();
        assert!(matches!(err.kind(), StorageError::InvalidColumn(1)));

        let params = TabletReaderParams {
            projection: Some(vec![0]),
            ..TabletReaderParams::new(1024)
        };
        let mut iter = reader.new_iterator(&params).await.unwrap();
        assert_eq!(collect_rows(iter.as_mut()).await.len(), 15);
    }
}
