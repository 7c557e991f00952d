// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::path::Path;
use std::sync::Arc;

use super::page::PageCache;
use super::tablet::Tablet;
use super::{RowsetId, RowsetRef, RowsetWriter, RowsetWriterContext, StorageOptions, Version};
use crate::array::DataChunk;
use crate::catalog::TabletSchemaRef;
use crate::types::Row;

pub struct TestTablet {
    pub tablet: Arc<Tablet>,
    pub options: StorageOptions,
    pub cache: PageCache,
}

impl TestTablet {
    pub async fn create(dir: &Path, schema: TabletSchemaRef) -> Self {
        let options = StorageOptions::default_for_test(dir.to_path_buf());
        let cache = PageCache::new(options.page_cache_capacity);
        let tablet = Tablet::create(1, schema, dir.join("1"), &options, cache.clone())
            .await
            .unwrap();
        Self {
            tablet: Arc::new(tablet),
            options,
            cache,
        }
    }

    /// Build a rowset with one flush per batch.
    pub async fn write(&self, rowset_id: u64, version: i64, batches: Vec<Vec<Row>>) -> RowsetRef {
        let schema = self.tablet.schema();
        let context = RowsetWriterContext::new(
            RowsetId(rowset_id),
            self.tablet.tablet_id(),
            schema.clone(),
            self.tablet.dir(),
            Version::single(version),
        );
        let mut writer = RowsetWriter::new(context, &self.options, self.cache.clone()).unwrap();
        for rows in batches {
            let chunk =
                DataChunk::from_rows(&schema.data_types(), rows.iter().map(|r| r.as_slice()));
            writer.add_chunk(&chunk).await.unwrap();
            writer.flush().await.unwrap();
        }
        writer.build().await.unwrap()
    }

    /// Build a rowset and commit it at its version.
    pub async fn commit(&self, rowset_id: u64, version: i64, batches: Vec<Vec<Row>>) -> RowsetRef {
        let rowset = self.write(rowset_id, version, batches).await;
        self.tablet
            .rowset_commit(version, rowset.clone())
            .await
            .unwrap();
        rowset
    }
}
