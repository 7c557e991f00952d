// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! The storage engine context: tablets, caches, id generation and the background compactor.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::oneshot::Sender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::compaction::{pick_input_rowsets, CompactionTask, Compactor};
use super::page::PageCache;
use super::segment::parse_segment_file_name;
use super::tablet::{Tablet, TABLET_META_FILE, TABLET_META_TEMP_FILE};
use super::tablet_reader::TabletReader;
use super::update_manager::UpdateManager;
use super::{
    RowsetId, RowsetRef, RowsetWriter, RowsetWriterContext, StorageOptions, StorageResult,
    TracedStorageError, Version,
};
use crate::catalog::{KeysType, TabletSchema};
use crate::types::TabletId;

const TABLETS_DIR: &str = "tablets";

/// Owns every tablet of one storage directory.
pub struct StorageEngine {
    options: Arc<StorageOptions>,

    tablets: RwLock<HashMap<TabletId, Arc<Tablet>>>,

    /// Page cache shared by all segments
    page_cache: PageCache,

    update_manager: UpdateManager,

    /// Next rowset id. Rowset ids are unique across tablets.
    next_rowset_id: AtomicU64,

    /// Compactor handler used to stop the compactor
    #[allow(clippy::type_complexity)]
    compactor_handler: Mutex<(Option<Sender<()>>, Option<JoinHandle<StorageResult<()>>>)>,
}

impl StorageEngine {
    /// Open the engine at `options.path`, loading every tablet found there.
    ///
    /// Segment files no tablet references, left by writers that never finished, are
    /// removed.
    pub async fn open(options: StorageOptions) -> StorageResult<Self> {
        let tablets_dir = options.path.join(TABLETS_DIR);
        tokio::fs::create_dir_all(&tablets_dir).await?;
        let page_cache = PageCache::new(options.page_cache_capacity);

        let mut tablets = HashMap::new();
        let mut max_rowset_id = 0;
        let mut entries = tokio::fs::read_dir(&tablets_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            if !tokio::fs::try_exists(dir.join(TABLET_META_FILE)).await? {
                continue;
            }
            let tablet = Tablet::open(&dir, &options, page_cache.clone()).await?;
            let referenced: HashSet<RowsetId> =
                tablet.referenced_rowset_ids().into_iter().collect();
            max_rowset_id = referenced.iter().map(|id| id.0).fold(max_rowset_id, u64::max);
            remove_orphan_files(&tablet, &referenced).await?;
            tablets.insert(tablet.tablet_id(), Arc::new(tablet));
        }
        info!(
            path = %options.path.display(),
            num_tablets = tablets.len(),
            "storage engine opened"
        );

        Ok(Self {
            update_manager: UpdateManager::new(options.chunk_size),
            options: Arc::new(options),
            tablets: RwLock::new(tablets),
            page_cache,
            next_rowset_id: AtomicU64::new(max_rowset_id + 1),
            compactor_handler: Mutex::new((None, None)),
        })
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    pub fn update_manager(&self) -> &UpdateManager {
        &self.update_manager
    }

    fn tablet_dir(&self, tablet_id: TabletId) -> PathBuf {
        self.options
            .path
            .join(TABLETS_DIR)
            .join(tablet_id.to_string())
    }

    pub async fn create_tablet(
        &self,
        tablet_id: TabletId,
        schema: TabletSchema,
    ) -> StorageResult<Arc<Tablet>> {
        if self.tablets.read().contains_key(&tablet_id) {
            return Err(TracedStorageError::duplicated("tablet", tablet_id));
        }
        let tablet = Tablet::create(
            tablet_id,
            Arc::new(schema),
            self.tablet_dir(tablet_id),
            &self.options,
            self.page_cache.clone(),
        )
        .await?;
        let tablet = Arc::new(tablet);
        let mut tablets = self.tablets.write();
        if tablets.contains_key(&tablet_id) {
            return Err(TracedStorageError::duplicated("tablet", tablet_id));
        }
        tablets.insert(tablet_id, tablet.clone());
        Ok(tablet)
    }

    pub fn get_tablet(&self, tablet_id: TabletId) -> StorageResult<Arc<Tablet>> {
        self.tablets
            .read()
            .get(&tablet_id)
            .cloned()
            .ok_or_else(|| TracedStorageError::not_found("tablet", tablet_id))
    }

    pub fn tablets(&self) -> Vec<Arc<Tablet>> {
        self.tablets.read().values().cloned().collect()
    }

    /// Remove a tablet and its directory. Readers already holding the tablet keep working
    /// until their files are gone.
    pub async fn drop_tablet(&self, tablet_id: TabletId) -> StorageResult<()> {
        let tablet = self
            .tablets
            .write()
            .remove(&tablet_id)
            .ok_or_else(|| TracedStorageError::not_found("tablet", tablet_id))?;
        // Wait for a running compaction of the tablet.
        let _guard = tablet.lock_compaction().await;
        self.update_manager.remove_tablet(tablet_id);
        tokio::fs::remove_dir_all(tablet.dir()).await?;
        info!(tablet_id, "tablet dropped");
        Ok(())
    }

    pub fn next_rowset_id(&self) -> RowsetId {
        RowsetId(self.next_rowset_id.fetch_add(1, Ordering::SeqCst))
    }

    /// A writer context for a new rowset of `tablet` at `version`.
    pub fn rowset_writer_context(&self, tablet: &Tablet, version: Version) -> RowsetWriterContext {
        RowsetWriterContext::new(
            self.next_rowset_id(),
            tablet.tablet_id(),
            tablet.schema().clone(),
            tablet.dir(),
            version,
        )
    }

    pub fn new_rowset_writer(&self, context: RowsetWriterContext) -> StorageResult<RowsetWriter> {
        RowsetWriter::new(context, &self.options, self.page_cache.clone())
    }

    /// Make `rowset` visible at `version`. The primary index of a PRIMARY tablet is updated
    /// before this returns.
    pub async fn commit_rowset(
        &self,
        tablet_id: TabletId,
        version: i64,
        rowset: RowsetRef,
    ) -> StorageResult<()> {
        let tablet = self.get_tablet(tablet_id)?;
        if tablet.schema().keys_type() == KeysType::Primary {
            self.update_manager
                .commit_rowset(&tablet, version, rowset)
                .await
        } else {
            tablet.rowset_commit(version, rowset).await
        }
    }

    /// A prepared reader of `tablet_id` at `version`.
    pub fn new_reader(&self, tablet_id: TabletId, version: i64) -> StorageResult<TabletReader> {
        let mut reader = TabletReader::new(self.get_tablet(tablet_id)?, version);
        reader.prepare()?;
        Ok(reader)
    }

    /// Run one compaction of `tablet_id` now. Returns the output, or `None` when there is
    /// nothing to compact.
    pub async fn compact_tablet(&self, tablet_id: TabletId) -> StorageResult<Option<RowsetRef>> {
        let tablet = self.get_tablet(tablet_id)?;
        let _guard = tablet.lock_compaction().await;
        self.compact_locked(&tablet).await
    }

    /// Compact `tablet`, whose compaction lock is held by the caller.
    pub(crate) async fn compact_locked(
        &self,
        tablet: &Arc<Tablet>,
    ) -> StorageResult<Option<RowsetRef>> {
        let inputs = pick_input_rowsets(
            &tablet.snapshot(),
            self.options.max_compaction_input_rowsets,
        );
        if inputs.is_empty() {
            return Ok(None);
        }
        let task = CompactionTask::new(tablet.clone(), inputs, self.next_rowset_id())?;
        let output = task
            .run(&self.options, self.page_cache.clone(), &self.update_manager)
            .await?;
        Ok(Some(output))
    }

    /// Remove stale rowsets of every tablet. Returns how many were removed.
    pub async fn vacuum(&self) -> StorageResult<usize> {
        let mut removed = 0;
        for tablet in self.tablets() {
            removed += tablet.vacuum().await?;
        }
        Ok(removed)
    }

    /// Start the background compactor.
    pub async fn spawn_compactor(self: &Arc<Self>) -> StorageResult<()> {
        let mut handler = self.compactor_handler.lock().await;
        if handler.1.is_some() {
            return Err(TracedStorageError::invalid_state("compactor is running"));
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let compactor = Compactor::new(self.clone(), rx);
        *handler = (Some(tx), Some(tokio::spawn(compactor.run())));
        info!("compactor started");
        Ok(())
    }

    /// Stop the background compactor, waiting for the running round to finish.
    pub async fn shutdown(&self) -> StorageResult<()> {
        let mut handler = self.compactor_handler.lock().await;
        let (Some(stop), Some(handle)) = (handler.0.take(), handler.1.take()) else {
            return Ok(());
        };
        info!("shutting down compactor");
        // The compactor may already have exited.
        let _ = stop.send(());
        handle.await??;
        Ok(())
    }
}

/// Remove segment files of rowsets `tablet` does not reference, and leftovers of
/// interrupted final merges and meta writes.
async fn remove_orphan_files(tablet: &Tablet, referenced: &HashSet<RowsetId>) -> StorageResult<()> {
    let mut entries = tokio::fs::read_dir(tablet.dir()).await?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let orphan = name == TABLET_META_TEMP_FILE
            || name.ends_with(".tmp")
            || parse_segment_file_name(&name)
                .map_or(false, |(rowset_id, _)| !referenced.contains(&RowsetId(rowset_id)));
        if orphan {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    if removed > 0 {
        warn!(tablet_id = tablet.tablet_id(), removed, "orphan files removed");
    }
    Ok(())
}
