// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Tablets: the versioned rowset list of one table shard.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use itertools::Itertools;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::page::PageCache;
use super::{
    DeleteVector, DeleteVectorEntry, DeleteVectors, Rowset, RowsetId, RowsetMeta,
    RowsetRef, RowsetState, SegmentsOverlap, StorageError, StorageOptions, StorageResult,
    TracedStorageError, Version,
};
use crate::catalog::{TabletSchema, TabletSchemaRef};
use crate::types::TabletId;

pub const TABLET_META_FILE: &str = "tablet_meta.json";
pub(crate) const TABLET_META_TEMP_FILE: &str = "tablet_meta.json.tmp";

/// Id of the empty rowset every tablet starts with.
pub const INITIAL_ROWSET_ID: RowsetId = RowsetId(0);

/// Persisted form of a tablet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletMeta {
    pub tablet_id: TabletId,
    pub schema: TabletSchema,
    pub max_version: i64,
    pub rowsets: Vec<RowsetMeta>,
    pub stale_rowsets: Vec<RowsetMeta>,
    pub delete_vectors: Vec<DeleteVectorEntry>,
}

/// An immutable snapshot of a tablet. Readers keep the snapshot they captured, so commits
/// and compactions published later never affect them.
#[derive(Debug, Clone)]
pub struct TabletState {
    /// Visible rowsets ordered by version.
    pub rowsets: Vec<RowsetRef>,
    /// Rowsets replaced by compaction, kept until no snapshot references them.
    pub stale: Vec<RowsetRef>,
    pub delvecs: Arc<DeleteVectors>,
    pub max_version: i64,
}

impl TabletState {
    /// Rowsets covering `[0, version]` without gaps, oldest first.
    ///
    /// Compacted rowsets are preferred. Stale rowsets serve versions inside a compacted range
    /// until they are vacuumed.
    pub fn capture_consistent_rowsets(&self, version: i64) -> StorageResult<Vec<RowsetRef>> {
        if version > self.max_version {
            return Err(StorageError::VersionNotFound(version).into());
        }
        let mut path = vec![];
        let mut next = 0;
        while next <= version {
            let best = self
                .rowsets
                .iter()
                .chain(&self.stale)
                .filter(|rs| rs.version().start == next && rs.version().end <= version)
                .max_by_key(|rs| rs.version().end);
            let Some(rowset) = best else {
                return Err(StorageError::VersionNotFound(next).into());
            };
            next = rowset.version().end + 1;
            path.push(rowset.clone());
        }
        Ok(path)
    }

    pub fn rowset(&self, rowset_id: RowsetId) -> Option<&RowsetRef> {
        self.rowsets.iter().find(|rs| rs.id() == rowset_id)
    }

    fn to_meta(&self, tablet_id: TabletId, schema: &TabletSchema) -> TabletMeta {
        TabletMeta {
            tablet_id,
            schema: schema.clone(),
            max_version: self.max_version,
            rowsets: self.rowsets.iter().map(|rs| rs.meta()).collect(),
            stale_rowsets: self.stale.iter().map(|rs| rs.meta()).collect(),
            delete_vectors: self.delvecs.to_entries(),
        }
    }
}

/// A table shard owning an ordered list of rowsets.
///
/// Mutations of the rowset list are serialized by `meta_lock`. Readers load the current
/// [`TabletState`] without locking.
pub struct Tablet {
    tablet_id: TabletId,
    schema: TabletSchemaRef,
    dir: PathBuf,
    state: ArcSwap<TabletState>,
    meta_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    /// Readers capture rowsets under the read side. Vacuum decides what is unused and swaps
    /// the state under the write side.
    pin_lock: RwLock<()>,
    enable_fsync: bool,
}

impl Tablet {
    /// Create the tablet directory with an empty rowset covering versions `[0, 1]`.
    pub async fn create(
        tablet_id: TabletId,
        schema: TabletSchemaRef,
        dir: impl AsRef<Path>,
        options: &StorageOptions,
        page_cache: PageCache,
    ) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        if tokio::fs::try_exists(dir.join(TABLET_META_FILE)).await? {
            return Err(TracedStorageError::duplicated("tablet", tablet_id));
        }
        let initial = RowsetMeta {
            rowset_id: INITIAL_ROWSET_ID,
            tablet_id,
            version: Version::new(0, 1),
            num_rows: 0,
            num_segments: 0,
            total_disk_size: 0,
            schema_id: schema.schema_id(),
            state: RowsetState::Visible,
            segments_overlap: SegmentsOverlap::NonOverlapping,
            referenced_column_ids: None,
            segments: vec![],
            creation_time: 0,
        };
        let initial = Rowset::new(
            initial,
            &dir,
            schema.clone(),
            options.io_backend,
            page_cache,
        )?;
        let state = TabletState {
            rowsets: vec![Arc::new(initial)],
            stale: vec![],
            delvecs: Arc::new(DeleteVectors::default()),
            max_version: 1,
        };
        let tablet = Self {
            tablet_id,
            schema,
            dir,
            state: ArcSwap::from_pointee(state),
            meta_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            pin_lock: RwLock::new(()),
            enable_fsync: options.enable_fsync,
        };
        tablet.persist(&tablet.snapshot()).await?;
        info!(tablet_id, dir = %tablet.dir.display(), "tablet created");
        Ok(tablet)
    }

    /// Load a tablet from its directory.
    pub async fn open(
        dir: impl AsRef<Path>,
        options: &StorageOptions,
        page_cache: PageCache,
    ) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let data = tokio::fs::read(dir.join(TABLET_META_FILE)).await?;
        let meta: TabletMeta = serde_json::from_slice(&data)?;
        let schema = Arc::new(meta.schema);
        let open_rowsets = |metas: Vec<RowsetMeta>| -> StorageResult<Vec<RowsetRef>> {
            metas
                .into_iter()
                .map(|m| {
                    Rowset::new(m, &dir, schema.clone(), options.io_backend, page_cache.clone())
                        .map(Arc::new)
                })
                .collect()
        };
        let mut rowsets = open_rowsets(meta.rowsets)?;
        rowsets.sort_by_key(|rs| rs.version());
        let stale = open_rowsets(meta.stale_rowsets)?;
        let state = TabletState {
            rowsets,
            stale,
            delvecs: Arc::new(DeleteVectors::from_entries(meta.delete_vectors)),
            max_version: meta.max_version,
        };
        debug!(
            tablet_id = meta.tablet_id,
            max_version = state.max_version,
            num_rowsets = state.rowsets.len(),
            "tablet loaded"
        );
        Ok(Self {
            tablet_id: meta.tablet_id,
            schema,
            dir,
            state: ArcSwap::from_pointee(state),
            meta_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            pin_lock: RwLock::new(()),
            enable_fsync: options.enable_fsync,
        })
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn schema(&self) -> &TabletSchemaRef {
        &self.schema
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_version(&self) -> i64 {
        self.state.load().max_version
    }

    /// The current state.
    pub fn snapshot(&self) -> Arc<TabletState> {
        self.state.load_full()
    }

    /// Visible rowsets ordered by version.
    pub fn rowsets(&self) -> Vec<RowsetRef> {
        let _pin = self.pin_lock.read();
        self.state.load().rowsets.clone()
    }

    /// The current state and the rowsets covering `[0, version]` in it.
    ///
    /// The returned rowsets are not vacuumed while they are held, stale ones included.
    pub fn pin(&self, version: i64) -> StorageResult<(Arc<TabletState>, Vec<RowsetRef>)> {
        let _pin = self.pin_lock.read();
        let state = self.snapshot();
        let rowsets = state.capture_consistent_rowsets(version)?;
        Ok((state, rowsets))
    }

    pub fn capture_consistent_rowsets(&self, version: i64) -> StorageResult<Vec<RowsetRef>> {
        Ok(self.pin(version)?.1)
    }

    /// Ids of every rowset the tablet references, stale ones included.
    pub fn referenced_rowset_ids(&self) -> Vec<RowsetId> {
        let state = self.state.load();
        state
            .rowsets
            .iter()
            .chain(&state.stale)
            .map(|rs| rs.id())
            .collect()
    }

    /// Serializes compactions of this tablet.
    pub(crate) async fn lock_compaction(&self) -> MutexGuard<'_, ()> {
        self.compaction_lock.lock().await
    }

    pub(crate) fn try_lock_compaction(&self) -> Option<MutexGuard<'_, ()>> {
        self.compaction_lock.try_lock().ok()
    }

    /// Make `rowset` visible at `version`, which must follow the current max version.
    ///
    /// Committing the same rowset at the same version again does nothing.
    pub async fn rowset_commit(&self, version: i64, rowset: RowsetRef) -> StorageResult<()> {
        let _guard = self.meta_lock.lock().await;
        let state = self.snapshot();
        if let Some(existing) = state.rowsets.iter().find(|rs| rs.version().end == version) {
            if existing.id() == rowset.id() && existing.version() == Version::single(version) {
                debug!(tablet_id = self.tablet_id, version, "rowset already committed");
                return Ok(());
            }
        }
        if version != state.max_version + 1 {
            return Err(StorageError::VersionConflict {
                expected: (state.max_version + 1).to_string(),
                actual: version.to_string(),
            }
            .into());
        }
        if rowset.version() != Version::single(version) {
            return Err(TracedStorageError::invalid_state(format!(
                "rowset {} of version {} committed at version {version}",
                rowset.id(),
                rowset.version()
            )));
        }
        if rowset.schema().schema_id() != self.schema.schema_id() {
            return Err(TracedStorageError::schema_mismatch(format!(
                "rowset schema {} does not match tablet schema {}",
                rowset.schema().schema_id(),
                self.schema.schema_id()
            )));
        }

        let mut new_state = state.as_ref().clone();
        new_state.rowsets.push(rowset.clone());
        new_state.max_version = version;
        rowset.set_state(RowsetState::Visible);
        if let Err(err) = self.persist(&new_state).await {
            rowset.set_state(RowsetState::Committed);
            return Err(err);
        }
        self.state.store(Arc::new(new_state));
        info!(
            tablet_id = self.tablet_id,
            rowset_id = %rowset.id(),
            version,
            num_rows = rowset.num_rows(),
            "rowset committed"
        );
        Ok(())
    }

    /// Replace `inputs` by `output`, moving the inputs to the stale list.
    ///
    /// Fails with `VersionConflict` if any input left the tablet meanwhile. `output_dvs` are
    /// published with the output.
    pub(crate) async fn replace_rowsets(
        &self,
        inputs: &[RowsetRef],
        output: RowsetRef,
        output_dvs: Vec<(u32, DeleteVector)>,
    ) -> StorageResult<()> {
        let _guard = self.meta_lock.lock().await;
        let state = self.snapshot();
        if inputs.iter().any(|input| state.rowset(input.id()).is_none()) {
            return Err(StorageError::VersionConflict {
                expected: inputs.iter().map(|rs| rs.version()).join(","),
                actual: state.rowsets.iter().map(|rs| rs.version()).join(","),
            }
            .into());
        }
        let mut new_state = state.as_ref().clone();
        new_state
            .rowsets
            .retain(|rs| !inputs.iter().any(|input| input.id() == rs.id()));
        new_state.rowsets.push(output.clone());
        new_state.rowsets.sort_by_key(|rs| rs.version());
        new_state.stale.extend(inputs.iter().cloned());
        if !output_dvs.is_empty() {
            let mut delvecs = state.delvecs.as_ref().clone();
            for (segment_id, dv) in output_dvs {
                delvecs.insert(output.id(), segment_id, dv);
            }
            new_state.delvecs = Arc::new(delvecs);
        }

        output.set_state(RowsetState::Visible);
        for input in inputs {
            input.set_state(RowsetState::Discarded);
        }
        if let Err(err) = self.persist(&new_state).await {
            output.set_state(RowsetState::Committed);
            for input in inputs {
                input.set_state(RowsetState::Visible);
            }
            return Err(err);
        }
        self.state.store(Arc::new(new_state));
        Ok(())
    }

    /// Publish delete vectors computed from the current ones.
    pub(crate) async fn update_delvecs(
        &self,
        update: impl FnOnce(&mut DeleteVectors),
    ) -> StorageResult<()> {
        let _guard = self.meta_lock.lock().await;
        let state = self.snapshot();
        let mut delvecs = state.delvecs.as_ref().clone();
        update(&mut delvecs);
        let new_state = TabletState {
            delvecs: Arc::new(delvecs),
            ..state.as_ref().clone()
        };
        self.persist(&new_state).await?;
        self.state.store(Arc::new(new_state));
        Ok(())
    }

    /// Remove stale rowsets nobody has pinned. Returns how many were removed.
    pub async fn vacuum(&self) -> StorageResult<usize> {
        let _guard = self.meta_lock.lock().await;
        let (new_state, removed) = {
            let _pin = self.pin_lock.write();
            let state = self.snapshot();
            // A stale rowset held only by the current state is unpinned.
            let (removed, kept): (Vec<_>, Vec<_>) = state
                .stale
                .iter()
                .cloned()
                .partition(|rs| Arc::strong_count(rs) == 2);
            if removed.is_empty() {
                return Ok(0);
            }
            let mut delvecs = state.delvecs.as_ref().clone();
            for rowset in &removed {
                delvecs.remove_rowset(rowset.id());
            }
            let new_state = Arc::new(TabletState {
                stale: kept,
                delvecs: Arc::new(delvecs),
                ..state.as_ref().clone()
            });
            self.state.store(new_state.clone());
            (new_state, removed)
        };
        // The meta on disk may list the removed rowsets as stale until this succeeds, and
        // their files are kept in that case.
        self.persist(&new_state).await?;
        for rowset in &removed {
            rowset.remove_files().await?;
            info!(
                tablet_id = self.tablet_id,
                rowset_id = %rowset.id(),
                version = %rowset.version(),
                "stale rowset vacuumed"
            );
        }
        Ok(removed.len())
    }

    /// Write the tablet meta to a temporary file and rename it over the current one.
    async fn persist(&self, state: &TabletState) -> StorageResult<()> {
        let meta = state.to_meta(self.tablet_id, &self.schema);
        let data = serde_json::to_vec_pretty(&meta)?;
        let temp = self.dir.join(TABLET_META_TEMP_FILE);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .await?;
        file.write_all(&data).await?;
        file.flush().await?;
        if self.enable_fsync {
            file.sync_all().await?;
        }
        drop(file);
        tokio::fs::rename(&temp, self.dir.join(TABLET_META_FILE)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Tablet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load();
        f.debug_struct("Tablet")
            .field("tablet_id", &self.tablet_id)
            .field("max_version", &state.max_version)
            .field("rowsets", &state.rowsets)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::KeysType;
    use crate::storage::compaction::{pick_input_rowsets, CompactionTask};
    use crate::storage::iterator::test_util::{collect_rows, kv, kv_schema};
    use crate::storage::test_util::TestTablet;
    use crate::storage::{RowsetReadOptions, UpdateManager};

    async fn compacted_tablet(dir: &Path) -> TestTablet {
        let t = TestTablet::create(dir, kv_schema(KeysType::Unique)).await;
        for version in 2..5 {
            t.commit(version as u64 - 1, version, vec![vec![kv(1, version)]])
                .await;
        }
        let inputs = pick_input_rowsets(&t.tablet.snapshot(), 10);
        let task = CompactionTask::new(t.tablet.clone(), inputs, RowsetId(4)).unwrap();
        task.run(&t.options, t.cache.clone(), &UpdateManager::new(1024))
            .await
            .unwrap();
        t
    }

    #[tokio::test]
    async fn test_vacuum_keeps_pinned_rowsets() {
        let dir = tempfile::tempdir().unwrap();
        let t = compacted_tablet(dir.path()).await;
        assert_eq!(t.tablet.snapshot().stale.len(), 3);

        // Version 3 lies inside the compacted range, so it is served by stale rowsets.
        let (state, pinned) = t.tablet.pin(3).unwrap();
        assert_eq!(
            pinned.iter().map(|rs| rs.id()).collect::<Vec<_>>(),
            vec![INITIAL_ROWSET_ID, RowsetId(1), RowsetId(2)]
        );
        assert_eq!(t.tablet.vacuum().await.unwrap(), 1);
        assert!(!t.tablet.dir().join("3_0.dat").exists());
        assert!(t.tablet.dir().join("2_0.dat").exists());

        let latest = pinned.last().unwrap();
        let options = RowsetReadOptions {
            delvecs: Some(state.delvecs.clone()),
            ..RowsetReadOptions::new(3, 1024)
        };
        let mut iter = latest.new_iterator(latest.schema(), &options).await.unwrap();
        assert_eq!(collect_rows(iter.as_mut()).await, vec![kv(1, 3)]);
        drop(iter);

        drop(pinned);
        drop(state);
        assert_eq!(t.tablet.vacuum().await.unwrap(), 2);
        assert!(t.tablet.snapshot().stale.is_empty());
        assert!(t.tablet.pin(3).is_err());
        assert!(!t.tablet.dir().join("2_0.dat").exists());
    }

    #[tokio::test]
    async fn test_vacuum_keeps_rowsets_of_old_states() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestTablet::create(dir.path(), kv_schema(KeysType::Unique)).await;
        t.commit(1, 2, vec![vec![kv(1, 2)]]).await;
        t.commit(2, 3, vec![vec![kv(1, 3)]]).await;
        let before = t.tablet.snapshot();
        let inputs = pick_input_rowsets(&before, 10);
        let task = CompactionTask::new(t.tablet.clone(), inputs, RowsetId(3)).unwrap();
        task.run(&t.options, t.cache.clone(), &UpdateManager::new(1024))
            .await
            .unwrap();

        assert_eq!(t.tablet.vacuum().await.unwrap(), 0);
        drop(before);
        assert_eq!(t.tablet.vacuum().await.unwrap(), 2);
    }
}
