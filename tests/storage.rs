// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! End-to-end tests of the storage engine through its public API.

use std::sync::Arc;

use olapstore::array::DataChunk;
use olapstore::catalog::{AggregationKind, KeysType, TabletColumn, TabletSchema};
use olapstore::storage::iterator::collect_chunks;
use olapstore::storage::{
    RowsetRef, RowsetWriterType, StorageEngine, StorageOptions, TabletReaderParams, Version,
};
use olapstore::types::{DataType, DataValue, Row, TabletId};
use tempfile::TempDir;
use test_case::test_case;

fn schema(keys_type: KeysType) -> TabletSchema {
    let (v1, v2) = match keys_type {
        KeysType::Aggregate => (AggregationKind::Sum, AggregationKind::Replace),
        _ => (AggregationKind::None, AggregationKind::None),
    };
    TabletSchema::new(
        1,
        keys_type,
        vec![
            TabletColumn::new(0, "k1", DataType::Int32).key(),
            TabletColumn::new(1, "k2", DataType::Int32).key(),
            TabletColumn::new(2, "v1", DataType::Int64).with_aggregation(v1),
            TabletColumn::new(3, "v2", DataType::String)
                .nullable()
                .with_aggregation(v2),
        ],
        1,
    )
    .unwrap()
}

fn row(k: i32, v: i64) -> Row {
    let v2 = if k % 7 == 0 {
        DataValue::Null
    } else {
        DataValue::String(format!("v{k}"))
    };
    vec![DataValue::Int32(k), DataValue::Int32(k), DataValue::Int64(v), v2]
}

fn rows(keys: std::ops::Range<i32>, v: i64) -> Vec<Row> {
    keys.map(|k| row(k, v)).collect()
}

fn chunk(rows: &[Row]) -> DataChunk {
    let types = [DataType::Int32, DataType::Int32, DataType::Int64, DataType::String];
    DataChunk::from_rows(&types, rows.iter().map(|r| r.as_slice()))
}

async fn open(options: impl FnOnce(&mut StorageOptions)) -> (TempDir, Arc<StorageEngine>) {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = StorageOptions::default_for_test(dir.path().to_path_buf());
    options(&mut opts);
    let engine = StorageEngine::open(opts).await.unwrap();
    (dir, Arc::new(engine))
}

/// Write `rows` as one horizontal rowset and commit it at `version`.
async fn write(engine: &StorageEngine, tablet_id: TabletId, version: i64, rows: &[Row]) -> RowsetRef {
    let tablet = engine.get_tablet(tablet_id).unwrap();
    let context = engine.rowset_writer_context(&tablet, Version::single(version));
    let mut writer = engine.new_rowset_writer(context).unwrap();
    for part in rows.chunks(300) {
        writer.add_chunk(&chunk(part)).await.unwrap();
    }
    let rowset = writer.build().await.unwrap();
    engine
        .commit_rowset(tablet_id, version, rowset.clone())
        .await
        .unwrap();
    rowset
}

async fn read(engine: &StorageEngine, tablet_id: TabletId, version: i64) -> Vec<Row> {
    let reader = engine.new_reader(tablet_id, version).unwrap();
    let mut iter = reader
        .new_iterator(&TabletReaderParams {
            sorted: true,
            ..TabletReaderParams::new(512)
        })
        .await
        .unwrap();
    collect_chunks(iter.as_mut())
        .await
        .unwrap()
        .iter()
        .flat_map(|c| c.rows().collect::<Vec<_>>())
        .collect()
}

#[test_case(KeysType::Duplicate)]
#[test_case(KeysType::Aggregate)]
#[test_case(KeysType::Unique)]
#[test_case(KeysType::Primary)]
#[tokio::test]
async fn test_horizontal_round_trip(keys_type: KeysType) {
    let (_dir, engine) = open(|o| o.max_rows_per_segment = 1000).await;
    engine.create_tablet(1, schema(keys_type)).await.unwrap();
    // Unsorted input spanning several segments.
    let mut input = rows(0..2500, 1);
    input.reverse();
    write(&engine, 1, 2, &input).await;
    assert_eq!(read(&engine, 1, 2).await, rows(0..2500, 1));
}

#[tokio::test]
async fn test_vertical_write_matches_horizontal() {
    let (_dir, engine) = open(|o| o.max_rows_per_segment = 700).await;
    engine.create_tablet(1, schema(KeysType::Unique)).await.unwrap();
    engine.create_tablet(2, schema(KeysType::Unique)).await.unwrap();
    let input = rows(0..2000, 3);
    write(&engine, 1, 2, &input).await;

    let tablet = engine.get_tablet(2).unwrap();
    let context = engine
        .rowset_writer_context(&tablet, Version::single(2))
        .with_writer_type(RowsetWriterType::Vertical);
    let mut writer = engine.new_rowset_writer(context).unwrap();
    for (ids, indices, is_key) in [
        (vec![0, 1], vec![0, 1], true),
        (vec![2], vec![2], false),
        (vec![3], vec![3], false),
    ] {
        for part in input.chunks(512) {
            writer
                .add_columns(&chunk(part).project(&indices), &ids, is_key)
                .await
                .unwrap();
        }
        writer.flush_columns().await.unwrap();
    }
    writer.final_flush().await.unwrap();
    let rowset = writer.build().await.unwrap();
    assert_eq!(rowset.num_segments(), 3);
    engine.commit_rowset(2, 2, rowset).await.unwrap();

    assert_eq!(read(&engine, 2, 2).await, read(&engine, 1, 2).await);
}

#[tokio::test]
async fn test_duplicate_compaction_keeps_every_row() {
    let (_dir, engine) = open(|_| {}).await;
    engine.create_tablet(1, schema(KeysType::Duplicate)).await.unwrap();
    let mut total = 0;
    for version in 2..6 {
        let batch = rows(0..(100 * version as i32), version);
        total += batch.len();
        write(&engine, 1, version, &batch).await;
    }
    let output = engine.compact_tablet(1).await.unwrap().unwrap();
    assert_eq!(output.num_rows() as usize, total);
    assert_eq!(read(&engine, 1, 5).await.len(), total);
}

#[tokio::test]
async fn test_aggregate_compaction_sums() {
    let (_dir, engine) = open(|_| {}).await;
    engine.create_tablet(1, schema(KeysType::Aggregate)).await.unwrap();
    write(&engine, 1, 2, &rows(0..100, 1)).await;
    write(&engine, 1, 3, &rows(50..150, 10)).await;
    write(&engine, 1, 4, &rows(0..10, 100)).await;
    engine.compact_tablet(1).await.unwrap().unwrap();

    let result = read(&engine, 1, 4).await;
    assert_eq!(result.len(), 150);
    for r in &result {
        let DataValue::Int32(k) = r[0] else {
            panic!("unexpected key {:?}", r[0]);
        };
        let expected = match k {
            0..=9 => 101,
            10..=49 => 1,
            50..=99 => 11,
            _ => 10,
        };
        assert_eq!(r[2], DataValue::Int64(expected), "key {k}");
    }
}

#[tokio::test]
async fn test_primary_one_row_per_key() {
    let (_dir, engine) = open(|_| {}).await;
    engine.create_tablet(1, schema(KeysType::Primary)).await.unwrap();
    write(&engine, 1, 2, &rows(0..1024, 1)).await;
    let second = write(&engine, 1, 3, &rows(512..1536, 2)).await;

    let expected = (0..1536)
        .map(|k| row(k, if k < 512 { 1 } else { 2 }))
        .collect::<Vec<_>>();
    assert_eq!(read(&engine, 1, 3).await, expected);

    // Applying the same rowset again changes nothing.
    let tablet = engine.get_tablet(1).unwrap();
    let delvecs = tablet.snapshot().delvecs.to_entries();
    engine
        .update_manager()
        .on_rowset_finished(&tablet, &second)
        .await
        .unwrap();
    assert_eq!(tablet.snapshot().delvecs.to_entries(), delvecs);
    assert_eq!(read(&engine, 1, 3).await, expected);

    // Compaction keeps the latest values.
    let output = engine.compact_tablet(1).await.unwrap().unwrap();
    assert_eq!(output.num_rows(), 1536);
    assert_eq!(read(&engine, 1, 3).await, expected);
    let index = engine.update_manager().index(1);
    let index = index.lock().await;
    assert_eq!(index.len(), 1536);
    assert_eq!(
        index.get(&[DataValue::Int32(100), DataValue::Int32(100)]).map(|l| l.rowset_id),
        Some(output.id())
    );
}

#[tokio::test]
async fn test_primary_compaction_with_later_update() {
    let (_dir, engine) = open(|_| {}).await;
    engine.create_tablet(1, schema(KeysType::Primary)).await.unwrap();
    write(&engine, 1, 2, &rows(0..100, 1)).await;
    write(&engine, 1, 3, &rows(50..100, 2)).await;
    write(&engine, 1, 4, &rows(0..10, 3)).await;

    // Compact only versions 2 and 3; keys 0..10 moved to version 4 meanwhile.
    let tablet = engine.get_tablet(1).unwrap();
    let inputs = tablet.rowsets()[1..3].to_vec();
    let task = olapstore::storage::compaction::CompactionTask::new(
        tablet.clone(),
        inputs,
        engine.next_rowset_id(),
    )
    .unwrap();
    let output = task
        .run(
            engine.options(),
            engine.page_cache().clone(),
            engine.update_manager(),
        )
        .await
        .unwrap();
    let dv = tablet.snapshot().delvecs.latest(output.id(), 0).unwrap();
    assert_eq!(dv.len(), 10);

    let result = read(&engine, 1, 4).await;
    assert_eq!(result.len(), 100);
    assert_eq!(result[5], row(5, 3));
    assert_eq!(result[60], row(60, 2));
    assert_eq!(result[20], row(20, 1));
}

#[tokio::test]
async fn test_reader_survives_compaction() {
    let (_dir, engine) = open(|_| {}).await;
    engine.create_tablet(1, schema(KeysType::Unique)).await.unwrap();
    write(&engine, 1, 2, &rows(0..1024, 1)).await;
    write(&engine, 1, 3, &rows(512..1536, 2)).await;

    let reader = engine.new_reader(1, 3).unwrap();
    engine.compact_tablet(1).await.unwrap().unwrap();
    assert_eq!(engine.vacuum().await.unwrap(), 0);

    let mut iter = reader
        .new_iterator(&TabletReaderParams::new(256))
        .await
        .unwrap();
    let result: Vec<Row> = collect_chunks(iter.as_mut())
        .await
        .unwrap()
        .iter()
        .flat_map(|c| c.rows().collect::<Vec<_>>())
        .collect();
    assert_eq!(result.len(), 1536);
    assert_eq!(result[600], row(600, 2));
    drop(iter);
    drop(reader);

    assert_eq!(engine.vacuum().await.unwrap(), 2);
    assert_eq!(read(&engine, 1, 3).await.len(), 1536);
}

#[tokio::test]
async fn test_version_path() {
    let (_dir, engine) = open(|_| {}).await;
    engine.create_tablet(1, schema(KeysType::Unique)).await.unwrap();
    for version in 2..5 {
        write(&engine, 1, version, &rows(0..10, version)).await;
    }
    engine.compact_tablet(1).await.unwrap().unwrap();
    let tablet = engine.get_tablet(1).unwrap();

    // Stale rowsets still serve versions inside the compacted range.
    let path = tablet.capture_consistent_rowsets(3).unwrap();
    assert_eq!(
        path.iter().map(|rs| rs.version()).collect::<Vec<_>>(),
        vec![Version::new(0, 1), Version::single(2), Version::single(3)]
    );
    drop(path);
    assert_eq!(read(&engine, 1, 3).await, rows(0..10, 3));

    assert_eq!(engine.vacuum().await.unwrap(), 3);
    assert!(tablet.capture_consistent_rowsets(3).is_err());
    assert_eq!(read(&engine, 1, 4).await, rows(0..10, 4));
}

#[tokio::test]
async fn test_reopen_engine() {
    let dir = tempfile::tempdir().unwrap();
    let options = StorageOptions::default_for_test(dir.path().to_path_buf());
    {
        let engine = StorageEngine::open(options.clone()).await.unwrap();
        engine.create_tablet(1, schema(KeysType::Primary)).await.unwrap();
        engine.create_tablet(2, schema(KeysType::Aggregate)).await.unwrap();
        write(&engine, 1, 2, &rows(0..100, 1)).await;
        write(&engine, 1, 3, &rows(50..150, 2)).await;
        write(&engine, 2, 2, &rows(0..10, 1)).await;
        write(&engine, 2, 3, &rows(0..10, 1)).await;
        engine.compact_tablet(2).await.unwrap().unwrap();
    }

    let engine = StorageEngine::open(options).await.unwrap();
    assert_eq!(engine.tablets().len(), 2);
    assert_eq!(read(&engine, 2, 3).await, rows(0..10, 2));
    write(&engine, 1, 4, &rows(0..60, 3)).await;
    let result = read(&engine, 1, 4).await;
    assert_eq!(result.len(), 150);
    assert_eq!(result[55], row(55, 3));
    assert_eq!(result[70], row(70, 2));
}
