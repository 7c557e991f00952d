// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use async_trait::async_trait;

use super::{BoxedChunkIterator, ChunkIterator};
use crate::array::DataChunk;
use crate::catalog::TabletSchemaRef;
use crate::storage::segment::ColumnPredicate;
use crate::storage::{StorageError, StorageResult, TracedStorageError};

/// [`FilterIterator`] drops rows that do not match every predicate.
///
/// Used for predicates on value columns of tables whose rows are reconciled, where the
/// predicate must see the reconciled value.
pub struct FilterIterator {
    inner: BoxedChunkIterator,
    predicates: Vec<(usize, ColumnPredicate)>,
}

impl FilterIterator {
    pub fn new(inner: BoxedChunkIterator, predicates: Vec<ColumnPredicate>) -> StorageResult<Self> {
        let schema = inner.schema().clone();
        let predicates = predicates
            .into_iter()
            .map(|p| {
                let idx = schema
                    .column_index(p.column_id)
                    .ok_or(StorageError::InvalidColumn(p.column_id))?;
                let ty = schema.column(idx).data_type();
                if !p.applies_to(ty) {
                    return Err(TracedStorageError::schema_mismatch(format!(
                        "predicate {p} on {ty} column"
                    )));
                }
                Ok((idx, p))
            })
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Self { inner, predicates })
    }
}

#[async_trait]
impl ChunkIterator for FilterIterator {
    fn schema(&self) -> &TabletSchemaRef {
        self.inner.schema()
    }

    async fn next_batch(&mut self) -> StorageResult<Option<DataChunk>> {
        while let Some(chunk) = self.inner.next_batch().await? {
            let mut visibility = vec![true; chunk.cardinality()];
            for (idx, predicate) in &self.predicates {
                predicate.filter(chunk.array_at(*idx), &mut visibility);
            }
            let chunk = chunk.filter(&visibility);
            if !chunk.is_empty() {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::KeysType;
    use crate::storage::iterator::test_util::*;
    use crate::storage::segment::CompareOp;

    #[tokio::test]
    async fn test_filter() {
        let schema = kv_schema(KeysType::Unique);
        let inner = MockIterator::boxed(
            schema,
            vec![vec![kv(1, 10), kv(2, 20)], vec![kv(3, 5)], vec![kv(4, 30)]],
        );
        let mut iter =
            FilterIterator::new(inner, vec![ColumnPredicate::new(1, CompareOp::Ge, 10i64)]).unwrap();
        assert_eq!(collect_rows(&mut iter).await, vec![kv(1, 10), kv(2, 20), kv(4, 30)]);

        let inner = MockIterator::boxed(kv_schema(KeysType::Unique), vec![]);
        assert!(FilterIterator::new(inner, vec![ColumnPredicate::new(1, CompareOp::Ge, 10)]).is_err());
    }
}
