// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Column builders and the per-column page index.
//!
//! On the storage format side, a column is composed of multiple pages and an
//! index stored in the segment footer. The type of pages might not be the same.
//! For example, a column could contain several plain pages and several RLE pages.

mod blob_column_builder;
mod primitive_column_builder;
mod statistics;

use serde::{Deserialize, Serialize};

pub use self::blob_column_builder::*;
pub use self::primitive_column_builder::*;
pub use self::statistics::*;
use super::{ColumnBuilderOptions, StorageResult, TracedStorageError};
use crate::array::ArrayImpl;
use crate::catalog::TabletColumn;
use crate::types::{ColumnId, DataType, DataValue};

/// Location and statistics of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageIndex {
    /// Offset of the page in the segment file.
    pub offset: u64,
    pub length: u64,
    /// Row ordinal of the first row in the page.
    pub first_ordinal: u64,
    pub row_count: u64,
    pub min: DataValue,
    pub max: DataValue,
    pub null_count: u64,
}

/// Metadata of a column stored in a segment footer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub unique_id: ColumnId,
    pub data_type: DataType,
    pub is_nullable: bool,
    pub pages: Vec<PageIndex>,
    /// Zone map of the whole column.
    pub zone_map: ZoneMap,
}

impl PageIndex {
    pub fn zone_map(&self) -> ZoneMap {
        ZoneMap {
            min: self.min.clone(),
            max: self.max.clone(),
            null_count: self.null_count,
            row_count: self.row_count,
        }
    }
}

impl ColumnMeta {
    /// Find corresponding page of a row.
    pub fn page_of_row(&self, ordinal: u64) -> usize {
        // x is in page `i` if: first_ordinal[i] <= x < first_ordinal[i + 1]
        // Therefore, we partition the pages by `first_ordinal <= x`, and we can find the page
        // at `partition_point - 1`.
        let pp = self.pages.partition_point(|page| page.first_ordinal <= ordinal);
        pp.saturating_sub(1)
    }

    pub fn num_rows(&self) -> u64 {
        self.pages.iter().map(|p| p.row_count).sum()
    }

    pub fn on_disk_size(&self) -> u64 {
        self.pages.iter().map(|p| p.length).sum()
    }
}

/// Builds a column. [`ColumnBuilderImpl`] will automatically chunk arrays into
/// pages, calls `PageBuilder` to generate a page, and builds the page index.
pub enum ColumnBuilderImpl {
    Bool(PrimitiveColumnBuilder<bool>),
    Int32(PrimitiveColumnBuilder<i32>),
    Int64(PrimitiveColumnBuilder<i64>),
    Float64(PrimitiveColumnBuilder<f64>),
    Utf8(BlobColumnBuilder),
}

impl ColumnBuilderImpl {
    pub fn new(column: &TabletColumn, options: ColumnBuilderOptions) -> Self {
        let nullable = column.is_nullable();
        match column.data_type() {
            DataType::Bool => Self::Bool(PrimitiveColumnBuilder::new(nullable, options)),
            DataType::Int32 => Self::Int32(PrimitiveColumnBuilder::new(nullable, options)),
            DataType::Int64 => Self::Int64(PrimitiveColumnBuilder::new(nullable, options)),
            DataType::Float64 => Self::Float64(PrimitiveColumnBuilder::new(nullable, options)),
            DataType::String => Self::Utf8(BlobColumnBuilder::new(options)),
        }
    }

    /// Append an array to the column.
    pub fn append(&mut self, array: &ArrayImpl) -> StorageResult<()> {
        match (self, array) {
            (Self::Bool(builder), ArrayImpl::Bool(array)) => builder.append(array),
            (Self::Int32(builder), ArrayImpl::Int32(array)) => builder.append(array),
            (Self::Int64(builder), ArrayImpl::Int64(array)) => builder.append(array),
            (Self::Float64(builder), ArrayImpl::Float64(array)) => builder.append(array),
            (Self::Utf8(builder), ArrayImpl::Utf8(array)) => builder.append(array),
            (_, array) => {
                return Err(TracedStorageError::schema_mismatch(format!(
                    "cannot append {} array to column",
                    array.data_type()
                )))
            }
        }
        Ok(())
    }

    /// Finish a column, return page index information, the zone map and encoded page data.
    /// Page offsets are relative to the start of the returned data.
    pub fn finish(self) -> (Vec<PageIndex>, ZoneMap, Vec<u8>) {
        match self {
            Self::Bool(builder) => builder.finish(),
            Self::Int32(builder) => builder.finish(),
            Self::Int64(builder) => builder.finish(),
            Self::Float64(builder) => builder.finish(),
            Self::Utf8(builder) => builder.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_of_row() {
        let page = |first_ordinal| PageIndex {
            offset: 0,
            length: 0,
            first_ordinal,
            row_count: 0,
            min: DataValue::Null,
            max: DataValue::Null,
            null_count: 0,
        };
        let meta = ColumnMeta {
            unique_id: 0,
            data_type: DataType::Int32,
            is_nullable: false,
            pages: vec![page(0), page(233), page(2333)],
            zone_map: ZoneMap::default(),
        };
        assert_eq!(meta.page_of_row(0), 0);
        assert_eq!(meta.page_of_row(232), 0);
        assert_eq!(meta.page_of_row(233), 1);
        assert_eq!(meta.page_of_row(5000), 2);
    }

    #[test]
    fn test_type_mismatch() {
        let column = TabletColumn::new(0, "v", DataType::Int32);
        let mut builder = ColumnBuilderImpl::new(&column, ColumnBuilderOptions::default_for_test());
        let array = ArrayImpl::Int64((0..3).collect());
        assert!(builder.append(&array).is_err());
    }
}
