// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use super::{PageIndex, StatisticsBuilder, ZoneMap};
use crate::array::{Array, PrimitiveArray};
use crate::storage::page::{
    seal_page, PageBuilder, PageType, PlainNullablePageBuilder, PlainPrimitivePageBuilder,
    RlePrimitivePageBuilder, PAGE_META_SIZE,
};
use crate::storage::{ColumnBuilderOptions, PrimitiveFixedWidthEncode};

/// All supported page builders for primitive types.
enum PageBuilderImpl<T: PrimitiveFixedWidthEncode> {
    Plain(PlainPrimitivePageBuilder<T>),
    PlainNullable(PlainNullablePageBuilder<T>),
    RunLength(RlePrimitivePageBuilder<T>),
}

impl<T: PrimitiveFixedWidthEncode> PageBuilderImpl<T> {
    fn should_finish(&self, next: &Option<&T>) -> bool {
        match self {
            Self::Plain(builder) => builder.should_finish(next),
            Self::PlainNullable(builder) => builder.should_finish(next),
            Self::RunLength(builder) => builder.should_finish(next),
        }
    }

    fn append(&mut self, item: Option<&T>) {
        match self {
            Self::Plain(builder) => builder.append(item),
            Self::PlainNullable(builder) => builder.append(item),
            Self::RunLength(builder) => builder.append(item),
        }
    }

    fn finish(self) -> (PageType, Vec<u8>) {
        match self {
            Self::Plain(builder) => (PageType::Plain, builder.finish()),
            Self::PlainNullable(builder) => (PageType::PlainNullable, builder.finish()),
            Self::RunLength(builder) => (PageType::RunLength, builder.finish()),
        }
    }
}

pub type I32ColumnBuilder = PrimitiveColumnBuilder<i32>;
pub type I64ColumnBuilder = PrimitiveColumnBuilder<i64>;
pub type F64ColumnBuilder = PrimitiveColumnBuilder<f64>;
pub type BoolColumnBuilder = PrimitiveColumnBuilder<bool>;

/// Column builder of primitive types.
pub struct PrimitiveColumnBuilder<T: PrimitiveFixedWidthEncode> {
    data: Vec<u8>,
    index: Vec<PageIndex>,
    zone_map: ZoneMap,
    options: ColumnBuilderOptions,

    /// Current page builder and its statistics
    current: Option<(PageBuilderImpl<T>, StatisticsBuilder<T>)>,

    /// Count of rows which has been sent to builder
    row_count: u64,

    /// Indicates whether the current column accepts null elements
    nullable: bool,
}

impl<T: PrimitiveFixedWidthEncode> PrimitiveColumnBuilder<T> {
    pub fn new(nullable: bool, options: ColumnBuilderOptions) -> Self {
        Self {
            data: vec![],
            index: vec![],
            zone_map: ZoneMap::default(),
            options,
            current: None,
            row_count: 0,
            nullable,
        }
    }

    fn new_page_builder(&self) -> PageBuilderImpl<T> {
        let target_size = self.options.target_page_size.saturating_sub(PAGE_META_SIZE);
        if self.options.is_rle {
            PageBuilderImpl::RunLength(RlePrimitivePageBuilder::new(target_size))
        } else if self.nullable {
            PageBuilderImpl::PlainNullable(PlainNullablePageBuilder::new(target_size))
        } else {
            PageBuilderImpl::Plain(PlainPrimitivePageBuilder::new(target_size))
        }
    }

    fn finish_page(&mut self) {
        let Some((builder, stats)) = self.current.take() else {
            return;
        };
        let first_ordinal = self.row_count - stats.row_count();
        let (page_type, page_data) = builder.finish();
        let page = seal_page(page_data, page_type, self.options.checksum_type);
        let zone_map = stats.finish(T::to_value);

        self.index.push(PageIndex {
            offset: self.data.len() as u64,
            length: page.len() as u64,
            first_ordinal,
            row_count: zone_map.row_count,
            min: zone_map.min.clone(),
            max: zone_map.max.clone(),
            null_count: zone_map.null_count,
        });
        self.zone_map.merge(&zone_map);
        self.data.extend(page);
    }

    /// Append an array to the column. The builder will automatically chunk it into pages.
    pub fn append(&mut self, array: &PrimitiveArray<T>) {
        for item in array.iter() {
            if matches!(&self.current, Some((builder, _)) if builder.should_finish(&item)) {
                self.finish_page();
            }
            if self.current.is_none() {
                self.current = Some((self.new_page_builder(), StatisticsBuilder::default()));
            }
            if let Some((builder, stats)) = &mut self.current {
                builder.append(item);
                stats.add(item, |v: &T| *v);
            }
            self.row_count += 1;
        }
    }

    /// Finish the column, return page index information, zone map and encoded page data.
    pub fn finish(mut self) -> (Vec<PageIndex>, ZoneMap, Vec<u8>) {
        self.finish_page();
        (self.index, self.zone_map, self.data)
    }
}
