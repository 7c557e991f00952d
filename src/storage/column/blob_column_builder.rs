// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use super::{PageIndex, StatisticsBuilder, ZoneMap};
use crate::array::{Array, Utf8Array};
use crate::storage::page::{seal_page, BlobPageBuilder, PageBuilder, PageType, PAGE_META_SIZE};
use crate::storage::ColumnBuilderOptions;
use crate::types::DataValue;

/// Column builder of strings. Every page is a blob page.
pub struct BlobColumnBuilder {
    data: Vec<u8>,
    index: Vec<PageIndex>,
    zone_map: ZoneMap,
    options: ColumnBuilderOptions,
    current: Option<(BlobPageBuilder, StatisticsBuilder<String>)>,
    row_count: u64,
}

impl BlobColumnBuilder {
    pub fn new(options: ColumnBuilderOptions) -> Self {
        Self {
            data: vec![],
            index: vec![],
            zone_map: ZoneMap::default(),
            options,
            current: None,
            row_count: 0,
        }
    }

    fn finish_page(&mut self) {
        let Some((builder, stats)) = self.current.take() else {
            return;
        };
        let first_ordinal = self.row_count - stats.row_count();
        let page = seal_page(builder.finish(), PageType::Blob, self.options.checksum_type);
        let zone_map = stats.finish(DataValue::String);

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

    pub fn append(&mut self, array: &Utf8Array) {
        for item in array.iter() {
            if matches!(&self.current, Some((builder, _)) if builder.should_finish(&item)) {
                self.finish_page();
            }
            let (builder, stats) = self.current.get_or_insert_with(|| {
                let target_size = self.options.target_page_size.saturating_sub(PAGE_META_SIZE);
                (BlobPageBuilder::new(target_size), StatisticsBuilder::default())
            });
            builder.append(item);
            stats.add(item, |v: &str| v.to_string());
            self.row_count += 1;
        }
    }

    pub fn finish(mut self) -> (Vec<PageIndex>, ZoneMap, Vec<u8>) {
        self.finish_page();
        (self.index, self.zone_map, self.data)
    }
}
