// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};

use crate::types::DataValue;

/// Min, max and null count of a range of rows. `min`/`max` are NULL if every row is NULL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneMap {
    pub min: DataValue,
    pub max: DataValue,
    pub null_count: u64,
    pub row_count: u64,
}

impl ZoneMap {
    pub fn merge(&mut self, other: &ZoneMap) {
        self.min = self.min.min_non_null(&other.min);
        self.max = self.max.max_non_null(&other.max);
        self.null_count += other.null_count;
        self.row_count += other.row_count;
    }

    /// Whether every row is NULL.
    pub fn all_null(&self) -> bool {
        self.null_count == self.row_count
    }
}

/// Collects statistics of one page while it is being built.
pub struct StatisticsBuilder<T> {
    min: Option<T>,
    max: Option<T>,
    null_count: u64,
    row_count: u64,
}

impl<T> Default for StatisticsBuilder<T> {
    fn default() -> Self {
        Self {
            min: None,
            max: None,
            null_count: 0,
            row_count: 0,
        }
    }
}

impl<T: PartialOrd> StatisticsBuilder<T> {
    /// Add an item. `to_owned` is only called when the item becomes a new bound.
    pub fn add<B>(&mut self, item: Option<&B>, to_owned: impl Fn(&B) -> T)
    where
        B: ?Sized + PartialOrd,
        T: Borrow<B>,
    {
        self.row_count += 1;
        let Some(item) = item else {
            self.null_count += 1;
            return;
        };
        if self.min.as_ref().map_or(true, |min| item < <T as Borrow<B>>::borrow(min)) {
            self.min = Some(to_owned(item));
        }
        if self.max.as_ref().map_or(true, |max| item > <T as Borrow<B>>::borrow(max)) {
            self.max = Some(to_owned(item));
        }
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn finish(self, to_value: impl Fn(T) -> DataValue) -> ZoneMap {
        ZoneMap {
            min: self.min.map_or(DataValue::Null, &to_value),
            max: self.max.map_or(DataValue::Null, &to_value),
            null_count: self.null_count,
            row_count: self.row_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics() {
        let mut builder = StatisticsBuilder::<i32>::default();
        for item in [Some(3), None, Some(-1), Some(7)] {
            builder.add(item.as_ref(), |v: &i32| *v);
        }
        let zone_map = builder.finish(DataValue::Int32);
        assert_eq!(zone_map.min, DataValue::Int32(-1));
        assert_eq!(zone_map.max, DataValue::Int32(7));
        assert_eq!(zone_map.null_count, 1);
        assert_eq!(zone_map.row_count, 4);
    }

    #[test]
    fn test_str_statistics() {
        let mut builder = StatisticsBuilder::<String>::default();
        for item in ["b", "a", "c"] {
            builder.add(Some(item), |v: &str| v.to_string());
        }
        let zone_map = builder.finish(DataValue::String);
        assert_eq!(zone_map.min, DataValue::from("a"));
        assert_eq!(zone_map.max, DataValue::from("c"));
        assert!(!zone_map.all_null());
    }
}
