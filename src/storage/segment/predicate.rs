// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::compare_prefix;
use crate::array::ArrayImpl;
use crate::storage::column::ZoneMap;
use crate::types::{ColumnId, DataType, DataValue, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    IsNull,
    IsNotNull,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        };
        write!(f, "{op}")
    }
}

/// A predicate on a single column, pushed down to segment iterators.
///
/// Comparisons never match NULL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnPredicate {
    pub column_id: ColumnId,
    pub op: CompareOp,
    pub value: DataValue,
}

impl ColumnPredicate {
    pub fn new(column_id: ColumnId, op: CompareOp, value: impl Into<DataValue>) -> Self {
        Self {
            column_id,
            op,
            value: value.into(),
        }
    }

    pub fn is_null(column_id: ColumnId) -> Self {
        Self::new(column_id, CompareOp::IsNull, DataValue::Null)
    }

    pub fn is_not_null(column_id: ColumnId) -> Self {
        Self::new(column_id, CompareOp::IsNotNull, DataValue::Null)
    }

    /// Whether the predicate can be evaluated on a column of `ty`.
    pub fn applies_to(&self, ty: DataType) -> bool {
        match self.op {
            CompareOp::IsNull | CompareOp::IsNotNull => true,
            _ => self.value.data_type() == Some(ty),
        }
    }

    pub fn eval(&self, value: &DataValue) -> bool {
        match self.op {
            CompareOp::IsNull => value.is_null(),
            CompareOp::IsNotNull => !value.is_null(),
            _ if value.is_null() || self.value.is_null() => false,
            CompareOp::Eq => value == &self.value,
            CompareOp::Ne => value != &self.value,
            CompareOp::Lt => value < &self.value,
            CompareOp::Le => value <= &self.value,
            CompareOp::Gt => value > &self.value,
            CompareOp::Ge => value >= &self.value,
        }
    }

    /// Evaluate on every row of `array`, clearing rows of `visibility` that do not match.
    pub fn filter(&self, array: &ArrayImpl, visibility: &mut [bool]) {
        for (idx, visible) in visibility.iter_mut().enumerate() {
            if *visible && !self.eval(&array.get(idx)) {
                *visible = false;
            }
        }
    }

    /// Whether a range of rows summarized by `zone` may contain a matching row.
    pub fn may_match(&self, zone: &ZoneMap) -> bool {
        let has_values = !zone.all_null();
        match self.op {
            CompareOp::IsNull => zone.null_count > 0,
            CompareOp::IsNotNull => has_values,
            _ if !has_values || self.value.is_null() => false,
            CompareOp::Eq => zone.min <= self.value && self.value <= zone.max,
            CompareOp::Ne => !(zone.min == self.value && zone.max == self.value),
            CompareOp::Lt => zone.min < self.value,
            CompareOp::Le => zone.min <= self.value,
            CompareOp::Gt => zone.max > self.value,
            CompareOp::Ge => zone.max >= self.value,
        }
    }
}

impl fmt::Display for ColumnPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            CompareOp::IsNull | CompareOp::IsNotNull => write!(f, "#{} {}", self.column_id, self.op),
            _ => write!(f, "#{} {} {:?}", self.column_id, self.op, self.value),
        }
    }
}

/// An inclusive range on the key columns. Bounds may be prefixes of the full key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: Option<Row>,
    pub upper: Option<Row>,
}

impl KeyRange {
    pub fn new(lower: Option<Row>, upper: Option<Row>) -> Self {
        Self { lower, upper }
    }

    pub fn is_full(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    pub fn contains(&self, key: &[DataValue]) -> bool {
        if let Some(lower) = &self.lower {
            if compare_prefix(key, lower) == Ordering::Less {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if compare_prefix(key, upper) == Ordering::Greater {
                return false;
            }
        }
        true
    }

    /// Whether a segment whose keys are within `[min_key, max_key]` may overlap the range.
    pub fn overlaps(&self, min_key: &[DataValue], max_key: &[DataValue]) -> bool {
        if min_key.is_empty() {
            return true;
        }
        if let Some(lower) = &self.lower {
            if compare_prefix(max_key, lower) == Ordering::Less {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if compare_prefix(min_key, upper) == Ordering::Greater {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn zone(min: i32, max: i32, null_count: u64) -> ZoneMap {
        ZoneMap {
            min: DataValue::Int32(min),
            max: DataValue::Int32(max),
            null_count,
            row_count: 100,
        }
    }

    #[test_case(CompareOp::Eq, 5, true)]
    #[test_case(CompareOp::Eq, 50, false)]
    #[test_case(CompareOp::Lt, 10, false)]
    #[test_case(CompareOp::Le, 10, true)]
    #[test_case(CompareOp::Gt, 20, false)]
    #[test_case(CompareOp::Ge, 20, true)]
    #[test_case(CompareOp::Ne, 15, true)]
    fn test_zone_map_pruning(op: CompareOp, value: i32, expected: bool) {
        let predicate = ColumnPredicate::new(0, op, value);
        let zone = if op == CompareOp::Eq && value == 5 {
            zone(0, 20, 0)
        } else {
            zone(10, 20, 0)
        };
        assert_eq!(predicate.may_match(&zone), expected);
    }

    #[test]
    fn test_null_handling() {
        let all_null = ZoneMap {
            min: DataValue::Null,
            max: DataValue::Null,
            null_count: 10,
            row_count: 10,
        };
        assert!(!ColumnPredicate::new(0, CompareOp::Ge, 0).may_match(&all_null));
        assert!(ColumnPredicate::is_null(0).may_match(&all_null));
        assert!(!ColumnPredicate::is_null(0).may_match(&zone(1, 2, 0)));
        assert!(!ColumnPredicate::new(0, CompareOp::Ne, 1).eval(&DataValue::Null));
        assert!(ColumnPredicate::is_not_null(0).eval(&DataValue::Int32(1)));
    }

    #[test]
    fn test_key_range() {
        let range = KeyRange::new(Some(vec![DataValue::Int32(10)]), Some(vec![DataValue::Int32(20)]));
        assert!(range.contains(&[DataValue::Int32(10), DataValue::Int32(-5)]));
        assert!(range.contains(&[DataValue::Int32(20), DataValue::Int32(99)]));
        assert!(!range.contains(&[DataValue::Int32(21)]));
        assert!(range.overlaps(&[DataValue::Int32(0)], &[DataValue::Int32(10)]));
        assert!(!range.overlaps(&[DataValue::Int32(21)], &[DataValue::Int32(30)]));
        assert!(KeyRange::default().is_full());
    }
}
