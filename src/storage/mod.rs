// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Columnar storage of tablets.
//!
//! A tablet owns an ordered list of immutable rowsets, each made of segment files. Rowsets
//! are written by a [`RowsetWriter`], made visible by [`Tablet::rowset_commit`], read by a
//! [`TabletReader`] and merged by compaction. Everything is reached through a
//! [`StorageEngine`].

// public modules and structures
mod delete_vector;
mod engine;
mod error;
mod options;
mod rowset;
mod tablet;
mod tablet_reader;
mod update_manager;

pub mod compaction;
pub mod iterator;
pub mod segment;

// internal modules and structures
mod checksum;
mod column;
mod encode;
mod page;

#[cfg(test)]
mod test_util;

pub use delete_vector::*;
pub use encode::*;
pub use engine::*;
pub use error::*;
pub use options::*;
pub use page::PageCache;
pub use rowset::*;
pub use tablet::*;
pub use tablet_reader::*;
pub use update_manager::*;
