// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// IO Backend of the segment readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IOBackend {
    /// Use Linux's `pread` API to read from the files.
    PositionedRead,
    /// Use cross-platform API to read from files. Note that this would hurt performance
    NormalRead,
}

/// Checksum algorithm of pages and footers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumType {
    None,
    Crc32,
}

impl ChecksumType {
    pub fn to_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Crc32 => 1,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Crc32),
            _ => None,
        }
    }
}

/// Options for `StorageEngine`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Path of the storage engine
    pub path: PathBuf,

    /// Number of cached pages
    pub page_cache_capacity: u64,

    /// Target size (in bytes) of pages
    pub target_page_size: usize,

    /// Rows in one segment before a horizontal writer seals it
    pub max_rows_per_segment: usize,

    /// Columns in one group of a vertical write or compaction
    pub vertical_compaction_max_columns_per_group: usize,

    /// Rows between two samples of the short-key index
    pub short_key_interval: usize,

    /// Rows in one batch returned by iterators
    pub chunk_size: usize,

    /// Checksum type used by pages and footers
    pub checksum_type: ChecksumType,

    /// Whether using run-length encoding
    pub is_rle: bool,

    /// I/O Backend used by segment readers
    pub io_backend: IOBackend,

    /// Upper bound of rowsets consumed by one compaction
    pub max_compaction_input_rowsets: usize,

    /// Interval between two rounds of the background compactor
    pub compaction_interval_ms: u64,

    /// Whether to fsync segment files and metadata
    pub enable_fsync: bool,
}

impl StorageOptions {
    pub fn default_for_cli() -> Self {
        Self {
            path: PathBuf::new().join("olapstore.db"),
            page_cache_capacity: 262144, // 4GB (16KB * 262144)
            target_page_size: 16 * (1 << 10), // 16KB
            max_rows_per_segment: 1 << 20,
            vertical_compaction_max_columns_per_group: 5,
            short_key_interval: 1024,
            chunk_size: 4096,
            checksum_type: ChecksumType::Crc32,
            is_rle: false,
            io_backend: if cfg!(unix) {
                IOBackend::PositionedRead
            } else {
                warn!("segment reads are running in compatibility mode (NormalRead), which might hurt I/O performance.");
                IOBackend::NormalRead
            },
            max_compaction_input_rowsets: 10,
            compaction_interval_ms: 1000,
            enable_fsync: true,
        }
    }

    pub fn default_for_test(path: PathBuf) -> Self {
        Self {
            path,
            page_cache_capacity: 1024,
            target_page_size: 4096,
            max_rows_per_segment: 5000,
            vertical_compaction_max_columns_per_group: 5,
            short_key_interval: 128,
            chunk_size: 1024,
            checksum_type: ChecksumType::Crc32,
            is_rle: false,
            io_backend: IOBackend::NormalRead,
            max_compaction_input_rowsets: 10,
            compaction_interval_ms: 100,
            enable_fsync: false,
        }
    }
}

/// Options for `ColumnBuilder`s.
#[derive(Debug, Clone)]
pub struct ColumnBuilderOptions {
    /// Target size (in bytes) of pages
    pub target_page_size: usize,

    /// Checksum type used by pages
    pub checksum_type: ChecksumType,

    /// Whether using run-length encoding
    pub is_rle: bool,
}

impl ColumnBuilderOptions {
    pub fn from_storage_options(options: &StorageOptions) -> Self {
        Self {
            target_page_size: options.target_page_size,
            checksum_type: options.checksum_type,
            is_rle: options.is_rle,
        }
    }

    #[cfg(test)]
    pub fn default_for_test() -> Self {
        Self {
            target_page_size: 4096,
            checksum_type: ChecksumType::Crc32,
            is_rle: false,
        }
    }

    #[cfg(test)]
    pub fn default_for_page_test() -> Self {
        Self {
            target_page_size: 128,
            checksum_type: ChecksumType::None,
            is_rle: false,
        }
    }

    #[cfg(test)]
    pub fn default_for_rle_page_test() -> Self {
        Self {
            target_page_size: 128,
            checksum_type: ChecksumType::None,
            is_rle: true,
        }
    }
}
