// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::backtrace::Backtrace;
use std::sync::Arc;

use thiserror::Error;

use crate::catalog::SchemaError;
use crate::types::ColumnId;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0}({1}) not found")]
    NotFound(&'static str, String),
    #[error("duplicated {0}: {1}")]
    Duplicated(&'static str, String),
    #[error("invalid column id: {0}")]
    InvalidColumn(ColumnId),
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Invalid checksum: found {0}, expected {1}")]
    Checksum(u64, u64),
    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("row count mismatch in segment {segment}: expected {expected}, actual {actual}")]
    RowCountMismatch {
        segment: usize,
        expected: usize,
        actual: usize,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("version {0} not found")]
    VersionNotFound(i64),
    #[error("version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: String, actual: String },
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("{0}")]
    Nested(#[from] Arc<TracedStorageError>),
}

impl From<std::io::Error> for TracedStorageError {
    #[inline]
    fn from(e: std::io::Error) -> TracedStorageError {
        StorageError::Io(e.into()).into()
    }
}

impl From<serde_json::Error> for TracedStorageError {
    #[inline]
    fn from(e: serde_json::Error) -> TracedStorageError {
        StorageError::JsonDecode(e).into()
    }
}

impl From<SchemaError> for TracedStorageError {
    #[inline]
    fn from(e: SchemaError) -> TracedStorageError {
        StorageError::Schema(e).into()
    }
}

impl From<Arc<TracedStorageError>> for TracedStorageError {
    #[inline]
    fn from(e: Arc<TracedStorageError>) -> TracedStorageError {
        StorageError::Nested(e).into()
    }
}

impl From<tokio::task::JoinError> for TracedStorageError {
    #[inline]
    fn from(e: tokio::task::JoinError) -> TracedStorageError {
        StorageError::Aborted(e.to_string()).into()
    }
}

// Aliased so `thiserror` does not emit the nightly-only `provide` impl for it.
type CapturedBacktrace = Backtrace;

/// [`StorageResult`] with backtrace.
#[derive(Error)]
#[error("{source:?}\n{backtrace}")]
pub struct TracedStorageError {
    source: StorageError,
    backtrace: CapturedBacktrace,
}

impl From<StorageError> for TracedStorageError {
    #[inline]
    fn from(source: StorageError) -> TracedStorageError {
        TracedStorageError {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl std::fmt::Debug for TracedStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl TracedStorageError {
    pub fn duplicated(ty: &'static str, item: impl ToString) -> Self {
        StorageError::Duplicated(ty, item.to_string()).into()
    }

    pub fn not_found(ty: &'static str, item: impl ToString) -> Self {
        StorageError::NotFound(ty, item.to_string()).into()
    }

    pub fn decode(message: impl ToString) -> Self {
        StorageError::Decode(message.to_string()).into()
    }

    pub fn checksum(found: u64, expected: u64) -> Self {
        StorageError::Checksum(found, expected).into()
    }

    pub fn schema_mismatch(message: impl ToString) -> Self {
        StorageError::SchemaMismatch(message.to_string()).into()
    }

    pub fn invalid_state(message: impl ToString) -> Self {
        StorageError::InvalidState(message.to_string()).into()
    }

    /// The underlying error, looking through errors shared by the page cache.
    pub fn kind(&self) -> &StorageError {
        match &self.source {
            StorageError::Nested(inner) => inner.kind(),
            other => other,
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, TracedStorageError>;
