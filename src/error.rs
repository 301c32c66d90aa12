//! Error types for the ingestion and export paths.

use std::io;
use std::path::PathBuf;

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use thiserror::Error;

use crate::schema::Entity;

/// Stream-level failure while pulling records out of one XML file.
///
/// Anything reported here aborts the whole file; per-record problems are
/// surfaced as [`crate::extract::RecordFault`] instead.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The underlying parser could not make sense of the document.
    #[error("malformed xml near byte {position}: {source}")]
    Xml {
        /// Byte offset into the sanitized stream.
        position: u64,
        #[source]
        source: quick_xml::Error,
    },

    /// The document ended while a record element was still open.
    #[error("document ended inside record #{ordinal}")]
    Truncated {
        /// 1-based ordinal of the unterminated record.
        ordinal: u64,
    },
}

/// Failures reading or writing the partitioned Parquet store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),

    /// A column on disk could not be brought to its canonical type.
    #[error("cannot cast column {column} to its canonical type: {source}")]
    Cast {
        column: String,
        #[source]
        source: ArrowError,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// File-level ingestion failure.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("worker panicked while processing {path}: {message}")]
    WorkerPanicked { path: PathBuf, message: String },

    #[error("cannot build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("cannot list input files under {path}: {source}")]
    Discover {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Failures of the export commands (aggregated, single-table, preview).
#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("table {entity} has no column named {column}")]
    UnknownColumn { entity: Entity, column: String },

    #[error("invalid filter {0:?}: expected COLUMN=VALUE")]
    InvalidFilter(String),

    #[error("filter value {value:?} does not fit column {column}: {source}")]
    FilterValue {
        column: String,
        value: String,
        #[source]
        source: ArrowError,
    },
}

impl ExportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
