//! Streaming ETL for the RNA aid registry.
//!
//! XML files are sanitized, parsed one `AIUTO` record at a time and flattened
//! into three year-partitioned Parquet datasets (`aiuti`, `componenti`,
//! `strumenti`). The export side joins the three back together per year.

pub mod aggregate;
pub mod batch;
pub mod config;
pub mod dataset;
pub mod error;
pub mod export;
pub mod extract;
pub mod ingest;
pub mod log;
pub mod partitioner;
pub mod sanitize;
pub mod scan;
pub mod schema;
pub mod writer;

pub use aggregate::{AggregateOptions, Aggregator, ExportSummary};
pub use config::PipelineConfig;
pub use dataset::Dataset;
pub use ingest::{collect_xml_files, ingest_file, ingest_files, EntityCounts, IngestSummary};
pub use schema::Entity;
