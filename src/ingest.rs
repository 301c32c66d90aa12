//! File-grained ingestion driver: XML files in, partitioned fragments out.

use std::fs::File;
use std::io::BufReader;
use std::ops::AddAssign;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use crossbeam::channel;
use rayon::ThreadPoolBuilder;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::batch::{BatchAccumulator, FlushReport};
use crate::config::PipelineConfig;
use crate::dataset::Dataset;
use crate::error::IngestError;
use crate::extract::{CursorItem, RecordCursor};
use crate::sanitize::SanitizingReader;
use crate::writer::PartitionedWriter;

const READ_BUFFER: usize = 256 * 1024;

/// Rows extracted per entity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntityCounts {
    pub aiuti: u64,
    pub componenti: u64,
    pub strumenti: u64,
}

impl AddAssign for EntityCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.aiuti += rhs.aiuti;
        self.componenti += rhs.componenti;
        self.strumenti += rhs.strumenti;
    }
}

/// What one successfully processed file contributed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FileStats {
    pub counts: EntityCounts,
    pub skipped_records: u64,
    /// Entity writes that failed during this file's flushes.
    pub failed_flushes: u64,
    pub fragments: Vec<PathBuf>,
}

impl FileStats {
    fn absorb(&mut self, report: FlushReport) {
        self.failed_flushes += report.failed.len() as u64;
        self.fragments.extend(report.fragments);
    }
}

/// Processes one XML file end to end.
///
/// Batches already flushed stay on disk if the file later fails; rows still
/// buffered at the time of the failure are dropped.
pub fn ingest_file(path: &Path, config: &PipelineConfig) -> Result<FileStats, IngestError> {
    let file = File::open(path).map_err(|source| IngestError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::with_capacity(READ_BUFFER, SanitizingReader::new(file));
    let mut cursor = RecordCursor::new(reader, &config.namespace_uri);

    let writer = PartitionedWriter::new(Dataset::new(
        &config.dataset_root,
        &config.partition_key,
    ));
    let mut batch = BatchAccumulator::new(&writer, config.threshold);
    let file_source = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut stats = FileStats::default();
    while let Some(item) = cursor.next_record()? {
        match item {
            CursorItem::Record(tree) => {
                let rows = tree.into_rows(&file_source);
                stats.counts += EntityCounts {
                    aiuti: 1,
                    componenti: rows.components.len() as u64,
                    strumenti: rows.instruments.len() as u64,
                };
                if let Some(report) = batch.push(rows) {
                    stats.absorb(report);
                }
            }
            CursorItem::Skipped(fault) => {
                warn!(
                    file = %path.display(),
                    ordinal = fault.ordinal,
                    position = fault.position,
                    car = fault.car.as_deref().unwrap_or("-"),
                    reason = %fault.reason,
                    "skipping record"
                );
                stats.skipped_records += 1;
            }
        }
    }
    if let Some(report) = batch.finish() {
        stats.absorb(report);
    }

    debug!(
        file = %path.display(),
        records = cursor.records_seen(),
        aiuti = stats.counts.aiuti,
        componenti = stats.counts.componenti,
        strumenti = stats.counts.strumenti,
        "file done"
    );
    Ok(stats)
}

/// Totals across a whole ingestion run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestSummary {
    pub totals: EntityCounts,
    pub skipped_records: u64,
    pub failed_flushes: u64,
    pub files: u64,
    pub failed_files: Vec<(PathBuf, String)>,
}

/// Ingests `files` on a pool of `config.workers` threads.
///
/// `on_done` runs on the calling thread once per file, in completion order.
/// A failing or panicking file is recorded in the summary and never stops
/// the others.
pub fn ingest_files<F>(
    files: &[PathBuf],
    config: &PipelineConfig,
    mut on_done: F,
) -> Result<IngestSummary, IngestError>
where
    F: FnMut(&Path, &Result<FileStats, IngestError>),
{
    let pool = ThreadPoolBuilder::new()
        .num_threads(config.workers.max(1))
        .thread_name(|i| format!("rna-ingest-{i}"))
        .build()?;

    let (tx, rx) = channel::unbounded();
    let mut summary = IngestSummary::default();

    pool.in_place_scope(|scope| {
        for path in files {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| ingest_file(path, config)))
                    .unwrap_or_else(|payload| {
                        Err(IngestError::WorkerPanicked {
                            path: path.clone(),
                            message: panic_message(payload.as_ref()),
                        })
                    });
                // the receiver outlives every worker
                let _ = tx.send((path, outcome));
            });
        }
        drop(tx);

        for (path, outcome) in rx {
            on_done(path, &outcome);
            summary.files += 1;
            match outcome {
                Ok(stats) => {
                    summary.totals += stats.counts;
                    summary.skipped_records += stats.skipped_records;
                    summary.failed_flushes += stats.failed_flushes;
                }
                Err(e) => {
                    error!(file = %path.display(), error = %e, "file failed");
                    summary.failed_files.push((path.clone(), e.to_string()));
                }
            }
        }
    });

    info!(
        files = summary.files,
        failed = summary.failed_files.len(),
        aiuti = summary.totals.aiuti,
        componenti = summary.totals.componenti,
        strumenti = summary.totals.strumenti,
        "ingestion finished"
    );
    Ok(summary)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// `input` itself when it is a file, otherwise every `*.xml` below it,
/// sorted by path.
pub fn collect_xml_files(input: &Path) -> Result<Vec<PathBuf>, IngestError> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(input).follow_links(true) {
        let entry = entry.map_err(|source| IngestError::Discover {
            path: input.to_path_buf(),
            source,
        })?;
        let is_xml = entry
            .path()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
        if entry.file_type().is_file() && is_xml {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}
