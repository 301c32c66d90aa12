//! Per-file row buffers with threshold-triggered flushing.

use std::mem;
use std::path::PathBuf;

use tracing::{error, info};

use crate::error::StoreError;
use crate::extract::RecordRows;
use crate::schema::{AidRow, ComponentRow, Entity, EntityRow, InstrumentRow};
use crate::writer::PartitionedWriter;

/// Outcome of one flush.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushReport {
    pub fragments: Vec<PathBuf>,
    /// Entities whose write failed; their rows were discarded.
    pub failed: Vec<Entity>,
}

/// Buffers the rows of one input file and writes them out every
/// `threshold` aid records.
///
/// Each entity is written independently: a failure on one entity is logged
/// and reported, the others are still written, and every buffer is emptied
/// either way. A flush is therefore not atomic across entities.
pub struct BatchAccumulator<'w> {
    writer: &'w PartitionedWriter,
    threshold: usize,
    aiuti: Vec<AidRow>,
    componenti: Vec<ComponentRow>,
    strumenti: Vec<InstrumentRow>,
}

impl<'w> BatchAccumulator<'w> {
    pub fn new(writer: &'w PartitionedWriter, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            writer,
            threshold,
            aiuti: Vec::with_capacity(threshold),
            componenti: Vec::new(),
            strumenti: Vec::new(),
        }
    }

    /// Number of aid records waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.aiuti.len()
    }

    /// Buffers one record's rows, flushing when the threshold is reached.
    pub fn push(&mut self, rows: RecordRows) -> Option<FlushReport> {
        self.aiuti.push(rows.aid);
        self.componenti.extend(rows.components);
        self.strumenti.extend(rows.instruments);
        (self.aiuti.len() >= self.threshold).then(|| self.flush())
    }

    /// Writes whatever is still buffered. Nothing is written when no aid
    /// record is pending.
    pub fn finish(mut self) -> Option<FlushReport> {
        (!self.aiuti.is_empty()).then(|| self.flush())
    }

    fn flush(&mut self) -> FlushReport {
        let aiuti = mem::take(&mut self.aiuti);
        let componenti = mem::take(&mut self.componenti);
        let strumenti = mem::take(&mut self.strumenti);

        info!(
            aiuti = aiuti.len(),
            componenti = componenti.len(),
            strumenti = strumenti.len(),
            "flushing batch"
        );

        let mut report = FlushReport::default();
        self.write(&aiuti, &mut report);
        self.write(&componenti, &mut report);
        self.write(&strumenti, &mut report);
        report
    }

    fn write<R: EntityRow>(&self, rows: &[R], report: &mut FlushReport) {
        match self.writer.append(rows) {
            Ok(paths) => report.fragments.extend(paths),
            Err(e) => {
                log_write_failure(R::ENTITY, rows.len(), &e);
                report.failed.push(R::ENTITY);
            }
        }
    }
}

fn log_write_failure(entity: Entity, rows: usize, e: &StoreError) {
    error!(%entity, rows, error = %e, "failed to write batch; rows dropped");
}
