//! Single-table export and filtered preview over the partitioned store.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::ControlFlow;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{ArrayRef, Scalar, StringArray};
use arrow::compute::kernels::cmp::eq;
use arrow::compute::{and, cast_with_options, filter_record_batch, CastOptions};
use arrow::csv::WriterBuilder;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use tracing::{debug, info};

use crate::dataset::{read_fragment, with_partition_column, Dataset, SchemaNormalizer};
use crate::error::ExportError;
use crate::schema::Entity;

/// Canonical columns of `entity` followed by the partition column.
pub fn table_schema(entity: Entity, partition_key: &str) -> SchemaRef {
    let canonical = entity.schema();
    let mut fields: Vec<Field> = canonical.fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(partition_key, DataType::Int32, false));
    Arc::new(Schema::new_with_metadata(fields, canonical.metadata().clone()))
}

/// Visits every fragment of `entity`, year by year, normalized to
/// [`table_schema`]. Stops early when `visit` breaks.
fn scan_table<F>(dataset: &Dataset, entity: Entity, mut visit: F) -> Result<(), ExportError>
where
    F: FnMut(RecordBatch) -> Result<ControlFlow<()>, ExportError>,
{
    let root = dataset.entity_root(entity);
    let years = dataset.years(entity).map_err(|e| ExportError::io(&root, e))?;
    let normalizer = SchemaNormalizer::new(entity, dataset.partition_key());

    for year in years {
        for fragment in dataset.fragments(entity, year)? {
            debug!(%entity, year, fragment = %fragment.display(), "scanning fragment");
            for batch in read_fragment(&fragment)? {
                let batch = normalizer.normalize(&batch)?;
                let batch = with_partition_column(&batch, dataset.partition_key(), year)?;
                if visit(batch)?.is_break() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// Streams every row of one entity into a delimited text file with a header
/// row. Returns the number of data rows written.
pub fn export_table(
    dataset: &Dataset,
    entity: Entity,
    output: &Path,
    delimiter: u8,
) -> Result<u64, ExportError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| ExportError::io(parent, e))?;
    }
    let file = File::create(output).map_err(|e| ExportError::io(output, e))?;
    let mut writer = WriterBuilder::new()
        .with_header(true)
        .with_delimiter(delimiter)
        .build(BufWriter::new(file));

    // header even for an empty table
    writer.write(&RecordBatch::new_empty(table_schema(entity, dataset.partition_key())))?;

    let mut rows = 0u64;
    scan_table(dataset, entity, |batch| {
        writer.write(&batch)?;
        rows += batch.num_rows() as u64;
        Ok(ControlFlow::Continue(()))
    })?;
    writer
        .into_inner()
        .flush()
        .map_err(|e| ExportError::io(output, e))?;

    info!(%entity, rows, file = %output.display(), "table exported");
    Ok(rows)
}

// ─────────────────────────────────────────────────────────────
//  PREVIEW
// ─────────────────────────────────────────────────────────────

/// Equality filter `COLUMN=VALUE`. The value is typed against the column
/// when the preview runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub column: String,
    pub value: String,
}

impl FromStr for Predicate {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((column, value)) if !column.trim().is_empty() => Ok(Self {
                column: column.trim().to_string(),
                value: value.to_string(),
            }),
            _ => Err(ExportError::InvalidFilter(s.to_string())),
        }
    }
}

/// A predicate bound to a column index with its value cast to the column type.
struct BoundPredicate {
    index: usize,
    scalar: Scalar<ArrayRef>,
}

fn bind(schema: &Schema, entity: Entity, p: &Predicate) -> Result<BoundPredicate, ExportError> {
    let index = schema
        .index_of(&p.column)
        .map_err(|_| ExportError::UnknownColumn {
            entity,
            column: p.column.clone(),
        })?;
    let raw = StringArray::from(vec![p.value.as_str()]);
    let options = CastOptions {
        safe: false,
        ..Default::default()
    };
    let typed = cast_with_options(&raw, schema.field(index).data_type(), &options).map_err(
        |source| ExportError::FilterValue {
            column: p.column.clone(),
            value: p.value.clone(),
            source,
        },
    )?;
    Ok(BoundPredicate {
        index,
        scalar: Scalar::new(typed),
    })
}

fn apply(batch: &RecordBatch, predicates: &[BoundPredicate]) -> Result<RecordBatch, ExportError> {
    let mut mask = None;
    for p in predicates {
        let hit = eq(batch.column(p.index), &p.scalar)?;
        mask = Some(match mask {
            Some(acc) => and(&acc, &hit)?,
            None => hit,
        });
    }
    match mask {
        Some(mask) => Ok(filter_record_batch(batch, &mask)?),
        None => Ok(batch.clone()),
    }
}

/// First `limit` rows of `entity` that match every predicate.
pub fn preview(
    dataset: &Dataset,
    entity: Entity,
    predicates: &[Predicate],
    limit: usize,
) -> Result<Vec<RecordBatch>, ExportError> {
    let schema = table_schema(entity, dataset.partition_key());
    let bound = predicates
        .iter()
        .map(|p| bind(&schema, entity, p))
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::new();
    let mut remaining = limit;
    if remaining == 0 {
        return Ok(out);
    }
    scan_table(dataset, entity, |batch| {
        let matched = apply(&batch, &bound)?;
        let take = matched.num_rows().min(remaining);
        if take > 0 {
            out.push(matched.slice(0, take));
            remaining -= take;
        }
        Ok(if remaining == 0 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        })
    })?;
    Ok(out)
}
