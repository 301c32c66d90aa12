//! Layout of the partitioned store and schema-tolerant partition loading.
//!
//! ```text
//! <root>/<entity>/<key>=<year>/<fragment>.parquet
//! ```

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{new_null_array, ArrayRef, Int32Array};
use arrow::compute::{can_cast_types, cast, concat_batches};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::scan::scan_years;
use crate::schema::{Entity, SCHEMA_VERSION, SCHEMA_VERSION_KEY};

#[derive(Debug, Clone)]
pub struct Dataset {
    root: PathBuf,
    partition_key: String,
}

impl Dataset {
    pub fn new(root: impl Into<PathBuf>, partition_key: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            partition_key: partition_key.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn entity_root(&self, entity: Entity) -> PathBuf {
        self.root.join(entity.dir_name())
    }

    pub fn partition_dir(&self, entity: Entity, year: i32) -> PathBuf {
        self.entity_root(entity)
            .join(format!("{}={}", self.partition_key, year))
    }

    pub fn years(&self, entity: Entity) -> io::Result<Vec<i32>> {
        scan_years(&self.entity_root(entity), &self.partition_key)
    }

    pub fn has_partition(&self, entity: Entity, year: i32) -> bool {
        self.partition_dir(entity, year).is_dir()
    }

    /// Fragment files of one partition, sorted by name. In-flight temporary
    /// files (dot-prefixed) are not fragments.
    pub fn fragments(&self, entity: Entity, year: i32) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.partition_dir(entity, year);
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
            if is_fragment(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Loads every fragment of one partition into a single normalized batch.
    ///
    /// Aid partitions keep any extra on-disk column (as text) after the
    /// canonical ones; the other entities are cut down to their canonical
    /// columns.
    pub fn load_partition(&self, entity: Entity, year: i32) -> Result<RecordBatch, StoreError> {
        let mut batches = Vec::new();
        for path in self.fragments(entity, year)? {
            batches.extend(read_fragment(&path)?);
        }

        let mut normalizer = SchemaNormalizer::new(entity, &self.partition_key);
        if entity == Entity::Aiuti {
            normalizer = normalizer.with_extras_from(batches.iter().map(|b| b.schema()));
        }
        let normalized = batches
            .iter()
            .map(|b| normalizer.normalize(b))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            %entity,
            year,
            rows = normalized.iter().map(RecordBatch::num_rows).sum::<usize>(),
            "loaded partition"
        );
        Ok(concat_batches(normalizer.target_schema(), &normalized)?)
    }
}

fn is_fragment(path: &Path) -> bool {
    let visible = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.starts_with('.'));
    visible && path.extension().is_some_and(|ext| ext == "parquet") && path.is_file()
}

/// Reads all record batches of one Parquet fragment.
pub fn read_fragment(path: &Path) -> Result<Vec<RecordBatch>, StoreError> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    match builder.schema().metadata().get(SCHEMA_VERSION_KEY) {
        Some(version) if version == SCHEMA_VERSION => {}
        Some(version) => warn!(
            fragment = %path.display(),
            version = %version,
            "fragment written with another schema version"
        ),
        None => debug!(fragment = %path.display(), "unversioned fragment"),
    }
    let reader = builder.build()?;
    reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::from)
}

/// Appends the partition column as a constant `Int32` column.
pub fn with_partition_column(
    batch: &RecordBatch,
    partition_key: &str,
    year: i32,
) -> Result<RecordBatch, StoreError> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(partition_key, DataType::Int32, false));
    let mut columns = batch.columns().to_vec();
    columns.push(Arc::new(Int32Array::from(vec![year; batch.num_rows()])) as ArrayRef);
    let schema = Schema::new_with_metadata(fields, schema.metadata().clone());
    Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
}

// ─────────────────────────────────────────────────────────────
//  SCHEMA NORMALIZATION
// ─────────────────────────────────────────────────────────────

/// Brings fragments written by any earlier ingestion run to the canonical
/// shape of [`SCHEMA_VERSION`]:
///
/// * every canonical column exists (missing ones become all-null),
/// * canonical columns have their canonical type,
/// * the partition column is dropped if a fragment happens to carry it,
/// * extra columns are kept, as text, only when registered with
///   [`SchemaNormalizer::with_extras_from`].
#[derive(Debug, Clone)]
pub struct SchemaNormalizer {
    canonical: SchemaRef,
    partition_key: String,
    target: SchemaRef,
}

impl SchemaNormalizer {
    pub fn new(entity: Entity, partition_key: &str) -> Self {
        let canonical = entity.schema();
        Self {
            target: canonical.clone(),
            canonical,
            partition_key: partition_key.to_string(),
        }
    }

    /// Registers, in first-seen order, every non-canonical column found in
    /// `schemas` that can be rendered as text.
    pub fn with_extras_from(mut self, schemas: impl IntoIterator<Item = SchemaRef>) -> Self {
        let mut fields: Vec<Field> = self
            .canonical
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();

        for schema in schemas {
            for field in schema.fields() {
                let name = field.name();
                if name == &self.partition_key || fields.iter().any(|f| f.name() == name) {
                    continue;
                }
                if !can_cast_types(field.data_type(), &DataType::Utf8) {
                    warn!(column = %name, data_type = %field.data_type(), "dropping extra column that cannot be rendered as text");
                    continue;
                }
                fields.push(Field::new(name, DataType::Utf8, true));
            }
        }

        self.target = Arc::new(Schema::new_with_metadata(
            fields,
            self.canonical.metadata().clone(),
        ));
        self
    }

    pub fn target_schema(&self) -> &SchemaRef {
        &self.target
    }

    pub fn normalize(&self, batch: &RecordBatch) -> Result<RecordBatch, StoreError> {
        let rows = batch.num_rows();
        let mut columns = Vec::with_capacity(self.target.fields().len());
        for field in self.target.fields() {
            let column = match batch.column_by_name(field.name()) {
                Some(col) if col.data_type() == field.data_type() => col.clone(),
                Some(col) => cast(col, field.data_type()).map_err(|source| StoreError::Cast {
                    column: field.name().clone(),
                    source,
                })?,
                None => new_null_array(field.data_type(), rows),
            };
            columns.push(column);
        }
        Ok(RecordBatch::try_new(self.target.clone(), columns)?)
    }
}
