//! Append-only fragment writer for the partitioned store.
//!
//! Every call produces brand-new, uniquely named files; existing fragments
//! are never opened for writing. A fragment becomes visible only once it is
//! complete: it is written under a hidden temporary name and renamed into
//! place.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rand::Rng;
use tracing::debug;

use crate::dataset::Dataset;
use crate::error::StoreError;
use crate::partitioner::partition_by_year;
use crate::schema::EntityRow;

/// Writes row buffers as year-partitioned Parquet fragments.
#[derive(Debug, Clone)]
pub struct PartitionedWriter {
    dataset: Dataset,
    props: WriterProperties,
}

impl PartitionedWriter {
    pub fn new(dataset: Dataset) -> Self {
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        Self { dataset, props }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Writes `rows` as one new fragment per distinct year and returns the
    /// fragment paths. An empty slice writes nothing.
    ///
    /// Safe to call concurrently from several workers: fragment names never
    /// collide, so no locking is involved.
    pub fn append<R: EntityRow>(&self, rows: &[R]) -> Result<Vec<PathBuf>, StoreError> {
        let mut written = Vec::new();
        for (year, group) in partition_by_year(rows) {
            let batch = R::to_batch(&group)?;
            let dir = self.dataset.partition_dir(R::ENTITY, year);
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

            let name = fragment_name();
            let tmp = dir.join(format!(".{name}.tmp"));
            let path = dir.join(&name);

            if let Err(e) = self.write_fragment(&tmp, &batch) {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
            fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;

            debug!(entity = %R::ENTITY, year, rows = batch.num_rows(), fragment = %path.display(), "fragment written");
            written.push(path);
        }
        Ok(written)
    }

    fn write_fragment(
        &self,
        path: &Path,
        batch: &arrow::record_batch::RecordBatch,
    ) -> Result<(), StoreError> {
        let file = File::create(path).map_err(|e| StoreError::io(path, e))?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(self.props.clone()))?;
        writer.write(batch)?;
        writer.close()?;
        Ok(())
    }
}

/// `part-<pid>-<nanos>-<random>.parquet`
fn fragment_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let salt: u64 = rand::rng().random();
    format!("part-{}-{nanos}-{salt:016x}.parquet", process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::read_fragment;
    use crate::schema::{AidRow, Entity};
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn aid(car: &str, anno: i32) -> AidRow {
        AidRow {
            car: Some(car.into()),
            anno,
            file_source: "f.xml".into(),
            ..Default::default()
        }
    }

    #[test]
    fn one_fragment_per_year_and_nothing_left_behind() {
        let dir = tempdir().unwrap();
        let writer = PartitionedWriter::new(Dataset::new(dir.path(), "ANNO"));

        let written = writer
            .append(&[aid("a", 2021), aid("b", 2022), aid("c", 2021)])
            .unwrap();

        assert_eq!(written.len(), 2);
        let years = writer.dataset().years(Entity::Aiuti).unwrap();
        assert_eq!(years, vec![2021, 2022]);

        let files = writer.dataset().fragments(Entity::Aiuti, 2021).unwrap();
        assert_eq!(files.len(), 1);
        let rows: usize = read_fragment(&files[0]).unwrap().iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);

        let leftovers = fs::read_dir(writer.dataset().partition_dir(Entity::Aiuti, 2021))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn repeated_appends_never_overwrite() {
        let dir = tempdir().unwrap();
        let writer = PartitionedWriter::new(Dataset::new(dir.path(), "ANNO"));
        let mut seen = HashSet::new();
        for i in 0..5 {
            for path in writer.append(&[aid(&i.to_string(), 2020)]).unwrap() {
                assert!(seen.insert(path));
            }
        }
        assert_eq!(writer.dataset().fragments(Entity::Aiuti, 2020).unwrap().len(), 5);
    }

    #[test]
    fn empty_input_writes_nothing() {
        let dir = tempdir().unwrap();
        let writer = PartitionedWriter::new(Dataset::new(dir.path(), "ANNO"));
        assert!(writer.append::<AidRow>(&[]).unwrap().is_empty());
        assert!(!dir.path().join("aiuti").exists());
    }
}
