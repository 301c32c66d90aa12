//! Yearly join of the three entities into one summary row per aid record.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use arrow::array::{
    Array, ArrayRef, AsArray, Float64Array, Int32Array, Int64Array, StringArray, UInt32Array,
};
use arrow::compute::take;
use arrow::csv::WriterBuilder;
use arrow::datatypes::{DataType, Field, Float64Type, Schema};
use arrow::record_batch::RecordBatch;
use tracing::{error, info, warn};

use crate::dataset::Dataset;
use crate::error::ExportError;
use crate::schema::Entity;

/// Columns appended after the aid columns and the partition column.
pub const TOTAL_NOMINAL: &str = "IMPORTO_NOMINALE_TOTALE";
pub const TOTAL_AID_ELEMENT: &str = "ELEMENTO_DI_AIUTO_TOTALE";
pub const NUM_COMPONENTS: &str = "NUM_COMPONENTI";
pub const NUM_INSTRUMENTS: &str = "NUM_STRUMENTI";
pub const INSTRUMENT_CODES: &str = "COD_STRUMENTI";
pub const ACTIVITY_SECTORS: &str = "SETTORI_ATTIVITA";

const LIST_SEPARATOR: &str = "|";
const DEFAULT_STEM: &str = "aiuti_aggregati";

/// Where and how the yearly CSV files are written.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOptions {
    pub output_dir: PathBuf,
    pub stem: String,
    pub delimiter: u8,
}

impl AggregateOptions {
    /// `out/report.csv` becomes `out/report_<year>.csv`.
    pub fn from_output_path(path: &Path, delimiter: u8) -> Self {
        let output_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_STEM.to_string());
        Self {
            output_dir,
            stem,
            delimiter,
        }
    }

    pub fn year_path(&self, year: i32) -> PathBuf {
        self.output_dir.join(format!("{}_{}.csv", self.stem, year))
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExportSummary {
    pub written: Vec<PathBuf>,
    pub failed_years: Vec<(i32, String)>,
}

pub struct Aggregator<'a> {
    dataset: &'a Dataset,
    options: AggregateOptions,
}

impl<'a> Aggregator<'a> {
    pub fn new(dataset: &'a Dataset, options: AggregateOptions) -> Self {
        Self { dataset, options }
    }

    /// Aggregates and writes every year found under the aid root, oldest
    /// first. A failing year is logged and skipped.
    pub fn run(&self) -> Result<ExportSummary, ExportError> {
        let aid_root = self.dataset.entity_root(Entity::Aiuti);
        let years = self
            .dataset
            .years(Entity::Aiuti)
            .map_err(|e| ExportError::io(&aid_root, e))?;

        let mut summary = ExportSummary::default();
        if years.is_empty() {
            warn!(root = %aid_root.display(), "no year partitions found; nothing to export");
            return Ok(summary);
        }
        fs::create_dir_all(&self.options.output_dir)
            .map_err(|e| ExportError::io(&self.options.output_dir, e))?;

        for year in years {
            let path = self.options.year_path(year);
            match self.aggregate_year(year).and_then(|batch| self.write_csv(&path, &batch)) {
                Ok(rows) => {
                    info!(year, rows, file = %path.display(), "year exported");
                    summary.written.push(path);
                }
                Err(e) => {
                    error!(year, error = %e, "year export failed; skipping");
                    let _ = fs::remove_file(&path);
                    summary.failed_years.push((year, e.to_string()));
                }
            }
        }
        Ok(summary)
    }

    /// Builds the summary batch for one year without writing it.
    pub fn aggregate_year(&self, year: i32) -> Result<RecordBatch, ExportError> {
        let aid = self.dataset.load_partition(Entity::Aiuti, year)?;
        let components = if self.dataset.has_partition(Entity::Componenti, year) {
            Some(self.dataset.load_partition(Entity::Componenti, year)?)
        } else {
            None
        };
        let instruments = match components {
            Some(_) if self.dataset.has_partition(Entity::Strumenti, year) => {
                Some(self.dataset.load_partition(Entity::Strumenti, year)?)
            }
            _ => None,
        };

        let natural: Vec<&StringArray> = aid
            .schema()
            .fields()
            .iter()
            .map(|f| text_column(&aid, Entity::Aiuti, f.name()))
            .collect::<Result<_, _>>()?;
        let car = text_column(&aid, Entity::Aiuti, "CAR")?;
        let cor = text_column(&aid, Entity::Aiuti, "COR")?;

        let components = components
            .as_ref()
            .map(ComponentSide::new)
            .transpose()?;
        let instruments = instruments
            .as_ref()
            .map(InstrumentSide::new)
            .transpose()?;

        let mut groups: AHashMap<Vec<Option<&str>>, usize> = AHashMap::new();
        let mut accs: Vec<GroupAcc> = Vec::new();

        for row in 0..aid.num_rows() {
            let key: Vec<Option<&str>> = natural.iter().map(|col| value(col, row)).collect();
            let slot = *groups.entry(key).or_insert_with(|| {
                accs.push(GroupAcc::new(row));
                accs.len() - 1
            });
            let acc = &mut accs[slot];

            let (Some(comps), Some(car), Some(cor)) = (&components, value(car, row), value(cor, row))
            else {
                continue;
            };
            for &c in comps.matching(car, cor) {
                if let Some(id) = value(comps.id, c) {
                    acc.component_ids.insert(id);
                }
                if let Some(sector) = value(comps.sector, c) {
                    acc.sectors.insert(sector);
                }
                let (Some(instr), Some(id)) = (&instruments, value(comps.id, c)) else {
                    continue;
                };
                for &i in instr.matching(id) {
                    acc.instruments += 1;
                    acc.nominal += amount(instr.nominal, i);
                    acc.aid_element += amount(instr.aid_element, i);
                    if let Some(code) = value(instr.code, i) {
                        acc.codes.insert(code);
                    }
                }
            }
        }

        build_output(&aid, self.dataset.partition_key(), year, &accs)
    }

    fn write_csv(&self, path: &Path, batch: &RecordBatch) -> Result<usize, ExportError> {
        let file = File::create(path).map_err(|e| ExportError::io(path, e))?;
        let mut writer = WriterBuilder::new()
            .with_header(true)
            .with_delimiter(self.options.delimiter)
            .build(BufWriter::new(file));
        writer.write(batch)?;
        writer
            .into_inner()
            .flush()
            .map_err(|e| ExportError::io(path, e))?;
        Ok(batch.num_rows())
    }
}

// ─────────────────────────────────────────────────────────────
//  JOIN SIDES
// ─────────────────────────────────────────────────────────────

/// Component rows indexed by their (`CAR_AIUTO`, `COR_AIUTO`) foreign key.
struct ComponentSide<'b> {
    id: &'b StringArray,
    sector: &'b StringArray,
    by_parent: AHashMap<(&'b str, &'b str), Vec<usize>>,
}

impl<'b> ComponentSide<'b> {
    fn new(batch: &'b RecordBatch) -> Result<Self, ExportError> {
        let car = text_column(batch, Entity::Componenti, "CAR_AIUTO")?;
        let cor = text_column(batch, Entity::Componenti, "COR_AIUTO")?;
        let mut by_parent: AHashMap<(&str, &str), Vec<usize>> = AHashMap::new();
        for row in 0..batch.num_rows() {
            if let (Some(car), Some(cor)) = (value(car, row), value(cor, row)) {
                by_parent.entry((car, cor)).or_default().push(row);
            }
        }
        Ok(Self {
            id: text_column(batch, Entity::Componenti, "ID_COMPONENTE_AIUTO")?,
            sector: text_column(batch, Entity::Componenti, "SETTORE_ATTIVITA")?,
            by_parent,
        })
    }

    fn matching<'k>(&'k self, car: &'k str, cor: &'k str) -> &'k [usize] {
        self.by_parent
            .get(&(car, cor))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Instrument rows indexed by `ID_COMPONENTE_AIUTO`.
struct InstrumentSide<'b> {
    code: &'b StringArray,
    nominal: &'b Float64Array,
    aid_element: &'b Float64Array,
    by_component: AHashMap<&'b str, Vec<usize>>,
}

impl<'b> InstrumentSide<'b> {
    fn new(batch: &'b RecordBatch) -> Result<Self, ExportError> {
        let id = text_column(batch, Entity::Strumenti, "ID_COMPONENTE_AIUTO")?;
        let mut by_component: AHashMap<&str, Vec<usize>> = AHashMap::new();
        for row in 0..batch.num_rows() {
            if let Some(id) = value(id, row) {
                by_component.entry(id).or_default().push(row);
            }
        }
        Ok(Self {
            code: text_column(batch, Entity::Strumenti, "COD_STRUMENTO")?,
            nominal: float_column(batch, "IMPORTO_NOMINALE")?,
            aid_element: float_column(batch, "ELEMENTO_DI_AIUTO")?,
            by_component,
        })
    }

    fn matching(&self, component_id: &str) -> &[usize] {
        self.by_component
            .get(component_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn text_column<'b>(
    batch: &'b RecordBatch,
    entity: Entity,
    name: &str,
) -> Result<&'b StringArray, ExportError> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_string_opt::<i32>())
        .ok_or_else(|| ExportError::UnknownColumn {
            entity,
            column: name.to_string(),
        })
}

fn float_column<'b>(batch: &'b RecordBatch, name: &str) -> Result<&'b Float64Array, ExportError> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_primitive_opt::<Float64Type>())
        .ok_or_else(|| ExportError::UnknownColumn {
            entity: Entity::Strumenti,
            column: name.to_string(),
        })
}

#[inline]
fn value(col: &StringArray, row: usize) -> Option<&str> {
    col.is_valid(row).then(|| col.value(row))
}

#[inline]
fn amount(col: &Float64Array, row: usize) -> f64 {
    if col.is_valid(row) {
        col.value(row)
    } else {
        0.0
    }
}

// ─────────────────────────────────────────────────────────────
//  GROUPS
// ─────────────────────────────────────────────────────────────

struct GroupAcc<'b> {
    first_row: usize,
    nominal: f64,
    aid_element: f64,
    instruments: i64,
    component_ids: BTreeSet<&'b str>,
    codes: BTreeSet<&'b str>,
    sectors: BTreeSet<&'b str>,
}

impl GroupAcc<'_> {
    fn new(first_row: usize) -> Self {
        Self {
            first_row,
            nominal: 0.0,
            aid_element: 0.0,
            instruments: 0,
            component_ids: BTreeSet::new(),
            codes: BTreeSet::new(),
            sectors: BTreeSet::new(),
        }
    }
}

/// `a|b|c` in sorted order, `None` for an empty set.
fn join_sorted(values: &BTreeSet<&str>) -> Option<String> {
    (!values.is_empty()).then(|| values.iter().copied().collect::<Vec<_>>().join(LIST_SEPARATOR))
}

fn build_output(
    aid: &RecordBatch,
    partition_key: &str,
    year: i32,
    accs: &[GroupAcc<'_>],
) -> Result<RecordBatch, ExportError> {
    let aid_schema = aid.schema();
    let mut fields: Vec<Field> = aid_schema
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    fields.extend([
        Field::new(partition_key, DataType::Int32, false),
        Field::new(TOTAL_NOMINAL, DataType::Float64, false),
        Field::new(TOTAL_AID_ELEMENT, DataType::Float64, false),
        Field::new(NUM_COMPONENTS, DataType::Int64, false),
        Field::new(NUM_INSTRUMENTS, DataType::Int64, false),
        Field::new(INSTRUMENT_CODES, DataType::Utf8, true),
        Field::new(ACTIVITY_SECTORS, DataType::Utf8, true),
    ]);

    let indices = UInt32Array::from_iter_values(accs.iter().map(|a| a.first_row as u32));
    let mut columns: Vec<ArrayRef> = aid
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &indices, None))
        .collect::<Result<_, _>>()?;

    columns.push(Arc::new(Int32Array::from(vec![year; accs.len()])));
    columns.push(Arc::new(Float64Array::from_iter_values(accs.iter().map(|a| a.nominal))));
    columns.push(Arc::new(Float64Array::from_iter_values(accs.iter().map(|a| a.aid_element))));
    columns.push(Arc::new(Int64Array::from_iter_values(
        accs.iter().map(|a| a.component_ids.len() as i64),
    )));
    columns.push(Arc::new(Int64Array::from_iter_values(accs.iter().map(|a| a.instruments))));
    columns.push(Arc::new(StringArray::from_iter(accs.iter().map(|a| join_sorted(&a.codes)))));
    columns.push(Arc::new(StringArray::from_iter(accs.iter().map(|a| join_sorted(&a.sectors)))));

    let schema = Schema::new(fields);
    Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
}
