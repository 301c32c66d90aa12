//! Row types for the three RNA entities and their canonical Arrow schemas.
//!
//! Fragments on disk never carry the partition column: the year lives in the
//! `ANNO=<year>` directory name and is re-attached when a partition is read.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use thiserror::Error;

/// Version of the canonical fragment layout, stamped into every fragment.
pub const SCHEMA_VERSION: &str = "1";
pub const SCHEMA_VERSION_KEY: &str = "rna.schema_version";

/// Default name of the year partition column / directory key.
pub const PARTITION_COLUMN: &str = "ANNO";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entity {
    Aiuti,
    Componenti,
    Strumenti,
}

impl Entity {
    pub const ALL: [Entity; 3] = [Entity::Aiuti, Entity::Componenti, Entity::Strumenti];

    /// Directory name of the entity's dataset root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Entity::Aiuti => "aiuti",
            Entity::Componenti => "componenti",
            Entity::Strumenti => "strumenti",
        }
    }

    /// Canonical fragment schema (without the partition column).
    pub fn schema(self) -> SchemaRef {
        let fields = match self {
            Entity::Aiuti => utf8_fields(AID_COLUMNS),
            Entity::Componenti => utf8_fields(COMPONENT_COLUMNS),
            Entity::Strumenti => {
                let mut fields = utf8_fields(&INSTRUMENT_COLUMNS[..3]);
                fields.push(Field::new("ELEMENTO_DI_AIUTO", DataType::Float64, true));
                fields.push(Field::new("IMPORTO_NOMINALE", DataType::Float64, true));
                fields
            }
        };
        let metadata = HashMap::from([(
            SCHEMA_VERSION_KEY.to_string(),
            SCHEMA_VERSION.to_string(),
        )]);
        Arc::new(Schema::new_with_metadata(fields, metadata))
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Error)]
#[error("unknown table {0:?} (expected aiuti, componenti or strumenti)")]
pub struct UnknownEntity(String);

impl FromStr for Entity {
    type Err = UnknownEntity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aiuti" => Ok(Entity::Aiuti),
            "componenti" => Ok(Entity::Componenti),
            "strumenti" => Ok(Entity::Strumenti),
            _ => Err(UnknownEntity(s.to_string())),
        }
    }
}

pub const AID_COLUMNS: &[&str] = &[
    "CAR",
    "TITOLO_MISURA",
    "DES_TIPO_MISURA",
    "BASE_GIURIDICA_NAZIONALE",
    "CODICE_FISCALE_BENEFICIARIO",
    "DENOMINAZIONE_BENEFICIARIO",
    "REGIONE_BENEFICIARIO",
    "TITOLO_PROGETTO",
    "COR",
    "DATA_CONCESSIONE",
    "FILE_SOURCE",
];

pub const COMPONENT_COLUMNS: &[&str] = &[
    "ID_COMPONENTE_AIUTO",
    "CAR_AIUTO",
    "COR_AIUTO",
    "COD_PROCEDIMENTO",
    "DES_PROCEDIMENTO",
    "COD_REGOLAMENTO",
    "DES_REGOLAMENTO",
    "COD_OBIETTIVO",
    "DES_OBIETTIVO",
    "SETTORE_ATTIVITA",
];

pub const INSTRUMENT_COLUMNS: &[&str] = &[
    "ID_COMPONENTE_AIUTO",
    "COD_STRUMENTO",
    "DES_STRUMENTO",
    "ELEMENTO_DI_AIUTO",
    "IMPORTO_NOMINALE",
];

fn utf8_fields(names: &[&str]) -> Vec<Field> {
    names
        .iter()
        .map(|name| Field::new(*name, DataType::Utf8, true))
        .collect()
}

// ─────────────────────────────────────────────────────────────
//  ROWS
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AidRow {
    pub car: Option<String>,
    pub titolo_misura: Option<String>,
    pub des_tipo_misura: Option<String>,
    pub base_giuridica_nazionale: Option<String>,
    pub codice_fiscale_beneficiario: Option<String>,
    pub denominazione_beneficiario: Option<String>,
    pub regione_beneficiario: Option<String>,
    pub titolo_progetto: Option<String>,
    pub cor: Option<String>,
    pub data_concessione: Option<String>,
    pub anno: i32,
    pub file_source: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentRow {
    pub id_componente_aiuto: Option<String>,
    pub car_aiuto: Option<String>,
    pub cor_aiuto: Option<String>,
    pub cod_procedimento: Option<String>,
    pub des_procedimento: Option<String>,
    pub cod_regolamento: Option<String>,
    pub des_regolamento: Option<String>,
    pub cod_obiettivo: Option<String>,
    pub des_obiettivo: Option<String>,
    pub settore_attivita: Option<String>,
    pub anno: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentRow {
    pub id_componente_aiuto: Option<String>,
    pub cod_strumento: Option<String>,
    pub des_strumento: Option<String>,
    pub elemento_di_aiuto: f64,
    pub importo_nominale: f64,
    pub anno: i32,
}

/// A row type that can be partitioned by year and turned into a fragment.
pub trait EntityRow {
    const ENTITY: Entity;

    fn anno(&self) -> i32;

    /// Columnar form of `rows` in the entity's canonical schema.
    fn to_batch(rows: &[&Self]) -> Result<RecordBatch, ArrowError>
    where
        Self: Sized;
}

// --- Helper macro for nullable string columns ---
macro_rules! build_string {
    ($rows:expr, $name:ident) => {{
        let mut b = StringBuilder::with_capacity($rows.len(), $rows.len() * 16);
        for r in $rows {
            match &r.$name {
                Some(v) => b.append_value(v),
                None => b.append_null(),
            }
        }
        Arc::new(b.finish()) as ArrayRef
    }};
}

// --- Helper macro for always-present f64 columns ---
macro_rules! build_f64 {
    ($rows:expr, $name:ident) => {{
        let mut b = Float64Builder::with_capacity($rows.len());
        for r in $rows {
            b.append_value(r.$name);
        }
        Arc::new(b.finish()) as ArrayRef
    }};
}

impl EntityRow for AidRow {
    const ENTITY: Entity = Entity::Aiuti;

    fn anno(&self) -> i32 {
        self.anno
    }

    fn to_batch(rows: &[&Self]) -> Result<RecordBatch, ArrowError> {
        let mut file_source = StringBuilder::with_capacity(rows.len(), rows.len() * 24);
        for r in rows {
            file_source.append_value(&r.file_source);
        }

        let arrays: Vec<ArrayRef> = vec![
            build_string!(rows, car),
            build_string!(rows, titolo_misura),
            build_string!(rows, des_tipo_misura),
            build_string!(rows, base_giuridica_nazionale),
            build_string!(rows, codice_fiscale_beneficiario),
            build_string!(rows, denominazione_beneficiario),
            build_string!(rows, regione_beneficiario),
            build_string!(rows, titolo_progetto),
            build_string!(rows, cor),
            build_string!(rows, data_concessione),
            Arc::new(file_source.finish()),
        ];
        RecordBatch::try_new(Self::ENTITY.schema(), arrays)
    }
}

impl EntityRow for ComponentRow {
    const ENTITY: Entity = Entity::Componenti;

    fn anno(&self) -> i32 {
        self.anno
    }

    fn to_batch(rows: &[&Self]) -> Result<RecordBatch, ArrowError> {
        let arrays: Vec<ArrayRef> = vec![
            build_string!(rows, id_componente_aiuto),
            build_string!(rows, car_aiuto),
            build_string!(rows, cor_aiuto),
            build_string!(rows, cod_procedimento),
            build_string!(rows, des_procedimento),
            build_string!(rows, cod_regolamento),
            build_string!(rows, des_regolamento),
            build_string!(rows, cod_obiettivo),
            build_string!(rows, des_obiettivo),
            build_string!(rows, settore_attivita),
        ];
        RecordBatch::try_new(Self::ENTITY.schema(), arrays)
    }
}

impl EntityRow for InstrumentRow {
    const ENTITY: Entity = Entity::Strumenti;

    fn anno(&self) -> i32 {
        self.anno
    }

    fn to_batch(rows: &[&Self]) -> Result<RecordBatch, ArrowError> {
        let arrays: Vec<ArrayRef> = vec![
            build_string!(rows, id_componente_aiuto),
            build_string!(rows, cod_strumento),
            build_string!(rows, des_strumento),
            build_f64!(rows, elemento_di_aiuto),
            build_f64!(rows, importo_nominale),
        ];
        RecordBatch::try_new(Self::ENTITY.schema(), arrays)
    }
}
