use std::fs;

use arrow::array::{Array, AsArray};
use arrow::datatypes::Int32Type;
use rna_etl::export::{export_table, preview, Predicate};
use rna_etl::schema::InstrumentRow;
use rna_etl::writer::PartitionedWriter;
use rna_etl::{Dataset, Entity};
use tempfile::tempdir;

fn instrument(component: &str, code: &str, nominal: f64, anno: i32) -> InstrumentRow {
    InstrumentRow {
        id_componente_aiuto: Some(component.into()),
        cod_strumento: Some(code.into()),
        importo_nominale: nominal,
        anno,
        ..Default::default()
    }
}

fn seeded(root: &std::path::Path) -> Dataset {
    let dataset = Dataset::new(root, "ANNO");
    PartitionedWriter::new(dataset.clone())
        .append(&[
            instrument("C1", "S1", 100.0, 2021),
            instrument("C2", "S2", 200.0, 2022),
            instrument("C3", "S1", 300.0, 2022),
        ])
        .unwrap();
    dataset
}

#[test]
fn table_export_reattaches_the_year_column() {
    let dir = tempdir().unwrap();
    let dataset = seeded(&dir.path().join("parquet"));
    let out = dir.path().join("dump").join("strumenti.txt");

    let rows = export_table(&dataset, Entity::Strumenti, &out, b'\t').unwrap();

    assert_eq!(rows, 3);
    let text = fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines[0],
        "ID_COMPONENTE_AIUTO\tCOD_STRUMENTO\tDES_STRUMENTO\tELEMENTO_DI_AIUTO\tIMPORTO_NOMINALE\tANNO"
    );
    assert_eq!(lines.len(), 4);
    assert!(lines[1].starts_with("C1\tS1\t"));
    assert!(lines[1].ends_with("\t2021"));
}

#[test]
fn empty_table_still_gets_a_header() {
    let dir = tempdir().unwrap();
    let dataset = Dataset::new(dir.path().join("none"), "ANNO");
    let out = dir.path().join("aiuti.csv");

    assert_eq!(export_table(&dataset, Entity::Aiuti, &out, b',').unwrap(), 0);
    let text = fs::read_to_string(&out).unwrap();
    assert_eq!(text.lines().count(), 1);
    assert!(text.starts_with("CAR,"));
    assert!(text.trim_end().ends_with(",ANNO"));
}

#[test]
fn preview_filters_with_typed_predicates_and_limits() {
    let dir = tempdir().unwrap();
    let dataset = seeded(&dir.path().join("parquet"));

    let filters: Vec<Predicate> = vec!["COD_STRUMENTO=S1".parse().unwrap()];
    let batches = preview(&dataset, Entity::Strumenti, &filters, 10).unwrap();
    let total: usize = batches.iter().map(|b| b.num_rows()).sum();
    assert_eq!(total, 2);

    let filters: Vec<Predicate> = vec![
        "COD_STRUMENTO=S1".parse().unwrap(),
        "ANNO=2022".parse().unwrap(),
    ];
    let batches = preview(&dataset, Entity::Strumenti, &filters, 10).unwrap();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.num_rows(), 1);
    assert_eq!(batch.column_by_name("ID_COMPONENTE_AIUTO").unwrap().as_string::<i32>().value(0), "C3");
    let year = batch.column_by_name("ANNO").unwrap().as_primitive::<Int32Type>();
    assert_eq!(year.value(0), 2022);
    assert_eq!(year.null_count(), 0);

    let limited = preview(&dataset, Entity::Strumenti, &[], 2).unwrap();
    assert_eq!(limited.iter().map(|b| b.num_rows()).sum::<usize>(), 2);
}

#[test]
fn preview_rejects_unknown_columns_and_untyped_values() {
    let dir = tempdir().unwrap();
    let dataset = seeded(&dir.path().join("parquet"));

    let unknown: Vec<Predicate> = vec!["NOPE=1".parse().unwrap()];
    assert!(preview(&dataset, Entity::Strumenti, &unknown, 5).is_err());

    let untyped: Vec<Predicate> = vec!["IMPORTO_NOMINALE=lots".parse().unwrap()];
    assert!(preview(&dataset, Entity::Strumenti, &untyped, 5).is_err());

    let numeric: Vec<Predicate> = vec!["IMPORTO_NOMINALE=300".parse().unwrap()];
    let batches = preview(&dataset, Entity::Strumenti, &numeric, 5).unwrap();
    assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 1);
}
