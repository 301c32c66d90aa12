use std::collections::HashMap;
use std::fs;
use std::path::Path;

use arrow::array::{Array, Float64Array, Int64Array, StringArray};
use rna_etl::schema::{AidRow, ComponentRow, InstrumentRow};
use rna_etl::writer::PartitionedWriter;
use rna_etl::{AggregateOptions, Aggregator, Dataset, Entity};
use tempfile::tempdir;

fn aid(car: &str, cor: &str, anno: i32) -> AidRow {
    AidRow {
        car: Some(car.into()),
        cor: Some(cor.into()),
        denominazione_beneficiario: Some(format!("Impresa {car}")),
        data_concessione: Some(format!("{anno}-01-15")),
        anno,
        file_source: "fixture.xml".into(),
        ..Default::default()
    }
}

fn component(id: &str, car: &str, cor: &str, sector: &str, anno: i32) -> ComponentRow {
    ComponentRow {
        id_componente_aiuto: Some(id.into()),
        car_aiuto: Some(car.into()),
        cor_aiuto: Some(cor.into()),
        settore_attivita: Some(sector.into()),
        anno,
        ..Default::default()
    }
}

fn instrument(component: &str, code: &str, nominal: f64, element: f64, anno: i32) -> InstrumentRow {
    InstrumentRow {
        id_componente_aiuto: Some(component.into()),
        cod_strumento: Some(code.into()),
        importo_nominale: nominal,
        elemento_di_aiuto: element,
        anno,
        ..Default::default()
    }
}

/// Year 2022 has all three tables; 2021 only has aid records.
fn fixture(root: &Path) -> Dataset {
    let dataset = Dataset::new(root, "ANNO");
    let writer = PartitionedWriter::new(dataset.clone());
    writer
        .append(&[
            aid("CAR1", "COR1", 2022),
            aid("CAR2", "COR2", 2022),
            aid("CAR3", "COR3", 2021),
            aid("CAR4", "COR4", 2021),
        ])
        .unwrap();
    writer
        .append(&[
            component("C1", "CAR1", "COR1", "A.1", 2022),
            component("C2", "CAR1", "COR1", "B.2", 2022),
            component("C3", "CAR2", "COR2", "A.1", 2022),
        ])
        .unwrap();
    writer
        .append(&[
            instrument("C1", "S1", 100.0, 10.0, 2022),
            instrument("C1", "S2", 50.0, 5.0, 2022),
            instrument("C2", "S1", 200.0, 20.0, 2022),
            instrument("C3", "S3", 300.0, 30.0, 2022),
            instrument("C9", "S9", 999.0, 99.0, 2022),
        ])
        .unwrap();
    dataset
}

/// Rows of a delimited file keyed by `CAR`, each as column -> value.
fn read_rows(path: &Path, delimiter: char) -> HashMap<String, HashMap<String, String>> {
    let text = fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    let header: Vec<String> = lines
        .next()
        .unwrap()
        .split(delimiter)
        .map(str::to_string)
        .collect();
    lines
        .map(|line| {
            let row: HashMap<String, String> = header
                .iter()
                .cloned()
                .zip(line.split(delimiter).map(str::to_string))
                .collect();
            (row["CAR"].clone(), row)
        })
        .collect()
}

#[test]
fn joins_and_aggregates_each_year() {
    let dir = tempdir().unwrap();
    let dataset = fixture(&dir.path().join("parquet"));
    let out = dir.path().join("out").join("aiuti.csv");

    let summary = Aggregator::new(&dataset, AggregateOptions::from_output_path(&out, b';'))
        .run()
        .unwrap();

    assert!(summary.failed_years.is_empty());
    assert_eq!(
        summary.written,
        vec![
            dir.path().join("out/aiuti_2021.csv"),
            dir.path().join("out/aiuti_2022.csv"),
        ]
    );

    let rows = read_rows(&summary.written[1], ';');
    assert_eq!(rows.len(), 2);
    let car1 = &rows["CAR1"];
    assert_eq!(car1["IMPORTO_NOMINALE_TOTALE"].parse::<f64>().unwrap(), 350.0);
    assert_eq!(car1["ELEMENTO_DI_AIUTO_TOTALE"].parse::<f64>().unwrap(), 35.0);
    assert_eq!(car1["NUM_COMPONENTI"], "2");
    assert_eq!(car1["NUM_STRUMENTI"], "3");
    assert_eq!(car1["COD_STRUMENTI"], "S1|S2");
    assert_eq!(car1["SETTORI_ATTIVITA"], "A.1|B.2");
    assert_eq!(car1["ANNO"], "2022");

    let car2 = &rows["CAR2"];
    assert_eq!(car2["IMPORTO_NOMINALE_TOTALE"].parse::<f64>().unwrap(), 300.0);
    assert_eq!(car2["NUM_COMPONENTI"], "1");
    assert_eq!(car2["NUM_STRUMENTI"], "1");
    assert_eq!(car2["COD_STRUMENTI"], "S3");
}

#[test]
fn year_without_components_keeps_every_aid_record() {
    let dir = tempdir().unwrap();
    let dataset = fixture(&dir.path().join("parquet"));
    let options = AggregateOptions::from_output_path(&dir.path().join("agg.csv"), b',');

    let batch = Aggregator::new(&dataset, options).aggregate_year(2021).unwrap();
    assert_eq!(batch.num_rows(), 2);

    let summary = Aggregator::new(
        &dataset,
        AggregateOptions::from_output_path(&dir.path().join("agg.csv"), b','),
    )
    .run()
    .unwrap();
    let rows = read_rows(&summary.written[0], ',');
    for car in ["CAR3", "CAR4"] {
        let row = &rows[car];
        assert_eq!(row["NUM_COMPONENTI"], "0");
        assert_eq!(row["NUM_STRUMENTI"], "0");
        assert_eq!(row["IMPORTO_NOMINALE_TOTALE"].parse::<f64>().unwrap(), 0.0);
        assert_eq!(row["COD_STRUMENTI"], "");
        assert_eq!(row["SETTORI_ATTIVITA"], "");
    }
}

#[test]
fn instruments_without_components_are_not_joined() {
    let dir = tempdir().unwrap();
    let dataset = Dataset::new(dir.path(), "ANNO");
    let writer = PartitionedWriter::new(dataset.clone());
    writer.append(&[aid("CAR1", "COR1", 2023)]).unwrap();
    writer
        .append(&[instrument("C1", "S1", 100.0, 10.0, 2023)])
        .unwrap();
    assert!(!dataset.has_partition(Entity::Componenti, 2023));

    let options = AggregateOptions::from_output_path(&dir.path().join("x.csv"), b',');
    let batch = Aggregator::new(&dataset, options).aggregate_year(2023).unwrap();

    assert_eq!(batch.num_rows(), 1);
    let column = |name: &str| batch.column_by_name(name).unwrap().clone();
    let instruments = column("NUM_STRUMENTI");
    let instruments = instruments.as_any().downcast_ref::<Int64Array>().unwrap();
    assert_eq!(instruments.value(0), 0);
    let nominal = column("IMPORTO_NOMINALE_TOTALE");
    let nominal = nominal.as_any().downcast_ref::<Float64Array>().unwrap();
    assert_eq!(nominal.value(0), 0.0);
    let codes = column("COD_STRUMENTI");
    let codes = codes.as_any().downcast_ref::<StringArray>().unwrap();
    assert!(codes.is_null(0));
}

#[test]
fn null_join_keys_never_match() {
    let dir = tempdir().unwrap();
    let dataset = Dataset::new(dir.path(), "ANNO");
    let writer = PartitionedWriter::new(dataset.clone());
    let mut orphan = aid("CAR1", "COR1", 2022);
    orphan.cor = None;
    writer.append(&[orphan]).unwrap();
    let mut loose = component("C1", "CAR1", "COR1", "A.1", 2022);
    loose.cor_aiuto = None;
    writer.append(&[loose]).unwrap();

    let options = AggregateOptions::from_output_path(&dir.path().join("x.csv"), b',');
    let batch = Aggregator::new(&dataset, options).aggregate_year(2022).unwrap();

    let num = batch
        .column_by_name("NUM_COMPONENTI")
        .unwrap()
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    assert_eq!(num.value(0), 0);
}

#[test]
fn a_broken_year_does_not_stop_the_others() {
    let dir = tempdir().unwrap();
    let dataset = fixture(&dir.path().join("parquet"));
    fs::write(
        dataset
            .partition_dir(Entity::Aiuti, 2021)
            .join("zz-corrupt.parquet"),
        b"definitely not parquet",
    )
    .unwrap();

    let out = dir.path().join("out.csv");
    let summary = Aggregator::new(&dataset, AggregateOptions::from_output_path(&out, b','))
        .run()
        .unwrap();

    assert_eq!(summary.written, vec![dir.path().join("out_2022.csv")]);
    assert_eq!(summary.failed_years.len(), 1);
    assert_eq!(summary.failed_years[0].0, 2021);
    assert!(!dir.path().join("out_2021.csv").exists());
}

#[test]
fn empty_dataset_writes_nothing() {
    let dir = tempdir().unwrap();
    let dataset = Dataset::new(dir.path().join("missing"), "ANNO");
    let out = dir.path().join("out").join("agg.csv");
    let summary = Aggregator::new(&dataset, AggregateOptions::from_output_path(&out, b','))
        .run()
        .unwrap();
    assert!(summary.written.is_empty());
    assert!(summary.failed_years.is_empty());
    assert!(!dir.path().join("out").exists());
}
