use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use rna_etl::export::{export_table, preview, Predicate};
use rna_etl::{collect_xml_files, ingest_files, AggregateOptions, Aggregator, Dataset, Entity, PipelineConfig};

const FAILURES_FILE: &str = "failures.txt";

#[derive(Debug, Parser)]
#[command(name = "rna-etl", version, about = "RNA aid registry XML to partitioned Parquet")]
struct Cli {
    /// TOML config file (defaults to ./rna_etl.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for daily rolling log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse XML files into the partitioned Parquet datasets
    Parse(ParseArgs),
    /// Export one table to a delimited text file
    Export(ExportArgs),
    /// Join the three tables and write one summary CSV per year
    ExportAggregated(AggregatedArgs),
    /// Print the first rows of a table, optionally filtered
    Query(QueryArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// An XML file or a directory searched recursively for *.xml
    #[arg(long)]
    input: PathBuf,
    /// Dataset root; it is cleared before ingestion
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Csv,
    Txt,
}

impl Format {
    fn default_delimiter(self) -> char {
        match self {
            Format::Csv => ',',
            Format::Txt => '\t',
        }
    }
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    table: Entity,
    #[arg(long)]
    output: PathBuf,
    #[arg(long, value_enum, default_value_t = Format::Csv)]
    format: Format,
    /// Field delimiter; defaults to ',' for csv and TAB for txt
    #[arg(long)]
    delimiter: Option<char>,
}

#[derive(Debug, Args)]
struct AggregatedArgs {
    /// `<dir>/<stem>.csv`; one `<dir>/<stem>_<year>.csv` is written per year
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value_t = ',')]
    delimiter: char,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    table: Entity,
    /// COLUMN=VALUE, may be repeated
    #[arg(long = "filter")]
    filters: Vec<Predicate>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if cli.log_dir.is_some() {
        config.log_dir = cli.log_dir.clone();
    }
    let _guard = rna_etl::log::init(config.log_dir.as_deref());

    match cli.command {
        Commands::Parse(args) => run_parse(args, config),
        Commands::Export(args) => run_export(args, &config),
        Commands::ExportAggregated(args) => run_export_aggregated(args, &config),
        Commands::Query(args) => run_query(args, &config),
    }
}

fn delimiter_byte(c: char) -> Result<u8> {
    if !c.is_ascii() {
        bail!("delimiter {c:?} must be a single ASCII character");
    }
    Ok(c as u8)
}

fn dataset(config: &PipelineConfig) -> Dataset {
    Dataset::new(&config.dataset_root, &config.partition_key)
}

// ─────────────────────────────────────────────
// parse
// ─────────────────────────────────────────────
fn run_parse(args: ParseArgs, mut config: PipelineConfig) -> Result<()> {
    if let Some(output) = args.output {
        config.dataset_root = output;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;

    let files = collect_xml_files(&args.input)?;
    if files.is_empty() {
        warn!(input = %args.input.display(), "no xml files found");
        return Ok(());
    }

    clear_output(&config.dataset_root)?;
    info!(
        files = files.len(),
        workers = config.workers,
        output = %config.dataset_root.display(),
        "starting ingestion"
    );

    let progress = ProgressBar::new(files.len() as u64);
    progress.set_style(ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len:5} files ({eta}) {msg}",
    )?);
    let summary = ingest_files(&files, &config, |path, _| {
        progress.set_message(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        progress.inc(1);
    })?;
    progress.finish_and_clear();

    println!(
        "aiuti: {}  componenti: {}  strumenti: {}  (files: {}, skipped records: {})",
        summary.totals.aiuti,
        summary.totals.componenti,
        summary.totals.strumenti,
        summary.files,
        summary.skipped_records
    );
    if summary.failed_flushes > 0 {
        warn!(failed_flushes = summary.failed_flushes, "some batches could not be written");
    }
    if !summary.failed_files.is_empty() {
        let report = write_failures(&config.dataset_root, &summary.failed_files)?;
        warn!(
            failed = summary.failed_files.len(),
            report = %report.display(),
            "some files failed"
        );
    }
    Ok(())
}

fn clear_output(root: &Path) -> Result<()> {
    if root.exists() {
        fs::remove_dir_all(root).with_context(|| format!("cannot clear {}", root.display()))?;
    }
    fs::create_dir_all(root).with_context(|| format!("cannot create {}", root.display()))?;
    Ok(())
}

/// Writes `failures.txt` next to the dataset root.
fn write_failures(root: &Path, failed: &[(PathBuf, String)]) -> Result<PathBuf> {
    let dir = root
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let path = dir.join(FAILURES_FILE);
    let body: String = failed
        .iter()
        .map(|(file, reason)| format!("{}\t{}\n", file.display(), reason))
        .collect();
    fs::write(&path, body).with_context(|| format!("cannot write {}", path.display()))?;
    Ok(path)
}

// ─────────────────────────────────────────────
// export / export-aggregated / query
// ─────────────────────────────────────────────
fn run_export(args: ExportArgs, config: &PipelineConfig) -> Result<()> {
    let delimiter = delimiter_byte(args.delimiter.unwrap_or(args.format.default_delimiter()))?;
    let rows = export_table(&dataset(config), args.table, &args.output, delimiter)
        .with_context(|| format!("exporting {}", args.table))?;
    println!("{rows} rows written to {}", args.output.display());
    Ok(())
}

fn run_export_aggregated(args: AggregatedArgs, config: &PipelineConfig) -> Result<()> {
    let options = AggregateOptions::from_output_path(&args.output, delimiter_byte(args.delimiter)?);
    let dataset = dataset(config);
    let summary = Aggregator::new(&dataset, options).run()?;

    for path in &summary.written {
        println!("{}", path.display());
    }
    if !summary.failed_years.is_empty() {
        let years: Vec<String> = summary.failed_years.iter().map(|(y, _)| y.to_string()).collect();
        warn!(years = %years.join(", "), "some years were not exported; see errors above");
    }
    Ok(())
}

fn run_query(args: QueryArgs, config: &PipelineConfig) -> Result<()> {
    let batches = preview(&dataset(config), args.table, &args.filters, args.limit)?;
    arrow::util::pretty::print_batches(&batches)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rna_etl::schema::AidRow;
    use rna_etl::writer::PartitionedWriter;
    use tempfile::tempdir;

    #[test]
    fn failed_years_do_not_fail_the_aggregated_export() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            dataset_root: dir.path().join("parquet"),
            ..Default::default()
        };
        let store = dataset(&config);
        let row = |anno| AidRow {
            car: Some(format!("CAR{anno}")),
            anno,
            file_source: "a.xml".into(),
            ..Default::default()
        };
        PartitionedWriter::new(store.clone())
            .append(&[row(2021), row(2022)])
            .unwrap();
        fs::write(
            store.partition_dir(Entity::Aiuti, 2021).join("zz-bad.parquet"),
            b"not parquet",
        )
        .unwrap();

        let args = AggregatedArgs {
            output: dir.path().join("agg.csv"),
            delimiter: ',',
        };
        run_export_aggregated(args, &config).unwrap();

        assert!(dir.path().join("agg_2022.csv").is_file());
        assert!(!dir.path().join("agg_2021.csv").exists());
    }
}
