use std::process::ExitCode;

use chrono::{Datelike, Utc};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use bts_ingest::clock::SystemClock;
use bts_ingest::config::{ConfigLoader, PipelineConfig};
use bts_ingest::domain::{Dataset, Quarter, WorkUnit, units_in_range, validate_year};
use bts_ingest::error::IngestError;
use bts_ingest::form::{FormSession, SessionSettings};
use bts_ingest::manifest::publish_manifest;
use bts_ingest::object_store::{ObjectStore, open_store};
use bts_ingest::output::{
    FetchResult, HumanOutput, JsonOutput, OutputMode, StatusEntry, StatusResult,
};
use bts_ingest::processor::{Pipeline, ProcessOptions, ProcessUnit};
use bts_ingest::progress::{ProgressOracle, new_invocation_id};
use bts_ingest::scheduler::advance;
use bts_ingest::store::LocalLayout;
use bts_ingest::transport::HttpFormTransport;

#[derive(Parser)]
#[command(name = "bts-ingest")]
#[command(about = "Resumable ingestion of BTS T-100 / DB1B extracts into blob storage")]
#[command(version)]
struct Cli {
    /// JSON config file (default: ./bts-ingest.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true, value_enum)]
    dataset: Option<Dataset>,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch one year, one quarter or all four")]
    Fetch(FetchArgs),
    #[command(about = "Advance a year range by up to --max-units pending quarters")]
    Backfill(BackfillArgs),
    #[command(about = "Show which quarters in a range are done")]
    Status(RangeArgs),
    #[command(about = "Rebuild manifests/index.json from curated objects")]
    Manifest(ManifestArgs),
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long)]
    year: i32,

    /// 1..=4, Q1..Q4 or "all"
    #[arg(long, default_value = "all")]
    quarter: String,

    #[arg(long)]
    geo: Option<String>,
}

#[derive(Args)]
struct BackfillArgs {
    #[arg(long)]
    start: i32,

    #[arg(long)]
    end: i32,

    #[arg(long)]
    max_units: Option<usize>,

    #[arg(long)]
    geo: Option<String>,
}

#[derive(Args)]
struct RangeArgs {
    #[arg(long)]
    start: i32,

    #[arg(long)]
    end: i32,
}

#[derive(Args)]
struct ManifestArgs {
    #[arg(long)]
    start: i32,

    /// Defaults to the current year
    #[arg(long)]
    end: Option<i32>,
}

type HttpPipeline = Pipeline<HttpFormTransport, SystemClock, Box<dyn ObjectStore>>;

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error {
        IngestError::InvalidYear(_)
        | IngestError::InvalidQuarter(_)
        | IngestError::InvalidDataset(_)
        | IngestError::InvalidRange { .. }
        | IngestError::ConfigRead(_)
        | IngestError::ConfigParse(_)
        | IngestError::ConfigValue(_)
        | IngestError::NotOffered { .. } => 2,
        IngestError::Http(_)
        | IngestError::HttpStatus { .. }
        | IngestError::DownloadExhausted { .. }
        | IngestError::NotAForm(_)
        | IngestError::UnexpectedContentType { .. }
        | IngestError::DeadlineExceeded { .. }
        | IngestError::ObjectStore(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(dataset) = cli.dataset {
        config.dataset = dataset;
    }

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, &config, output_mode),
        Commands::Backfill(args) => run_backfill(args, &config, output_mode),
        Commands::Status(args) => run_status(args, &config, output_mode),
        Commands::Manifest(args) => run_manifest(args, &config, output_mode),
    }
}

fn build_pipeline(config: &PipelineConfig) -> Result<HttpPipeline, IngestError> {
    let layout = LocalLayout::from_config(config)?;
    let transport = HttpFormTransport::new(config.dataset, config.connect_timeout())?;
    let session = FormSession::new(
        transport,
        SystemClock,
        SessionSettings::from_config(config),
        layout.clone(),
    );
    let store = open_store(config)?;
    let options = ProcessOptions::from_config(config, new_invocation_id());
    Ok(Pipeline::new(
        session,
        store,
        layout,
        config.dataset,
        config.container().to_string(),
        options,
    ))
}

fn run_fetch(
    args: FetchArgs,
    config: &PipelineConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let year = validate_year(args.year)?;
    let quarters: Vec<Quarter> = if args.quarter.eq_ignore_ascii_case("all") {
        Quarter::ALL.to_vec()
    } else {
        vec![args.quarter.parse()?]
    };
    let geography = args.geo.unwrap_or_else(|| config.geography.clone());

    let pipeline = build_pipeline(config)?;
    let reports = quarters
        .into_iter()
        .map(|quarter| pipeline.process(&WorkUnit { year, quarter }, &geography))
        .collect();
    let result = FetchResult { year, reports };

    match output_mode {
        OutputMode::Json => JsonOutput::print_fetch(&result).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_reports(&result.reports),
    }
    Ok(())
}

fn run_backfill(
    args: BackfillArgs,
    config: &PipelineConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let geography = args.geo.unwrap_or_else(|| config.geography.clone());
    let max_units = args.max_units.unwrap_or(config.max_units_per_invocation);

    let pipeline = build_pipeline(config)?;
    let result = advance(
        &pipeline.oracle(),
        &pipeline,
        args.start,
        args.end,
        &geography,
        max_units,
    )?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_backfill(&result).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_backfill(&result),
    }
    Ok(())
}

fn run_status(
    args: RangeArgs,
    config: &PipelineConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let start = validate_year(args.start)?;
    let end = validate_year(args.end)?;
    if start > end {
        return Err(IngestError::InvalidRange { start, end }.into());
    }

    let layout = LocalLayout::from_config(config)?;
    let store = open_store(config)?;
    let oracle =
        bts_ingest::progress::StoreProgressOracle::new(&layout, store.as_ref(), config.container());
    let units: Vec<StatusEntry> = units_in_range(start, end)
        .map(|unit| StatusEntry {
            done: oracle.is_done(&unit),
            unit,
        })
        .collect();
    let done = units.iter().filter(|entry| entry.done).count();
    let result = StatusResult {
        start,
        end,
        done,
        pending: units.len() - done,
        units,
    };

    match output_mode {
        OutputMode::Json => JsonOutput::print_status(&result).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_status(&result),
    }
    Ok(())
}

fn run_manifest(
    args: ManifestArgs,
    config: &PipelineConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let end = args.end.unwrap_or_else(|| Utc::now().year());
    let store = open_store(config)?;
    let manifest = publish_manifest(store.as_ref(), config.container(), args.start, end)?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_manifest(&manifest).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_manifest(&manifest),
    }
    Ok(())
}
