use codev_attribution::expander::{AttributeExpander, DEFAULT_DELIMITER};
use codev_attribution::schema::ACTORS;
use codev_attribution::sink::{CsvDirectorySink, JsonReportSink, ReportSink};
use codev_attribution::source::{actors_from_frame, read_csv_frame};
use codev_attribution::{AttributionEngine, CsvSource, DataSource, ReportPlan};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use polars::prelude::*;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codev-attribution")]
#[command(about = "Fractional attribution of co-development credit to countries, sectors and organizations")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// One CSV file per section
    Csv,
    /// A single report.json
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every table of a report plan
    Run {
        /// Report plan JSON (or set CODEV_PLAN)
        #[arg(short, long)]
        plan: Option<PathBuf>,

        /// Contribution events CSV: actor_id, unit_id, period
        #[arg(short, long)]
        events: PathBuf,

        /// Actor attributes CSV: actor_id, country, sector, organization
        #[arg(short, long)]
        actors: PathBuf,

        /// Output directory (default: ./report)
        #[arg(short, long, default_value = "report")]
        out: PathBuf,

        #[arg(long, value_enum, default_value = "csv")]
        format: OutputFormat,
    },
    /// Build every table with conservation and completeness checks, writing nothing
    Validate {
        /// Report plan JSON (or set CODEV_PLAN)
        #[arg(short, long)]
        plan: Option<PathBuf>,

        #[arg(short, long)]
        events: PathBuf,

        #[arg(short, long)]
        actors: PathBuf,
    },
    /// Dump expanded (actor_id, dimension, value) rows
    Expand {
        #[arg(short, long)]
        actors: PathBuf,

        /// Output CSV
        #[arg(short, long)]
        out: PathBuf,

        /// Label delimiter, a regular expression
        #[arg(short, long, default_value = DEFAULT_DELIMITER)]
        delimiter: String,
    },
}

fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run {
            plan,
            events,
            actors,
            out,
            format,
        } => run_plan(plan, events, actors, out, format),
        Commands::Validate { plan, events, actors } => validate_plan(plan, events, actors),
        Commands::Expand {
            actors,
            out,
            delimiter,
        } => expand_actors(actors, out, delimiter),
    }
}

fn load_plan(plan: Option<PathBuf>) -> Result<ReportPlan> {
    let path = plan
        .or_else(|| std::env::var("CODEV_PLAN").ok().map(PathBuf::from))
        .context("No report plan given: pass --plan or set CODEV_PLAN")?;
    ReportPlan::load(&path).with_context(|| format!("Failed to load plan {}", path.display()))
}

fn run_plan(
    plan: Option<PathBuf>,
    events: PathBuf,
    actors: PathBuf,
    out: PathBuf,
    format: OutputFormat,
) -> Result<()> {
    let plan = load_plan(plan)?;
    let source = CsvSource::new(&events, &actors);
    let data = source
        .load()
        .with_context(|| format!("Failed to load {} source data", source.name()))?;
    let engine = AttributionEngine::for_plan(&data, &plan)?;

    let mut sink: Box<dyn ReportSink> = match format {
        OutputFormat::Csv => Box::new(CsvDirectorySink::new(&out)),
        OutputFormat::Json => Box::new(JsonReportSink::new(out.join("report.json"))),
    };
    let written = engine
        .run_plan(&plan, sink.as_mut())
        .context("Report run failed")?;

    println!("\n{}", "=".repeat(80));
    println!(" Wrote {} tables to {}", written, out.display());
    println!("{}", "=".repeat(80));
    Ok(())
}

fn validate_plan(plan: Option<PathBuf>, events: PathBuf, actors: PathBuf) -> Result<()> {
    let mut plan = load_plan(plan)?;
    for table in &mut plan.tables {
        table.validate = true;
    }
    let source = CsvSource::new(&events, &actors);
    let data = source
        .load()
        .with_context(|| format!("Failed to load {} source data", source.name()))?;
    let engine = AttributionEngine::for_plan(&data, &plan)?;

    for config in &plan.tables {
        let table = engine.run(config)?;
        println!(" ok  {:<40} {} rows", config.title, table.rows.len());
    }
    info!(tables = plan.tables.len(), "all tables validated");
    Ok(())
}

fn expand_actors(actors: PathBuf, out: PathBuf, delimiter: String) -> Result<()> {
    let frame = read_csv_frame(&actors, &ACTORS)
        .with_context(|| format!("Failed to read {}", actors.display()))?;
    let records = actors_from_frame(&frame)?;
    let expander = AttributeExpander::new(&delimiter, Default::default())?;
    let expanded = expander.expand(&records);

    let mut df = expanded.to_dataframe()?;
    let mut file = std::fs::File::create(&out)
        .with_context(|| format!("Failed to create {}", out.display()))?;
    CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;

    info!(actors = expanded.len(), rows = df.height(), "expanded attributes");
    println!(" Expanded {} actors into {} rows at {}", expanded.len(), df.height(), out.display());
    Ok(())
}
