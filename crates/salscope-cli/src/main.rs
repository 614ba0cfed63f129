mod logging;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use salscope_core::{ListingInput, ListingKind};
use salscope_stats::GradeRegistry;
use salscope_sync::{load_grade_registry, open_service, save_grade_registry, SalscopeConfig};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "salscope")]
#[command(about = "Job-market salary store and aggregation")]
struct Cli {
    /// Overrides SALSCOPE_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Vacancy,
    Resume,
}

impl From<KindArg> for ListingKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Vacancy => ListingKind::Vacancy,
            KindArg::Resume => ListingKind::Resume,
        }
    }
}

#[derive(Debug, clap::Args)]
struct Selection {
    #[arg(long)]
    position: String,
    /// Inclusive lower bound, `YYYY-MM` or an ISO date.
    #[arg(long)]
    start: Option<String>,
    /// Inclusive upper bound, `YYYY-MM` or an ISO date.
    #[arg(long)]
    end: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(flatten)]
    Store(StoreCommand),
    /// Change one grade band and write the band file.
    UpdateGrade {
        #[arg(long)]
        grade: String,
        #[arg(long)]
        min: f64,
        #[arg(long)]
        max: f64,
        /// Defaults to SALSCOPE_GRADE_BANDS.
        #[arg(long)]
        bands_file: Option<PathBuf>,
    },
}

/// Commands that need the listing store.
#[derive(Debug, Subcommand)]
enum StoreCommand {
    /// Load a JSON array of listings.
    Ingest {
        #[arg(long, value_enum)]
        kind: KindArg,
        #[arg(long)]
        file: PathBuf,
    },
    Query {
        #[arg(long, value_enum)]
        kind: KindArg,
        #[command(flatten)]
        selection: Selection,
    },
    /// Histogram and per-bin percentiles; both kinds side by side when `--kind` is omitted.
    Distribution {
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        step: Option<f64>,
    },
    Grades {
        #[arg(long, value_enum)]
        kind: KindArg,
        #[command(flatten)]
        selection: Selection,
        /// Band override for this run only, `GRADE=MIN:MAX`. Repeatable.
        #[arg(long = "set", value_parser = parse_band_override)]
        overrides: Vec<BandOverride>,
    },
    Positions,
    /// Drop all positions and listings.
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Clone)]
struct BandOverride {
    grade: String,
    min: f64,
    max: f64,
}

fn parse_band_override(raw: &str) -> Result<BandOverride, String> {
    let (grade, bounds) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected GRADE=MIN:MAX, got `{raw}`"))?;
    let (min, max) = bounds
        .split_once(':')
        .ok_or_else(|| format!("expected MIN:MAX after `{grade}=`"))?;
    let number = |v: &str| {
        v.trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid bound `{v}`: {e}"))
    };
    Ok(BandOverride {
        grade: grade.trim().to_string(),
        min: number(min)?,
        max: number(max)?,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{text}");
    Ok(())
}

/// Apply one band change to the band file, creating it from defaults if needed.
fn update_band_file(
    config: &SalscopeConfig,
    grade: &str,
    min: f64,
    max: f64,
    bands_file: Option<PathBuf>,
) -> Result<GradeRegistry> {
    let path = bands_file
        .or_else(|| config.grade_bands_path.clone())
        .context("no grade band file: pass --bands-file or set SALSCOPE_GRADE_BANDS")?;
    let mut registry = if path.exists() {
        load_grade_registry(&path)?
    } else {
        GradeRegistry::default()
    };
    registry
        .update(grade, min, max)
        .with_context(|| format!("updating grade `{grade}`"))?;
    save_grade_registry(&path, &registry)?;
    info!(path = %path.display(), "grade bands saved");
    Ok(registry)
}

async fn run_store_command(config: &SalscopeConfig, command: StoreCommand) -> Result<()> {
    if let StoreCommand::Reset { yes: false } = command {
        bail!("refusing to drop every listing without --yes");
    }

    let mut service = open_service(config).await?;

    match command {
        StoreCommand::Ingest { kind, file } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let batch: Vec<ListingInput> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", file.display()))?;
            let summary = service.add_listings(kind.into(), batch).await?;
            print_json(&summary)?;
        }
        StoreCommand::Query { kind, selection } => {
            let listings = service
                .query_listings(
                    kind.into(),
                    &selection.position,
                    selection.start.as_deref(),
                    selection.end.as_deref(),
                )
                .await?;
            print_json(&listings)?;
        }
        StoreCommand::Distribution {
            kind: Some(kind),
            selection,
            step,
        } => {
            let listings = service
                .query_listings(
                    kind.into(),
                    &selection.position,
                    selection.start.as_deref(),
                    selection.end.as_deref(),
                )
                .await?;
            print_json(&service.compute_salary_distribution(&listings, step)?)?;
        }
        StoreCommand::Distribution {
            kind: None,
            selection,
            step,
        } => {
            let report = service
                .salary_report(
                    &selection.position,
                    selection.start.as_deref(),
                    selection.end.as_deref(),
                    step,
                )
                .await?;
            print_json(&report)?;
        }
        StoreCommand::Grades {
            kind,
            selection,
            overrides,
        } => {
            for band in &overrides {
                service
                    .update_grade_band(&band.grade, band.min, band.max)
                    .with_context(|| format!("applying --set {}", band.grade))?;
            }
            let listings = service
                .query_listings(
                    kind.into(),
                    &selection.position,
                    selection.start.as_deref(),
                    selection.end.as_deref(),
                )
                .await?;
            print_json(&service.compute_grade_stats(&listings))?;
        }
        StoreCommand::Positions => {
            print_json(&service.list_positions().await?)?;
        }
        StoreCommand::Reset { .. } => {
            service.reset_store().await?;
            eprintln!("store reset: {}", config.database_url);
        }
    }

    service.repository().close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_cli_logger(cli.verbose, cli.json_logs);

    let mut config = SalscopeConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command {
        Commands::UpdateGrade {
            grade,
            min,
            max,
            bands_file,
        } => {
            let registry = update_band_file(&config, &grade, min, max, bands_file)?;
            print_json(&registry.bands())
        }
        Commands::Store(command) => run_store_command(&config, command).await,
    }
}
