use std::io::{self, BufRead};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing::{info, warn};

use places_grid_crawler::{
    default_regions, init_tracing, load_regions, AppConfig, CrawlerApp, RegionConfig, RegionStop,
};

#[derive(Parser, Debug)]
#[command(name = "places-grid-crawler")]
#[command(about = "Crawl a place-search API over a geo grid into SQLite")]
struct Args {
    /// SQLite file to write (overrides CRAWLER_DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl every configured region until its yield plateaus or its grid runs out
    Crawl {
        /// TOML file with [[regions]] tables; the built-in city presets otherwise
        #[arg(long)]
        regions: Option<PathBuf>,

        /// Crawl only the named region(s)
        #[arg(long)]
        only: Vec<String>,
    },
    /// Print stored place counts per region
    Status,
    /// Fill missing postal codes through Place Details
    BackfillPostal {
        /// Stop after this many lookups
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Read an API key from stdin and save it in the OS keyring
    SetKey,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = AppConfig::from_env();
    if let Some(database) = args.database {
        config.database_path = database;
    }
    let app = CrawlerApp::initialize(config).context("invalid crawler configuration")?;

    match args.command {
        Command::Crawl { regions, only } => {
            let regions = select_regions(regions, &only)?;
            let run = app.crawl(&regions).await.context("crawl aborted")?;
            for report in &run.regions {
                let stop = match &report.stop {
                    RegionStop::Plateau => "plateau".to_string(),
                    RegionStop::GridExhausted => "grid exhausted".to_string(),
                    RegionStop::Failed(reason) => format!("failed: {reason}"),
                };
                println!(
                    "{:<16} points={:<6} new={:<6} degraded={:<4} stored={:<7} {}",
                    report.region,
                    report.points_visited,
                    report.new_records,
                    report.degraded_points,
                    report.final_count,
                    stop
                );
            }
            info!(total_new = run.total_new(), "crawl finished");
            if run.failed_regions().next().is_some() {
                bail!("one or more regions failed; rerun to resume them");
            }
        }
        Command::Status => {
            let status = app.status()?;
            println!("database: {}", status.database_path);
            if let Some(journal) = &status.journal_path {
                println!("journal:  {journal}");
            }
            println!("keyring api key: {}", status.keyring_has_api_key);
            for (region, count) in &status.region_counts {
                println!("{region:<16} {count}");
            }
            println!("{:<16} {}", "total", status.total());
        }
        Command::BackfillPostal { limit } => {
            let report = app
                .backfill_postal(limit)
                .await
                .context("postal backfill stopped; rerun later to continue")?;
            println!(
                "updated={} skipped={} total={}",
                report.updated, report.skipped, report.total
            );
        }
        Command::SetKey => {
            eprintln!("Paste the Places API key and press enter:");
            let mut line = String::new();
            io::stdin()
                .lock()
                .read_line(&mut line)
                .context("unable to read API key from stdin")?;
            app.store_api_key(&SecretString::from(line))
                .context("unable to store API key")?;
            println!("API key saved to the OS keyring");
        }
    }

    Ok(())
}

fn select_regions(file: Option<PathBuf>, only: &[String]) -> Result<Vec<RegionConfig>> {
    let regions = match file {
        Some(path) => load_regions(&path)
            .with_context(|| format!("unable to load regions from {}", path.display()))?,
        None => default_regions(),
    };
    if only.is_empty() {
        return Ok(regions);
    }

    let selected: Vec<_> = regions
        .into_iter()
        .filter(|region| only.iter().any(|name| name.eq_ignore_ascii_case(&region.name)))
        .collect();
    if selected.len() < only.len() {
        warn!(requested = ?only, matched = selected.len(), "some requested regions are unknown");
    }
    if selected.is_empty() {
        bail!("none of the requested regions are configured: {}", only.join(", "));
    }
    Ok(selected)
}
