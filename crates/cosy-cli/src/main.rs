use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cosy_core::JobOutcome;
use cosy_storage::PgVenueStore;
use cosy_sync::{CrawlRequest, JobRunner, SyncConfig};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "cosy-cli")]
#[command(about = "Cosy venue discovery, scoring and curation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the query plan, or a single city with --city.
    Crawl {
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        country: Option<String>,
        #[arg(long)]
        pages: Option<u32>,
        #[arg(long)]
        scan_budget: Option<u64>,
        /// Crawl a city even when it already has enough venues.
        #[arg(long)]
        force: bool,
    },
    Normalize,
    /// Curate the featured set, or one city's guide with --city.
    Curate {
        #[arg(long, conflicts_with = "all_cities")]
        city: Option<String>,
        #[arg(long)]
        all_cities: bool,
    },
    Reslug,
    Migrate,
    Serve,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn report<T: Serialize>(outcome: &JobOutcome<T>) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(if outcome.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn runner(config: SyncConfig) -> Result<JobRunner> {
    let store = PgVenueStore::connect(&config.database_url).await?;
    JobRunner::new(Arc::new(store), config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Crawl {
            city,
            country,
            pages,
            scan_budget,
            force,
        } => {
            let runner = runner(config).await?;
            let request = CrawlRequest {
                city,
                country,
                pages,
                scan_budget,
                force,
            };
            let outcome = if request.city.is_some() {
                runner.city_crawl(request).await?
            } else {
                runner.crawl(request).await?
            };
            report(&outcome)
        }
        Commands::Normalize => report(&runner(config).await?.normalize().await),
        Commands::Curate { city, all_cities } => {
            let runner = runner(config).await?;
            match city {
                Some(city) => report(&runner.curate_city(Some(&city)).await?),
                None if all_cities => report(&runner.curate_all_cities().await),
                None => report(&runner.curate_featured().await),
            }
        }
        Commands::Reslug => report(&runner(config).await?.reslug().await),
        Commands::Migrate => {
            let store = PgVenueStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve => {
            cosy_web::serve_from_env().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
