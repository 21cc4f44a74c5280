use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use fuego_harvester::commands;
use fuego_harvester::config::AppConfig;
use fuego_harvester::Harvester;

#[derive(Parser)]
#[command(name = "fuego-harvester")]
#[command(about = "Harvests restaurant lists and awards into canonical restaurants")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Re-scan stale source documents, or just one
    Refresh {
        /// Refresh only this registered document, regardless of age
        #[arg(long)]
        source: Option<String>,
    },
    /// Re-validate stored place ids, merging restaurants that collide
    RefreshPlaceIds,
    /// Ask the oracle for the cuisine of restaurants that have none
    EnrichCuisine,
    /// Register a canonical locality
    AddLocality {
        name: String,
        /// ISO country code, e.g. us
        #[arg(long)]
        country: String,
        #[arg(long)]
        state: Option<String>,
    },
    /// Register a source document to harvest
    AddSource {
        url: String,
        /// Locality the article is about
        #[arg(long)]
        locality_id: Option<i64>,
    },
    /// Soft-delete a restaurant so refreshes stop associating it
    DeleteRestaurant { restaurant_id: i64 },
    /// Print the ranked restaurants of a locality
    Rank {
        #[arg(long)]
        locality_id: i64,
    },
    /// Print store counts and the active configuration
    Status,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let harvester =
        Harvester::initialize(AppConfig::from_env()).context("failed to initialise harvester")?;

    match cli.command {
        Command::Refresh { source } => {
            let report = commands::refresh(&harvester, source)
                .await
                .context("refresh run halted")?;
            print_json(&report)?;
        }
        Command::RefreshPlaceIds => {
            print_json(&commands::refresh_place_ids(&harvester).await?)?;
        }
        Command::EnrichCuisine => {
            print_json(&commands::enrich_cuisine(&harvester).await?)?;
        }
        Command::AddLocality {
            name,
            country,
            state,
        } => {
            print_json(&commands::add_locality(
                &harvester,
                &name,
                &country,
                state.as_deref(),
            )?)?;
        }
        Command::AddSource { url, locality_id } => {
            print_json(&commands::add_source(&harvester, &url, locality_id)?)?;
        }
        Command::DeleteRestaurant { restaurant_id } => {
            print_json(&commands::delete_restaurant(&harvester, restaurant_id)?)?;
        }
        Command::Rank { locality_id } => {
            let listing = commands::rank(&harvester, locality_id)?;
            println!("{}", listing.locality.display_name);
            for (position, entry) in listing.restaurants.iter().enumerate() {
                println!(
                    "{:>3}. {:<40} {:>6.2}  ({} articles)",
                    position + 1,
                    entry.restaurant.name,
                    entry.score,
                    entry.live_articles
                );
            }
        }
        Command::Status => {
            print_json(&commands::status(&harvester)?)?;
        }
    }
    Ok(())
}
