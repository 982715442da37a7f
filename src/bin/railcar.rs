//! Completion interface for agent subprocesses.
//!
//! Agents signal through the store, never through exit codes: `complete`
//! moves the car to done and records a final note; `progress` records a
//! note without touching status. Both are ordinary store mutations.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;

use railyard::cars::{CarPatch, CarService};
use railyard::config::RailyardConfig;
use railyard::error::Result;
use railyard::models::CarStatus;
use railyard::store::{DatabaseConfig, DatabaseManager};

#[derive(Parser)]
#[command(name = "railcar")]
#[command(about = "Agent-side completion interface for railyard cars")]
#[command(version)]
struct Cli {
    /// Path to the yard configuration file
    #[arg(long, short, global = true, default_value = "railyard.yaml", env = "RAILYARD_CONFIG")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mark a car done with a summary of what changed
    Complete {
        car: String,
        #[arg(long, short)]
        summary: String,
        /// Engine recorded on the progress note
        #[arg(long, env = "RAILYARD_ENGINE", default_value = "")]
        engine: String,
        #[arg(long, env = "RAILYARD_SESSION", default_value = "")]
        session: String,
    },

    /// Record a progress note without changing status
    Progress {
        car: String,
        #[arg(long, short)]
        note: String,
        #[arg(long, env = "RAILYARD_ENGINE", default_value = "")]
        engine: String,
        #[arg(long, env = "RAILYARD_SESSION", default_value = "")]
        session: String,
        /// Comma-separated files-changed snapshot
        #[arg(long, default_value = "")]
        files: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = RailyardConfig::load(&cli.config)?;
    let db = DatabaseManager::new(DatabaseConfig::with_url(config.database_url())).await?;
    let cars = CarService::new(db.pool().clone(), config.branch_prefix());

    match cli.command {
        Commands::Complete { car, summary, engine, session } => {
            let current = cars.fetch(&car).await?;
            let cycle = cars.last_cycle(&car).await?;
            cars.update(&car, CarPatch::status(CarStatus::Done)).await?;
            cars.add_progress(&car, &engine, &session, cycle, &format!("done: {summary}"), "")
                .await?;
            println!("{} {} ({} -> done)", "completed".green(), car, current.status);
        }
        Commands::Progress { car, note, engine, session, files } => {
            cars.fetch(&car).await?;
            let cycle = cars.last_cycle(&car).await?;
            cars.add_progress(&car, &engine, &session, cycle, &note, &files).await?;
            println!("{} {}", "recorded".green(), car);
        }
    }
    Ok(())
}
