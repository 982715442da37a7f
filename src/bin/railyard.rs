//! Railyard CLI: yard lifecycle, car management, and the agent processes
//! themselves (`engine`, `supervisor`) launched into multiplexer panes.
//!
//! Exit codes: 0 success, 2 configuration error, 3 store unreachable,
//! 4 session already-running / not-running, 1 internal.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use railyard::adapters::{GitCli, ShellTestRunner, TmuxMultiplexer};
use railyard::cars::{CarFilter, CarService, CreateCar};
use railyard::config::RailyardConfig;
use railyard::engine::launcher::CommandLauncher;
use railyard::engine::EngineRuntime;
use railyard::error::Result;
use railyard::messaging::{MessageService, SendMessage};
use railyard::models::{CarStatus, CarType, MessagePriority};
use railyard::orchestrator::Orchestrator;
use railyard::store::{DatabaseConfig, DatabaseManager};
use railyard::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "railyard")]
#[command(about = "Orchestrates a fleet of LLM coding agents over a car backlog")]
#[command(version)]
struct Cli {
    /// Path to the yard configuration file
    #[arg(long, short, global = true, default_value = "railyard.yaml", env = "RAILYARD_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the session and launch the supervisor plus N engines
    Start {
        /// Number of engines to launch across all tracks
        #[arg(long, short, default_value_t = 2)]
        engines: usize,
    },

    /// Drain, tear down the session, and mark all engines dead
    Stop,

    /// Aggregate yard status
    Status {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Set the engine count for one track
    Scale {
        track: String,
        count: usize,
    },

    /// Replace an engine with a fresh one on the same track
    Restart {
        engine: String,
    },

    /// Run one engine process in the foreground (normally launched by start)
    Engine {
        #[arg(long)]
        track: String,
        #[arg(long)]
        id: String,
    },

    /// Run the supervisor process in the foreground (normally launched by start)
    Supervisor,

    /// Apply the schema migrations and exit
    Migrate,

    /// Car backlog management
    #[command(subcommand)]
    Car(CarCommands),

    /// Message bus access
    #[command(subcommand)]
    Msg(MsgCommands),
}

#[derive(Subcommand)]
enum CarCommands {
    /// Create a car
    Add {
        title: String,
        #[arg(long, short, default_value = "")]
        description: String,
        #[arg(long)]
        track: Option<String>,
        #[arg(long = "type", value_parser = parse_car_type)]
        car_type: Option<CarType>,
        #[arg(long, short)]
        priority: Option<i32>,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long, default_value = "")]
        design_notes: String,
        #[arg(long, default_value = "")]
        acceptance: String,
    },

    /// List cars, optionally filtered
    List {
        #[arg(long)]
        track: Option<String>,
        #[arg(long, value_parser = parse_car_status)]
        status: Option<CarStatus>,
        #[arg(long)]
        assignee: Option<String>,
    },

    /// Show one car with deps and progress
    Show { id: String },

    /// The ready set, most urgent first
    Ready {
        #[arg(long)]
        track: Option<String>,
    },

    /// Add or remove a blocks-edge: CAR is blocked by BLOCKER
    Dep {
        car: String,
        blocker: String,
        #[arg(long)]
        remove: bool,
    },

    /// Cancel a car
    Cancel { id: String },
}

#[derive(Subcommand)]
enum MsgCommands {
    /// Send a message (to an agent id or `broadcast`)
    Send {
        from: String,
        to: String,
        subject: String,
        #[arg(long, short, default_value = "")]
        body: String,
        #[arg(long, value_parser = parse_priority, default_value = "normal")]
        priority: MessagePriority,
        #[arg(long)]
        car: Option<String>,
    },

    /// Unacknowledged messages for an agent
    Inbox { agent: String },

    /// Acknowledge a message as an agent
    Ack { id: String, agent: String },

    /// All messages in a thread
    Thread { id: String },
}

fn parse_car_type(raw: &str) -> std::result::Result<CarType, String> {
    raw.parse()
}

fn parse_car_status(raw: &str) -> std::result::Result<CarStatus, String> {
    raw.parse()
}

fn parse_priority(raw: &str) -> std::result::Result<MessagePriority, String> {
    raw.parse()
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("railyard=info")),
        )
        .init();

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
    db.migrate().await?;
    let pool = db.pool().clone();

    let cars = CarService::new(pool.clone(), config.branch_prefix());
    let messages = MessageService::new(pool.clone());

    match cli.command {
        Commands::Start { engines } => {
            let orchestrator = orchestrator(&config, &cli.config, pool);
            let report = orchestrator.start(engines).await?;
            println!("{} session {}", "started".green(), report.session.bold());
            for (track, count) in &report.assignment {
                println!("  {track}: {count} engine(s)");
            }
        }
        Commands::Stop => {
            let orchestrator = orchestrator(&config, &cli.config, pool);
            orchestrator.stop().await?;
            println!("{}", "stopped".green());
        }
        Commands::Status { json } => {
            let orchestrator = orchestrator(&config, &cli.config, pool);
            let report = orchestrator.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
            } else {
                print_status(&report);
            }
        }
        Commands::Scale { track, count } => {
            let orchestrator = orchestrator(&config, &cli.config, pool);
            let report = orchestrator.scale(&track, count).await?;
            println!(
                "{} {}: {} -> {} (spawned {}, draining {})",
                "scaled".green(),
                report.track,
                report.live,
                report.target,
                report.spawned.len(),
                report.draining.len()
            );
        }
        Commands::Restart { engine } => {
            let orchestrator = orchestrator(&config, &cli.config, pool);
            let replacement = orchestrator.restart(&engine).await?;
            println!("{} {engine} -> {replacement}", "restarted".green());
        }
        Commands::Engine { track, id } => {
            let track_config = config
                .track(&track)
                .ok_or_else(|| railyard::RailyardError::Config(format!("unknown track: {track}")))?
                .clone();
            let git = Arc::new(GitCli::new(&config.repository));
            let launcher = Arc::new(CommandLauncher::new(
                config.agent_command.clone(),
                Some(PathBuf::from(&config.repository)),
            ));
            let shutdown = shutdown_signal();
            let runtime = EngineRuntime::new(id, track_config, config, pool, git, launcher, shutdown);
            runtime.run().await?;
        }
        Commands::Supervisor => {
            let git = Arc::new(GitCli::new(&config.repository));
            let tests = Arc::new(ShellTestRunner::new(&config.repository));
            let shutdown = shutdown_signal();
            let supervisor = Supervisor::register(config, pool, git, tests, shutdown).await?;
            supervisor.run().await?;
        }
        Commands::Migrate => {
            println!("{}", "schema up to date".green());
        }
        Commands::Car(command) => run_car(command, &cars).await?,
        Commands::Msg(command) => run_msg(command, &messages).await?,
    }
    Ok(())
}

fn orchestrator(config: &RailyardConfig, config_path: &PathBuf, pool: sqlx::PgPool) -> Orchestrator {
    Orchestrator::new(
        config.clone(),
        config_path.clone(),
        pool,
        Arc::new(TmuxMultiplexer),
    )
}

/// Watch channel flipped by the first Ctrl-C / SIGTERM.
fn shutdown_signal() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = tx.send(true);
    });
    rx
}

async fn run_car(command: CarCommands, cars: &CarService) -> Result<()> {
    match command {
        CarCommands::Add {
            title,
            description,
            track,
            car_type,
            priority,
            parent,
            design_notes,
            acceptance,
        } => {
            let car = cars
                .create(CreateCar {
                    title,
                    description,
                    car_type,
                    priority,
                    track,
                    parent_id: parent,
                    base_branch: None,
                    design_notes,
                    acceptance,
                })
                .await?;
            println!("{} {} on {} ({})", "created".green(), car.id.bold(), car.track, car.branch);
        }
        CarCommands::List { track, status, assignee } => {
            let list = cars
                .list(&CarFilter {
                    track,
                    status,
                    assignee,
                    ..CarFilter::default()
                })
                .await?;
            for car in list {
                println!(
                    "{}  {:>3}  {:<13} {:<10} {}",
                    car.id.bold(),
                    car.priority,
                    car.status.to_string(),
                    car.track,
                    car.title
                );
            }
        }
        CarCommands::Show { id } => {
            let detail = cars.get(&id).await?;
            let car = &detail.car;
            println!("{} {} [{}]", car.id.bold(), car.title, car.status);
            println!("  track: {}  priority: {}  assignee: {}", car.track, car.priority,
                if car.assignee.is_empty() { "-" } else { &car.assignee });
            println!("  branch: {} (base {})", car.branch, car.base_branch);
            if !detail.blockers.is_empty() {
                let blockers: Vec<&str> =
                    detail.blockers.iter().map(|d| d.blocked_by.as_str()).collect();
                println!("  blocked by: {}", blockers.join(", "));
            }
            if !detail.dependents.is_empty() {
                let dependents: Vec<&str> =
                    detail.dependents.iter().map(|d| d.car_id.as_str()).collect();
                println!("  blocks: {}", dependents.join(", "));
            }
            for note in &detail.progress {
                println!("  [cycle {}] {} ({})", note.cycle, note.note, note.engine_id);
            }
        }
        CarCommands::Ready { track } => {
            for car in cars.ready(track.as_deref()).await? {
                println!("{}  {:>3}  {:<10} {}", car.id.bold(), car.priority, car.track, car.title);
            }
        }
        CarCommands::Dep { car, blocker, remove } => {
            if remove {
                cars.remove_dep(&car, &blocker).await?;
                println!("{} {car} no longer blocked by {blocker}", "removed".green());
            } else {
                cars.add_dep(&car, &blocker).await?;
                println!("{} {car} blocked by {blocker}", "added".green());
            }
        }
        CarCommands::Cancel { id } => {
            cars.set_status(&id, CarStatus::Cancelled).await?;
            println!("{} {id}", "cancelled".yellow());
        }
    }
    Ok(())
}

async fn run_msg(command: MsgCommands, messages: &MessageService) -> Result<()> {
    match command {
        MsgCommands::Send { from, to, subject, body, priority, car } => {
            let id = messages
                .send(SendMessage {
                    from_agent: from,
                    to_agent: to,
                    subject,
                    body,
                    car_id: car,
                    thread_id: None,
                    priority,
                })
                .await?;
            println!("{} {id}", "sent".green());
        }
        MsgCommands::Inbox { agent } => {
            for message in messages.inbox(&agent).await? {
                println!(
                    "{}  [{}] {} <- {}: {}",
                    message.id.bold(),
                    message.priority,
                    message.to_agent,
                    message.from_agent,
                    message.subject
                );
            }
        }
        MsgCommands::Ack { id, agent } => {
            messages.ack(&id, &agent).await?;
            println!("{}", "acknowledged".green());
        }
        MsgCommands::Thread { id } => {
            for message in messages.thread(&id).await? {
                println!("{} {} -> {}: {}", message.created_at, message.from_agent, message.to_agent, message.subject);
                if !message.body.is_empty() {
                    println!("    {}", message.body.replace('\n', "\n    "));
                }
            }
        }
    }
    Ok(())
}

fn print_status(report: &railyard::orchestrator::StatusReport) {
    println!("{}", "engines".bold());
    for engine in &report.engines {
        println!(
            "  {:<12} {:<10} {:<8} {:<10} {}",
            engine.id,
            engine.track,
            engine.role.to_string(),
            engine.status.to_string(),
            if engine.current_car.is_empty() { "-" } else { &engine.current_car },
        );
    }
    println!("{}", "tracks".bold());
    for track in &report.tracks {
        println!(
            "  {:<12} open {:>3}  ready {:>3}  in-progress {:>3}  done {:>3}  blocked {:>3}  merge-failed {:>3}",
            track.track, track.open, track.ready, track.in_progress, track.done, track.blocked, track.merge_failed,
        );
    }
    println!(
        "queue depth: {}   tokens: {} in / {} out",
        report.queue_depth, report.input_tokens, report.output_tokens
    );
}
