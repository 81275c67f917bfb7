use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "factory-line")]
#[command(version, about = "Production-line simulator for factory stations")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// SQLite database file. Overrides factory.toml and FACTORY_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Config file (defaults to .factory/factory.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and schema
    Init {
        /// Insert the built-in process catalog
        #[arg(long)]
        seed: bool,
    },
    /// Run the HTTP/WebSocket server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// List the process catalog
    Steps,
    /// Manage orders
    Order {
        #[command(subcommand)]
        command: OrderCommands,
    },
    /// Advance the simulation by one tick
    Tick {
        /// Focus order; without it only finished jobs are swept
        #[arg(long)]
        order: Option<String>,
    },
    /// Tick once and print the per-step progress of an order
    View {
        #[arg(long)]
        order: String,
    },
    /// Clear an order's progress and free its stations
    Reset {
        #[arg(long)]
        order: String,
    },
    /// Dump all stations and running jobs
    State,
    /// Tick an order on an interval until it is no longer active
    Run {
        #[arg(long)]
        order: String,
        /// Milliseconds between ticks (defaults to simulation.poll_interval_ms)
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Stop after this many ticks
        #[arg(long)]
        max_ticks: Option<u64>,
    },
}

#[derive(Subcommand, Clone)]
pub enum OrderCommands {
    /// Place a new order
    Create {
        /// Step chain, e.g. "1->2->3" or "1,2,3"
        #[arg(long)]
        chain: String,
        #[arg(long, default_value = "1")]
        amount: i64,
        /// Order id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value = "")]
        customer: String,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// List orders, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one order
    Show { id: String },
    /// Change an order's status (active, completed, rejected, cancelled)
    Status { id: String, status: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cmd::load_config(&cli)?;
    let _log_guard = factory_line::logging::init_logging(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Init { seed } => cmd::cmd_init(&config, *seed)?,
        Commands::Serve { port, dev } => cmd::cmd_serve(&config, *port, *dev).await?,
        Commands::Steps => cmd::cmd_steps(&config)?,
        Commands::Order { command } => cmd::cmd_order(&config, command.clone())?,
        Commands::Tick { order } => cmd::cmd_tick(&config, order.as_deref())?,
        Commands::View { order } => cmd::cmd_view(&config, order)?,
        Commands::Reset { order } => cmd::cmd_reset(&config, order)?,
        Commands::State => cmd::cmd_state(&config)?,
        Commands::Run {
            order,
            interval_ms,
            max_ticks,
        } => cmd::cmd_run(&config, order, *interval_ms, *max_ticks).await?,
    }

    Ok(())
}
