mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "conduit",
    version,
    about = "Discover, schedule and run declarative data pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List pipelines with their state (the default)
    Status,
    /// Run pipelines now
    Run {
        /// Pipeline id, `all`, `dirty`, or a prefix ending in `*`
        target: String,
        /// Resume from cached step outputs
        #[arg(long, overrides_with = "no_use_cache")]
        use_cache: bool,
        /// Ignore cached step outputs
        #[arg(long, overrides_with = "use_cache")]
        no_use_cache: bool,
        /// Run even if dependencies are unresolved
        #[arg(long)]
        force: bool,
        /// How many pipelines may run at once
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// Log at debug level
        #[arg(short, long)]
        verbose: bool,
    },
    /// Keep pipelines up to date until interrupted
    Serve {
        /// Concurrent executions
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Seconds between update passes
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
    /// Wipe the status store
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Some(Commands::Run { verbose: true, .. }));
    let level = if verbose { "debug" } else { cli.log_level.as_str() };
    conduit::observability::init_tracing(level, cli.json_logs);

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => commands::status::execute(),
        Commands::Run {
            target,
            no_use_cache,
            force,
            concurrency,
            ..
        } => commands::run::execute(&target, !no_use_cache, force, concurrency).await,
        Commands::Serve { workers, interval } => {
            commands::serve::execute(workers, interval).await
        }
        Commands::Init => commands::init::execute(),
    }
}
