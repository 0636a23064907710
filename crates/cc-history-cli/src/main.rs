//! cc-history - keeps Claude conversation history mirrored between the
//! global store and per-project stores.
//!
//! # Usage
//!
//! ```bash
//! # Create .claude/history in the current project and run a first sync
//! cc-history init
//!
//! # Sync once, or keep syncing while you work
//! cc-history sync
//! cc-history watch
//!
//! # Keep every project under the search roots in sync
//! cc-history daemon start
//! cc-history daemon status
//! ```

use anyhow::Result;
use cc_history_cli::daemon_manager::LOG_FILE_PREFIX;
use cc_history_cli::{CliContext, OutputFormat, commands, output};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser)]
#[command(name = "cc-history")]
#[command(about = "Mirror Claude conversation history into your projects", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format (human, json, plain)
    #[arg(long, global = true, default_value = "human")]
    format: OutputFormatArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormatArg {
    Human,
    Json,
    Plain,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Human => OutputFormat::Human,
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Plain => OutputFormat::Plain,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the project's local history store
    Init {
        /// Project path (default: current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Leave .gitignore untouched
        #[arg(long)]
        no_ignore: bool,

        /// Sync right away, even when auto_sync is off
        #[arg(long)]
        sync: bool,
    },

    /// Sync conversation history once
    Sync {
        /// Project path (default: current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Copy local history into the global store, overwriting it
        #[arg(long, conflicts_with = "one_way")]
        to_global: bool,

        /// Only copy from the global store to the project
        #[arg(long)]
        one_way: bool,

        /// Sync even when the mode is 'global'
        #[arg(short, long)]
        force: bool,
    },

    /// Watch for changes and mirror them until interrupted
    Watch {
        /// Project path (default: current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Only mirror global changes into the project
        #[arg(long)]
        one_way: bool,

        /// Do not copy files that already exist when watching starts
        #[arg(long)]
        ignore_initial: bool,
    },

    /// Show storage locations and conversation counts
    Status {
        /// Project path (default: current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// List conversations
    List {
        /// Project path (default: current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// List the global store instead of the project's
        #[arg(short, long)]
        global: bool,
    },

    /// Delete the project's local history
    Clean {
        /// Project path (default: current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Keep files in .claude other than history/
        #[arg(long)]
        preserve_config: bool,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage cc-history entries in .gitignore
    #[command(subcommand)]
    Ignore(IgnoreCommands),

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Background daemon that syncs every discovered project
    #[command(subcommand)]
    Daemon(DaemonCommands),
}

#[derive(Subcommand)]
enum IgnoreCommands {
    /// Add patterns (default: the configured ignore_patterns)
    Add {
        #[arg(short, long)]
        path: Option<PathBuf>,

        patterns: Vec<String>,
    },

    /// Remove patterns (default: every pattern cc-history added)
    Remove {
        #[arg(short, long)]
        path: Option<PathBuf>,

        patterns: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print one value
    Get { key: String },

    /// Set one value and save
    Set { key: String, value: String },

    /// Print every value
    List,

    /// Print the configuration file path
    Path,
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon in the background
    Start,

    /// Stop the background daemon
    Stop,

    /// Show whether the daemon is running and what it monitors
    Status,

    /// Run the daemon in the foreground
    Run,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        output::error(format!("{:#}", e));
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let format = OutputFormat::from(cli.format);
    if format == OutputFormat::Plain {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let mut ctx = CliContext::load(cli.config, format).await?;

    // Held until exit so buffered log lines are flushed
    let _log_guard = match cli.command {
        Commands::Daemon(DaemonCommands::Run) => Some(init_file_logging(
            &commands::daemon_log_dir()?,
            &ctx.config.log_level,
        )),
        _ => {
            init_logging(cli.verbose, &ctx.config.log_level);
            None
        }
    };

    match cli.command {
        Commands::Init {
            path,
            no_ignore,
            sync,
        } => commands::init(&ctx, path, no_ignore, sync).await?,

        Commands::Sync {
            path,
            to_global,
            one_way,
            force,
        } => commands::sync(&ctx, path, to_global, one_way, force).await?,

        Commands::Watch {
            path,
            one_way,
            ignore_initial,
        } => commands::watch(&ctx, path, one_way, ignore_initial).await?,

        Commands::Status { path } => commands::status(&ctx, path).await?,

        Commands::List { path, global } => commands::list(&ctx, path, global).await?,

        Commands::Clean {
            path,
            preserve_config,
            yes,
        } => commands::clean(&ctx, path, preserve_config, yes).await?,

        Commands::Ignore(ignore_cmd) => match ignore_cmd {
            IgnoreCommands::Add { path, patterns } => {
                commands::ignore_add(&ctx, path, patterns).await?;
            }
            IgnoreCommands::Remove { path, patterns } => {
                commands::ignore_remove(&ctx, path, patterns).await?;
            }
        },

        Commands::Config(config_cmd) => match config_cmd {
            ConfigCommands::Get { key } => commands::config_get(&ctx, key).await?,
            ConfigCommands::Set { key, value } => commands::config_set(&mut ctx, key, value).await?,
            ConfigCommands::List => commands::config_list(&ctx).await?,
            ConfigCommands::Path => commands::config_path(&ctx).await?,
        },

        Commands::Daemon(daemon_cmd) => match daemon_cmd {
            DaemonCommands::Start => commands::daemon_start(&ctx).await?,
            DaemonCommands::Stop => commands::daemon_stop(&ctx).await?,
            DaemonCommands::Status => commands::daemon_status(&ctx).await?,
            DaemonCommands::Run => commands::daemon_run(&ctx).await?,
        },
    }

    Ok(())
}

fn env_filter(verbose: bool, level: &str) -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::EnvFilter;

    if verbose {
        EnvFilter::new("cc_history=debug,cc_history_cli=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("cc_history={level},cc_history_cli={level},warn"))
        })
    }
}

fn init_logging(verbose: bool, level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(env_filter(verbose, level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Daily rolling log files for the background daemon.
fn init_file_logging(log_dir: &Path, level: &str) -> WorkerGuard {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter(false, level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();

    guard
}
