use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

mod commands;

/// Plugin host operations
#[derive(Parser, Debug)]
#[command(name = "plugin-host")]
#[command(about = "Run, inspect and validate in-process plugins")]
#[command(version)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit structured JSON logs
    #[arg(long, global = true, env = "PLUGIN_HOST_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate plugin manifests
    Validate {
        /// Manifest files (.json, .yaml, .yml or .toml)
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },
    /// Host the bundled plugins until interrupted
    Run {
        /// Runtime configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Registry snapshot restored at startup and written on shutdown
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Plugin setting as `plugin.key=value`; may be repeated
        #[arg(short = 'p', long = "set", value_name = "PLUGIN.KEY=VALUE")]
        settings: Vec<String>,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Print the contents of a registry snapshot
    Snapshot {
        file: PathBuf,

        /// Print the raw JSON document
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.json_logs);

    match args.command {
        Command::Validate { manifests } => commands::validate(&manifests).await,
        Command::Run {
            config,
            snapshot,
            settings,
            duration,
        } => {
            commands::run(commands::RunOptions {
                config,
                snapshot,
                settings,
                duration,
            })
            .await
        }
        Command::Snapshot { file, json } => commands::show_snapshot(&file, json).await,
    }
}

fn init_tracing(verbose: bool, json_logs: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("plugin_host={level},ops_cli={level},plugin_runtime_core={level},events_bus={level},audit_engine={level},example_plugins={level}")
            .into()
    });

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(atty::is(atty::Stream::Stderr))
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
