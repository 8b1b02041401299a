use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "muxgate",
    about = "muxgate: multiplexed stream lifecycle and GOAWAY drain harness",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker dispatcher against echo responders and verify every
    /// stream end to end.
    Stress {
        /// Path to muxgate.toml (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override [load].workers
        #[arg(short, long)]
        workers: Option<usize>,
        /// Override [load].requests
        #[arg(short, long)]
        requests: Option<usize>,
        /// Number of independent runs
        #[arg(short, long, default_value_t = 1)]
        iterations: usize,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Send one "hello" request to a peer that closes right after answering.
    Hello {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Print the default configuration as TOML.
    Config,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,muxgate=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Stress {
            config,
            workers,
            requests,
            iterations,
            format,
        } => {
            commands::stress::run(
                config.as_deref(),
                commands::stress::Overrides { workers, requests },
                iterations,
                &format,
            )
            .await
        }
        Commands::Hello { config, format } => {
            commands::hello::run(config.as_deref(), &format).await
        }
        Commands::Config => commands::config::print(),
    }
}
