//! Gantry build agent.

use clap::{Parser, Subcommand, ValueEnum};
use gantry_core::step::JobResult;
use gantry_runtime::JobOutcome;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "gantry-agent")]
#[command(about = "Gantry build agent", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, env = "GANTRY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a work assignment on this machine
    Run {
        /// Path to the assignment file
        path: String,
        /// Agent configuration file
        #[arg(long, env = "GANTRY_CONFIG", default_value = "agent.kdl")]
        config: String,
        /// Server URL, overriding the configuration file
        #[arg(long, env = "GANTRY_SERVER_URL")]
        server_url: Option<String>,
    },
    /// Validate a work assignment file
    Validate {
        /// Path to the assignment file
        path: String,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Run {
            path,
            config,
            server_url,
        } => match commands::run::run_assignment(&path, &config, server_url).await? {
            JobOutcome::Finished(Some(JobResult::Passed)) => {
                println!("Job passed");
            }
            JobOutcome::Finished(Some(result)) => {
                anyhow::bail!("Job {}", result);
            }
            JobOutcome::Finished(None) => {
                println!("Job was ignored by the server");
            }
            JobOutcome::Abandoned => {
                anyhow::bail!("Job abandoned, see the agent log");
            }
        },
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
