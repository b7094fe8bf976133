//! pipewright CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{EventArgs, run::RunArgs};

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(about = "Run trigger/matrix/step CI workflows locally", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "PIPEWRIGHT_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow file
    Validate {
        /// Path to the workflow file
        #[arg(default_value = "pipewright.kdl")]
        path: String,
    },
    /// Show whether an event triggers the workflow and which runs it would start
    Plan {
        /// Path to the workflow file
        #[arg(default_value = "pipewright.kdl")]
        path: String,

        #[command(flatten)]
        event: EventArgs,
    },
    /// Dispatch an event and execute the resulting runs
    Run(RunArgs),
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Plan { path, event } => {
            commands::plan::plan(&path, &event)?;
        }
        Commands::Run(args) => {
            commands::run::run(args).await?;
        }
    }

    Ok(())
}
