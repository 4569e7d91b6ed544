//! labvmd — the labvm daemon.
//!
//! Single binary that assembles the orchestrator:
//! - Request queue (redb)
//! - Cluster client (Kubernetes)
//! - Manifest template
//! - Pod watchers + status notifier (+ optional port forwarding)
//! - Queue consumer
//! - Ingress API
//!
//! # Usage
//!
//! ```text
//! labvmd run --config /etc/labvm/labvm.toml --port 8480
//! labvmd check-template --template /etc/labvm/vm-deployment.yaml.tera --name vm-abc
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use labvm_core::LabConfig;

const DEFAULT_LOG_FILTER: &str = "info,labvmd=debug,labvm=debug";

#[derive(Parser)]
#[command(name = "labvmd", about = "labvm daemon — per-student VM lifecycle orchestrator")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator: consume the queue, watch pods, serve the API.
    Run {
        /// Path to labvm.toml. Built-in defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port for the ingress API (overrides `api.port`).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Render the manifest template for a workload name and print it.
    CheckTemplate {
        /// Template file. The bundled template is used when omitted.
        #[arg(long)]
        template: Option<PathBuf>,

        /// Workload name to substitute.
        #[arg(long, default_value = "vm-check")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, port } => {
            let config = match config {
                Some(path) => LabConfig::from_file(&path)?,
                None => LabConfig::default(),
            };
            daemon::run(config, port).await
        }
        Command::CheckTemplate { template, name } => {
            let template = daemon::load_template(template.as_deref())?;
            let deployment = template.render(&name)?;
            print!("{}", serde_yaml_ng::to_string(&deployment)?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
