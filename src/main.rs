use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use extension_supervisor::host::{HeadlessUi, LogNotifier, StdoutSink};
use extension_supervisor::paths::default_config_path;
use extension_supervisor::{load_config, HostBindings, Result, Supervisor};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(name = "extsup", version, about = "Supervise an editor extension's helper processes")]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the configured services and keep them running until Ctrl-C
    Run,
    /// Run the automation CLI once and stream its output
    Agent {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    log::info!("Using config {}", config_path.display());

    match cli.command {
        Command::Run => {
            let supervisor = Supervisor::new(config, HostBindings::headless())?;
            for (kind, result) in supervisor.activate().await {
                match result {
                    Ok(report) => log::info!(
                        "{}: port {} ({:?}{})",
                        kind,
                        report.port,
                        report.state,
                        if report.reused { ", reused" } else { "" }
                    ),
                    Err(e) => log::error!("{}: {}", kind, e),
                }
            }
            wait_for_ctrl_c().await;
            supervisor.deactivate().await;
        }
        Command::Agent { prompt, workdir } => {
            let host = HostBindings {
                sink: Arc::new(StdoutSink),
                notifier: Arc::new(LogNotifier),
                ui: Arc::new(HeadlessUi),
            };
            let supervisor = Supervisor::new(config, host)?;
            let workdir = workdir.unwrap_or_else(|| supervisor.config().workspace_dir());

            let started = supervisor.run_agent_in(&prompt, &workdir);
            if started.is_ok() {
                tokio::select! {
                    _ = wait_until_idle(&supervisor) => {}
                    _ = wait_for_ctrl_c() => log::info!("Interrupted"),
                }
            }
            supervisor.deactivate().await;

            started?;
            if let Some(run) = supervisor.agent_status().last {
                log::info!("Agent run {} finished: {:?}", run.id, run.state);
            }
        }
    }
    Ok(())
}

async fn wait_until_idle(supervisor: &Supervisor) {
    while supervisor.agent_status().running {
        tokio::time::sleep(IDLE_POLL_INTERVAL).await;
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
    }
}
