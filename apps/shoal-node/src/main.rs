mod cluster;
mod config;
mod telemetry;

use std::path::PathBuf;

use clap::Parser;
use cluster::LocalCluster;
use config::NodeConfig;
use telemetry::{LogConfig, LogLevel};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "shoal-node", about = "Runs a single-process shard cluster")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Info, env = "SHOAL_LOG_LEVEL")]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, default_value_t = 4, help = "Clients joining the demo rooms")]
    clients: usize,

    #[arg(long, default_value_t = 10, help = "Moves each client sends")]
    rounds: u32,
}

// Bus handlers and the tick loops must not interleave mid-call; a
// current-thread runtime only switches tasks at await points.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = NodeConfig::from_env();

    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.or_else(|| cfg.log_path.clone().map(PathBuf::from)),
    })?;

    info!(
        channels = ?cfg.channel_id_list(),
        back_masters = cfg.back_masters,
        front_masters = cfg.front_masters,
        "starting shoal node"
    );
    let cluster = LocalCluster::start(cfg).await?;

    tokio::select! {
        report = cluster.run_demo(cli.clients, cli.rounds) => {
            let report = report?;
            info!(
                clients = report.clients,
                sent = report.messages_sent,
                recorded = report.moves_recorded,
                consistent = report.consistent_clients,
                "demo finished"
            );
            if report.consistent_clients != report.clients {
                warn!("some clients ended with diverged state");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }

    cluster.shutdown();
    Ok(())
}
