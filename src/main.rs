use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use vcselect::config::SelectConfig;
use vcselect::metrics;
use vcselect::query::evaluator::SelectorEvaluator;
use vcselect::query::Select;
use vcselect::storage::cluster::LocalCluster;

const CONFIG_ENV: &str = "VCSELECT_CONFIG";
const STORAGE_NODES: usize = 2;

#[tokio::main]
async fn main() {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(true)
        .pretty()
        .init();

    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) => match SelectConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("Cannot load config from {}: {}", path, e);
                std::process::exit(1);
            }
        },
        Err(_) => SelectConfig::default(),
    };

    // Initialize metrics
    match config.metrics_addr.parse::<SocketAddr>() {
        Ok(addr) => match metrics::init_metrics(addr) {
            Ok(()) => info!("Metrics server listening on {}", addr),
            Err(e) => error!("Failed to initialize metrics: {}", e),
        },
        Err(e) => error!("Invalid metrics_addr {:?}: {}", config.metrics_addr, e),
    }

    let cluster = Arc::new(LocalCluster::new(STORAGE_NODES));
    let evaluator = Arc::new(SelectorEvaluator::new(Arc::clone(&cluster)));
    let select = match Select::new(config, cluster, evaluator) {
        Ok(select) => select,
        Err(e) => {
            error!("Cannot start query front end: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        storage_nodes = STORAGE_NODES,
        peers = select.config().select_nodes.len(),
        "Starting VCSelect..."
    );

    // Keep the application running
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl+c: {}", e);
    }
    info!("Shutting down...");
}
