//! CLI for servicebus
//!
//! Subcommands:
//! - `run`: host a service's bus, answer health checks, announce status
//! - `ping`: host a service and health-check it from a second service
//!   attached to the same bus (useful for smoke tests)

use std::time::Duration;

use clap::Parser;
use serde_json::json;
use servicebus::client::ServiceInfo;
use servicebus::config::load_config;
use servicebus::{BusRegistry, RequestOptions};
use tracing::{error, info, warn};

const PING_SERVICE: &str = "servicebus-cli";

#[derive(Parser)]
#[command(name = "servicebus")]
enum Command {
    /// Host the bus for one service until Ctrl-C
    Run {
        /// Service name; also names the durable storage directory
        #[arg(long)]
        service: String,
        /// Register with the gateway on startup
        #[arg(long)]
        register: bool,
    },
    /// Start a service and health-check it over the bus
    Ping {
        #[arg(long, default_value = "doc-service")]
        service: String,
        #[arg(long, default_value_t = 2_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(2);
        }
    };
    servicebus::utils::logging::init(&settings.logging.level);

    let registry = BusRegistry::new(settings);
    let cmd = Command::parse();

    let result = match cmd {
        Command::Run { service, register } => run_service(&registry, &service, register).await,
        Command::Ping {
            service,
            timeout_ms,
        } => ping(&registry, &service, timeout_ms).await,
    };

    if let Err(e) = result {
        error!("{e}");
    }
    registry.shutdown_all().await;
}

async fn run_service(
    registry: &BusRegistry,
    service: &str,
    register: bool,
) -> Result<(), servicebus::BusError> {
    let communicator = registry.communicator(service).await;
    let _health = communicator.serve_health_checks()?;

    if register {
        let info = ServiceInfo {
            name: service.to_string(),
            url: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            topics: Vec::new(),
        };
        // the gateway may not be up yet; keep running either way
        if let Err(e) = communicator.register_with_gateway(&info).await {
            warn!(service, error = %e, "gateway registration failed");
        }
    }

    communicator
        .broadcast_service_status("up", json!({ "pid": std::process::id() }))
        .await?;
    info!(service, "running, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    info!("Shutdown signal received. Exiting gracefully.");

    communicator
        .broadcast_service_status("down", json!({}))
        .await?;
    // let the final status go out before the bus stops
    tokio::time::sleep(Duration::from_millis(
        registry.settings().bus.tick_interval_ms * 2,
    ))
    .await;
    Ok(())
}

async fn ping(
    registry: &BusRegistry,
    service: &str,
    timeout_ms: u64,
) -> Result<(), servicebus::BusError> {
    let target = registry.communicator(service).await;
    let _health = target.serve_health_checks()?;
    let requester = registry.attach(PING_SERVICE, service).await;

    let report = requester
        .check_service_health_with(service, RequestOptions::with_timeout_ms(timeout_ms))
        .await?;
    println!(
        "{} is {:?} ({} queued)",
        report.service, report.status, report.queued
    );
    Ok(())
}
