//! Zero Portfolio - multi-portfolio sub-ledger service for the Zero ecosystem.
//!
//! Runs the portfolio manager against a paper account until Ctrl-C.

use anyhow::Result;
use std::sync::Arc;
use zero_common::config::Config;
use zero_common::logging::init_logging_with_exclusions;
use zero_portfolio::{PaperBroker, PortfolioService};

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    let config = Config::load_with_env()?;

    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Zero Portfolio v{}", env!("CARGO_PKG_VERSION"));

    let broker = Arc::new(PaperBroker::new(
        format!("paper-{}", config.portfolio.manager_name),
        config.portfolio.paper_cash,
    ));
    let service = PortfolioService::new(config, broker).await?;

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Service initialized in {:?}",
        startup_duration
    );

    service.start().await
}
