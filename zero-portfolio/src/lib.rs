//! Zero Portfolio Library
//!
//! Splits one brokerage account into independent portfolios that trade
//! concurrently without double-spending the shared cash or shares.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     zero-portfolio (Rust Service)                   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐      │
//! │  │  Manager        │  │  Portfolios     │  │  Scheduler      │      │
//! │  │  (pool)         │──│  (ledgers)      │──│  (market hours) │      │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────┘      │
//! │           │                    │                                    │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐      │
//! │  │  Instrument     │  │  Broker         │  │  Store          │      │
//! │  │  cache          │  │  (trait)        │  │  (SQLite)       │      │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! - **Pool**: account cash and shares not allocated to any portfolio
//! - **Confirmation loop**: per-portfolio poller that books broker fills
//! - **Diagnostic log**: recovered trading failures, kept per portfolio

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod broker;
pub mod error;
pub mod execution;
pub mod instrument;
pub mod manager;
pub mod portfolio;
pub mod scheduler;
pub mod store;

pub use broker::{Broker, PaperBroker};
pub use error::{PortfolioError, PortfolioResult};
pub use manager::PortfolioManager;
pub use portfolio::{Portfolio, PortfolioSettings, TransferDirection};
pub use scheduler::{RunState, ScheduleOptions, Strategy};
pub use store::PortfolioStore;

use anyhow::{Context, Result};
use std::sync::Arc;
use zero_common::config::Config;

/// Main portfolio service
pub struct PortfolioService {
    config: Config,
    manager: Arc<PortfolioManager>,
    store: PortfolioStore,
}

impl PortfolioService {
    /// Connect the manager to the broker and open the state store
    pub async fn new(config: Config, broker: Arc<dyn Broker>) -> Result<Self> {
        let store = PortfolioStore::open(config.portfolio.state_db_path())?;
        Self::with_store(config, broker, store).await
    }

    /// Same as [`Self::new`] with an already opened store
    pub async fn with_store(config: Config, broker: Arc<dyn Broker>, store: PortfolioStore) -> Result<Self> {
        let manager = PortfolioManager::connect(&config.portfolio, broker)
            .await
            .context("Failed to connect portfolio manager")?;

        Ok(Self {
            config,
            manager: Arc::new(manager),
            store,
        })
    }

    pub fn manager(&self) -> &Arc<PortfolioManager> {
        &self.manager
    }

    pub fn store(&self) -> &PortfolioStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load every saved portfolio of this account; returns how many were restored
    pub async fn restore_saved(&self) -> Result<usize> {
        let mut restored = 0;
        for name in self.store.list()? {
            match self.manager.load_portfolio(&name, &self.store).await {
                Ok(_) => restored += 1,
                Err(e) => {
                    tracing::warn!(portfolio = %name, error = %e, "Skipping saved portfolio");
                }
            }
        }
        Ok(restored)
    }

    /// Run until Ctrl-C, then stop every loop and save
    pub async fn start(self) -> Result<()> {
        let restored = self.restore_saved().await?;
        tracing::info!(
            manager = %self.manager.name(),
            restored,
            venue = %self.config.portfolio.venue,
            "Portfolio service started"
        );

        self.manager.start_poller();

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        tracing::info!("Shutdown signal received");

        self.manager.shutdown(Some(&self.store)).await?;
        tracing::info!("Portfolio service stopped");
        Ok(())
    }
}
