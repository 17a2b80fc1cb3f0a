//! Market-hours-gated strategy scheduler.
//!
//! One poller asks the broker whether the venue is open at broker server
//! time and toggles a shared `market_open` flag. Every registered strategy
//! gets its own loop while the flag holds:
//!
//! 1. start the portfolio's confirmation loop
//! 2. invoke the strategy every `frequency`, logging failures
//! 3. on close, stop confirmation, cancel queued orders, mark `Stopped`
//!
//! Clearing the flag wakes every waiting loop at once.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{PortfolioError, PortfolioResult};
use crate::manager::PortfolioManager;
use crate::portfolio::Portfolio;
use crate::store::PortfolioStore;

/// A trading strategy driven by the scheduler
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Strategy name for logging
    fn name(&self) -> &str;

    /// One invocation against the portfolio it is scheduled on
    async fn run(&self, portfolio: &Portfolio) -> PortfolioResult<()>;
}

/// Lifecycle of one registered strategy loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Registered, waiting for the market to open
    Pending,
    /// Loop running
    Started,
    /// Loop exited after the market closed
    Stopped,
}

/// Cadence of one strategy loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Wait between strategy invocations
    pub frequency: Duration,
    /// Poll interval of the portfolio's confirmation loop
    pub confirm_poll: Duration,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            frequency: Duration::from_secs(60),
            confirm_poll: Duration::from_secs(5),
        }
    }
}

impl ScheduleOptions {
    pub fn every(frequency: Duration) -> Self {
        Self {
            frequency,
            ..Default::default()
        }
    }

    pub fn with_confirm_poll(mut self, confirm_poll: Duration) -> Self {
        self.confirm_poll = confirm_poll;
        self
    }
}

struct Registration {
    strategy: Arc<dyn Strategy>,
    options: ScheduleOptions,
    state: RunState,
    task: Option<JoinHandle<()>>,
}

/// Run state shared by the poller and every strategy loop
pub struct SchedulerState {
    venue: String,
    poll_interval: Duration,
    market_open: watch::Sender<bool>,
    registry: Mutex<BTreeMap<String, Registration>>,
    poller_running: watch::Sender<bool>,
    poller: StdMutex<Option<JoinHandle<()>>>,
}

impl SchedulerState {
    pub fn new(venue: impl Into<String>, poll_interval: Duration) -> Self {
        let (market_open, _) = watch::channel(false);
        let (poller_running, _) = watch::channel(false);
        Self {
            venue: venue.into(),
            poll_interval,
            market_open,
            registry: Mutex::new(BTreeMap::new()),
            poller_running,
            poller: StdMutex::new(None),
        }
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    pub fn is_market_open(&self) -> bool {
        *self.market_open.borrow()
    }

    fn set_market_open(&self, open: bool) {
        let was_open = self.market_open.send_replace(open);
        if was_open != open {
            info!(venue = %self.venue, open, "Market state changed");
        }
    }

    /// Spawn the loop of one registration.
    fn launch(self: &Arc<Self>, portfolio: Portfolio, registration: &mut Registration) {
        registration.state = RunState::Started;
        registration.task = Some(tokio::spawn(run_strategy_loop(
            self.clone(),
            portfolio,
            registration.strategy.clone(),
            registration.options,
        )));
    }

    async fn mark_stopped(&self, portfolio: &str) {
        if let Some(registration) = self.registry.lock().await.get_mut(portfolio) {
            registration.state = RunState::Stopped;
        }
    }
}

async fn run_strategy_loop(
    state: Arc<SchedulerState>,
    portfolio: Portfolio,
    strategy: Arc<dyn Strategy>,
    options: ScheduleOptions,
) {
    let mut market_open = state.market_open.subscribe();
    portfolio.start_confirmation(options.confirm_poll);
    info!(portfolio = %portfolio.name(), strategy = strategy.name(), "Strategy loop started");

    while *market_open.borrow_and_update() {
        debug!(portfolio = %portfolio.name(), strategy = strategy.name(), "Running strategy");
        if let Err(e) = strategy.run(&portfolio).await {
            error!(
                portfolio = %portfolio.name(),
                strategy = strategy.name(),
                error = %e,
                "Strategy invocation failed"
            );
            portfolio.record_failure(&e).await;
        }

        tokio::select! {
            _ = tokio::time::sleep(options.frequency) => {}
            changed = market_open.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    portfolio.stop_confirmation().await;
    // orders the last invocation submitted must be queued before the sweep
    portfolio.wait_for_placements().await;
    let cancelled = portfolio.cancel_pending_orders().await;
    state.mark_stopped(portfolio.name()).await;
    info!(
        portfolio = %portfolio.name(),
        strategy = strategy.name(),
        cancelled,
        "Strategy loop stopped"
    );
}

impl PortfolioManager {
    /// Register a strategy on a portfolio; starts at once if the market is open
    pub async fn schedule(
        &self,
        strategy: Arc<dyn Strategy>,
        portfolio: &str,
        options: ScheduleOptions,
    ) -> PortfolioResult<()> {
        let target = self.portfolio(portfolio).await?;

        let mut registry = self.scheduler.registry.lock().await;
        if registry.contains_key(portfolio) {
            return Err(PortfolioError::AlreadyScheduled(portfolio.to_string()));
        }

        let mut registration = Registration {
            strategy,
            options,
            state: RunState::Pending,
            task: None,
        };
        info!(
            portfolio,
            strategy = registration.strategy.name(),
            frequency_secs = options.frequency.as_secs_f64(),
            "Strategy scheduled"
        );
        if self.scheduler.is_market_open() {
            self.scheduler.launch(target, &mut registration);
        }
        registry.insert(portfolio.to_string(), registration);
        Ok(())
    }

    /// Run state of the strategy registered on a portfolio
    pub async fn run_state(&self, portfolio: &str) -> Option<RunState> {
        self.scheduler
            .registry
            .lock()
            .await
            .get(portfolio)
            .map(|registration| registration.state)
    }

    pub fn is_market_open(&self) -> bool {
        self.scheduler.is_market_open()
    }

    /// One poller step: sync `market_open` with the broker and start idle loops.
    ///
    /// Returns whether the market is open.
    pub async fn check_work(&self) -> PortfolioResult<bool> {
        if self.portfolio_names().await.is_empty() {
            self.scheduler.set_market_open(false);
            return Ok(false);
        }

        let now = self
            .broker()
            .server_time()
            .await
            .map_err(PortfolioError::Broker)?;
        let hours = self
            .broker()
            .market_hours(self.scheduler.venue(), now.date_naive())
            .await
            .map_err(PortfolioError::Broker)?;

        let open = hours.is_open_at(now);
        self.scheduler.set_market_open(open);
        if !open {
            return Ok(false);
        }

        let mut registry = self.scheduler.registry.lock().await;
        for (name, registration) in registry.iter_mut() {
            let alive = registration
                .task
                .as_ref()
                .is_some_and(|task| !task.is_finished());
            if registration.state == RunState::Started && alive {
                continue;
            }
            match self.portfolio(name).await {
                Ok(portfolio) => self.scheduler.launch(portfolio, registration),
                Err(e) => warn!(portfolio = %name, error = %e, "Scheduled portfolio is gone"),
            }
        }
        Ok(true)
    }

    /// Start the market-hours poller; returns `false` if it already runs
    pub fn start_poller(self: &Arc<Self>) -> bool {
        let scheduler = &self.scheduler;
        let mut poller = scheduler.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        scheduler.poller_running.send_replace(true);
        let mut running = scheduler.poller_running.subscribe();
        let manager = self.clone();
        let interval = scheduler.poll_interval;

        *poller = Some(tokio::spawn(async move {
            info!(manager = %manager.name(), interval_secs = interval.as_secs(), "Market poller started");
            while *running.borrow_and_update() {
                match manager.check_work().await {
                    Ok(open) => debug!(open, "Market check complete"),
                    Err(e) => warn!(error = %e, "Market check failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = running.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!(manager = %manager.name(), "Market poller stopped");
        }));
        true
    }

    /// Stop the poller and wait for it to exit
    pub async fn stop_poller(&self) {
        self.scheduler.poller_running.send_replace(false);
        let handle = self
            .scheduler
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Market poller failed");
            }
        }
    }

    /// Stop every loop, wait for in-flight work, and save if a store is given
    pub async fn shutdown(&self, store: Option<&PortfolioStore>) -> PortfolioResult<()> {
        info!(manager = %self.name(), "Shutting down portfolio manager");
        self.stop_poller().await;
        self.scheduler.set_market_open(false);

        let tasks: Vec<JoinHandle<()>> = self
            .scheduler
            .registry
            .lock()
            .await
            .values_mut()
            .filter_map(|registration| registration.task.take())
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Strategy loop failed");
            }
        }

        for portfolio in self.portfolios().await {
            portfolio.stop_confirmation().await;
            portfolio.wait_for_placements().await;
        }

        if let Some(store) = store {
            self.save_all(store).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zero_common::PortfolioServiceConfig;

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Strategy for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self, _portfolio: &Portfolio) -> PortfolioResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn setup() -> (Arc<PaperBroker>, Arc<PortfolioManager>) {
        let broker = Arc::new(PaperBroker::new("paper-1", 100.0));
        let manager = PortfolioManager::connect(&PortfolioServiceConfig::default(), broker.clone())
            .await
            .unwrap();
        manager.add_portfolio("First", 30.0).await.unwrap();
        (broker, Arc::new(manager))
    }

    fn fast() -> ScheduleOptions {
        ScheduleOptions::every(Duration::from_millis(5)).with_confirm_poll(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let (_, manager) = setup().await;
        let strategy = Arc::new(Counting { calls: AtomicUsize::new(0) });

        manager.schedule(strategy.clone(), "First", fast()).await.unwrap();
        assert!(matches!(
            manager.schedule(strategy, "First", fast()).await,
            Err(PortfolioError::AlreadyScheduled(_))
        ));
        assert_eq!(manager.run_state("First").await, Some(RunState::Pending));
    }

    #[tokio::test]
    async fn test_closed_market_keeps_loops_pending() {
        let (_, manager) = setup().await;
        let strategy = Arc::new(Counting { calls: AtomicUsize::new(0) });
        manager.schedule(strategy.clone(), "First", fast()).await.unwrap();

        assert!(!manager.check_work().await.unwrap());
        assert!(!manager.is_market_open());
        assert_eq!(manager.run_state("First").await, Some(RunState::Pending));
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_then_close_runs_and_stops_loop() {
        let (broker, manager) = setup().await;
        let strategy = Arc::new(Counting { calls: AtomicUsize::new(0) });
        manager.schedule(strategy.clone(), "First", fast()).await.unwrap();

        broker.set_market_open(true).await;
        assert!(manager.check_work().await.unwrap());
        assert_eq!(manager.run_state("First").await, Some(RunState::Started));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(strategy.calls.load(Ordering::SeqCst) >= 1);

        broker.set_market_open(false).await;
        assert!(!manager.check_work().await.unwrap());

        for _ in 0..200 {
            if manager.run_state("First").await == Some(RunState::Stopped) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.run_state("First").await, Some(RunState::Stopped));
        assert!(!manager.portfolio("First").await.unwrap().is_confirming());
    }
}
