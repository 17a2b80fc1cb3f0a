//! Portfolios: independent sub-ledgers over one brokerage account.
//!
//! A [`Portfolio`] owns a cash balance, a position table, a FIFO of orders
//! awaiting confirmation, an append-only trade log and a diagnostic log.
//! Each of the four regions sits behind its own lock; sections touching
//! several regions take holdings before the trade log, and no lock is held
//! across a broker call.
//!
//! - `orders`: placement intents handed to a bounded worker pool
//! - `confirm`: the confirmation loop applying broker fills
//! - `transfer`: cash and share moves between portfolios

mod confirm;
mod ledger;
mod orders;
mod transfer;
mod workers;

pub use confirm::ConfirmOutcome;
pub use ledger::{DiagnosticEntry, EntryKind, Holdings, PortfolioSnapshot, TradeRecord};
pub use transfer::TransferDirection;

use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use zero_common::PortfolioServiceConfig;

use crate::broker::Broker;
use crate::error::{PortfolioError, PortfolioResult};
use crate::execution::{reduce, PendingOrder, Position};
use crate::instrument::SymbolInstrumentCache;
use crate::store::PortfolioStore;

use confirm::ConfirmControl;
use workers::OrderWorkers;

/// Tunables shared by every portfolio of a manager
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioSettings {
    /// Headroom on top of `price × quantity` required before a buy
    pub buy_margin: f64,
    /// Polls without executions before an order is cancelled
    pub cancel_budget: Option<u32>,
    /// Share of account cash a standalone portfolio may start with
    pub initial_cash_cap: Option<f64>,
    /// Concurrent placement workers
    pub max_order_workers: usize,
}

impl Default for PortfolioSettings {
    fn default() -> Self {
        Self {
            buy_margin: 0.005,
            cancel_budget: None,
            initial_cash_cap: Some(0.7),
            max_order_workers: 8,
        }
    }
}

impl From<&PortfolioServiceConfig> for PortfolioSettings {
    fn from(config: &PortfolioServiceConfig) -> Self {
        Self {
            buy_margin: config.buy_margin,
            cancel_budget: config.cancel_budget,
            initial_cash_cap: Some(config.initial_cash_cap),
            max_order_workers: config.max_order_workers,
        }
    }
}

impl PortfolioSettings {
    pub fn with_cancel_budget(mut self, budget: Option<u32>) -> Self {
        self.cancel_budget = budget;
        self
    }

    /// Let a standalone portfolio start with any amount of account cash
    pub fn without_cash_cap(mut self) -> Self {
        self.initial_cash_cap = None;
        self
    }
}

struct PortfolioInner {
    name: String,
    broker: Arc<dyn Broker>,
    instruments: Arc<SymbolInstrumentCache>,
    settings: PortfolioSettings,
    holdings: Mutex<Holdings>,
    trade_log: Mutex<Vec<TradeRecord>>,
    orders: Mutex<VecDeque<PendingOrder>>,
    diagnostics: Mutex<Vec<DiagnosticEntry>>,
    workers: OrderWorkers,
    confirm: ConfirmControl,
}

/// Handle to one portfolio; clones share the same ledger
#[derive(Clone)]
pub struct Portfolio {
    inner: Arc<PortfolioInner>,
}

impl fmt::Debug for Portfolio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portfolio")
            .field("name", &self.inner.name)
            .field("account", &self.inner.broker.account_id())
            .field("placements_in_flight", &self.inner.workers.in_flight())
            .finish()
    }
}

impl Portfolio {
    /// Create a portfolio starting with exactly `cash`
    pub fn new(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        instruments: Arc<SymbolInstrumentCache>,
        cash: f64,
        settings: PortfolioSettings,
    ) -> Self {
        let workers = OrderWorkers::new(settings.max_order_workers);
        Self {
            inner: Arc::new(PortfolioInner {
                name: name.into(),
                broker,
                instruments,
                settings,
                holdings: Mutex::new(Holdings::new(cash)),
                trade_log: Mutex::new(Vec::new()),
                orders: Mutex::new(VecDeque::new()),
                diagnostics: Mutex::new(Vec::new()),
                workers,
                confirm: ConfirmControl::new(),
            }),
        }
    }

    /// Create a standalone portfolio funded from the account.
    ///
    /// With a cash cap configured, a missing or too large request is clamped
    /// to `cap × available_cash`.
    pub async fn open(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        instruments: Arc<SymbolInstrumentCache>,
        requested_cash: Option<f64>,
        settings: PortfolioSettings,
    ) -> PortfolioResult<Self> {
        let available = broker
            .account_balances()
            .await
            .map_err(PortfolioError::Broker)?
            .available_cash;

        let cash = match settings.initial_cash_cap {
            Some(cap) => {
                let limit = available * cap;
                match requested_cash {
                    Some(cash) if cash < limit => cash,
                    _ => limit,
                }
            }
            None => requested_cash.unwrap_or(available),
        };

        let portfolio = Self::new(name, broker, instruments, cash, settings);
        info!(portfolio = %portfolio.name(), cash, "Opened portfolio");
        Ok(portfolio)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    /// Account every portfolio on the same broker draws from
    pub fn account_id(&self) -> &str {
        self.inner.broker.account_id()
    }

    pub fn settings(&self) -> &PortfolioSettings {
        &self.inner.settings
    }

    /// Whether both handles refer to the same ledger
    pub fn same_as(&self, other: &Portfolio) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Spendable cash
    pub async fn cash(&self) -> f64 {
        self.inner.holdings.lock().await.cash
    }

    /// Copy of the cash balance and position table
    pub async fn holdings(&self) -> Holdings {
        self.inner.holdings.lock().await.clone()
    }

    pub async fn positions(&self) -> BTreeMap<String, Position> {
        self.inner.holdings.lock().await.positions.clone()
    }

    pub async fn position(&self, symbol: &str) -> Option<Position> {
        self.inner.holdings.lock().await.positions.get(symbol).copied()
    }

    /// Shares held of a symbol, 0 when flat
    pub async fn shares_owned(&self, symbol: &str) -> f64 {
        self.inner.holdings.lock().await.shares(symbol)
    }

    pub async fn trade_log(&self) -> Vec<TradeRecord> {
        self.inner.trade_log.lock().await.clone()
    }

    pub async fn diagnostics(&self) -> Vec<DiagnosticEntry> {
        self.inner.diagnostics.lock().await.clone()
    }

    /// Orders awaiting confirmation, queue head first
    pub async fn pending_orders(&self) -> Vec<PendingOrder> {
        self.inner.orders.lock().await.iter().cloned().collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.orders.lock().await.len()
    }

    /// Last trade price of every held symbol
    pub async fn last_prices(&self) -> PortfolioResult<BTreeMap<String, f64>> {
        let symbols: Vec<String> = self.inner.holdings.lock().await.positions.keys().cloned().collect();
        if symbols.is_empty() {
            return Ok(BTreeMap::new());
        }

        let prices = self
            .inner
            .broker
            .last_trade_price(&symbols)
            .await
            .map_err(PortfolioError::Broker)?;
        Ok(symbols.into_iter().zip(prices).collect())
    }

    /// Cash plus every position valued at its last trade price
    pub async fn market_value(&self) -> PortfolioResult<f64> {
        let prices = self.last_prices().await?;
        let holdings = self.inner.holdings.lock().await;
        let invested: f64 = holdings
            .positions
            .iter()
            .map(|(symbol, position)| {
                prices
                    .get(symbol)
                    .map_or(0.0, |price| position.market_value(*price))
            })
            .sum();
        Ok(holdings.cash + invested)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Current state for the store
    pub async fn snapshot(&self) -> PortfolioSnapshot {
        let holdings = self.inner.holdings.lock().await.clone();
        let trade_log = self.inner.trade_log.lock().await.clone();
        let diagnostics = self.inner.diagnostics.lock().await.clone();
        PortfolioSnapshot {
            name: self.inner.name.clone(),
            account_id: self.account_id().to_string(),
            holdings,
            trade_log,
            diagnostics,
            saved_at: Utc::now(),
        }
    }

    /// Wait for in-flight placements, then persist the ledger
    pub async fn save(&self, store: &PortfolioStore) -> PortfolioResult<()> {
        self.inner.workers.drain().await;
        let snapshot = self.snapshot().await;
        store.save(&snapshot).map_err(PortfolioError::Storage)?;
        info!(
            portfolio = %self.inner.name,
            trades = snapshot.trade_log.len(),
            positions = snapshot.holdings.positions.len(),
            "Saved portfolio"
        );
        Ok(())
    }

    /// Replace trade log, positions, cash and diagnostics with a saved state.
    ///
    /// Refused while orders are queued or the confirmation loop runs.
    pub async fn restore(&self, snapshot: PortfolioSnapshot) -> PortfolioResult<()> {
        self.inner.workers.drain().await;
        if self.is_confirming() || self.pending_count().await > 0 {
            return Err(PortfolioError::Busy(self.inner.name.clone()));
        }

        let mut holdings = self.inner.holdings.lock().await;
        let mut trade_log = self.inner.trade_log.lock().await;
        let mut diagnostics = self.inner.diagnostics.lock().await;
        *holdings = snapshot.holdings;
        *trade_log = snapshot.trade_log;
        *diagnostics = snapshot.diagnostics;

        info!(
            portfolio = %self.inner.name,
            cash = holdings.cash,
            positions = holdings.positions.len(),
            "Restored portfolio"
        );
        Ok(())
    }

    // ========================================================================
    // Internal bookkeeping
    // ========================================================================

    /// Log a recovered failure to the diagnostic log
    pub(crate) async fn record_failure(&self, err: &PortfolioError) {
        if err.is_recoverable() {
            warn!(portfolio = %self.inner.name, code = err.code(), error = %err, "Portfolio operation failed");
        } else {
            error!(portfolio = %self.inner.name, code = err.code(), error = %err, "Portfolio operation failed");
        }
        self.inner
            .diagnostics
            .lock()
            .await
            .push(DiagnosticEntry::new(err.code(), err.to_string()));
    }

    pub(crate) async fn append_trade(&self, record: TradeRecord) {
        self.inner.trade_log.lock().await.push(record);
    }

    pub(crate) async fn lock_holdings(&self) -> MutexGuard<'_, Holdings> {
        self.inner.holdings.lock().await
    }

    /// Move cash in from the manager pool
    pub(crate) async fn credit_cash(&self, amount: f64, kind: EntryKind) {
        let mut holdings = self.inner.holdings.lock().await;
        holdings.cash += amount;
        self.append_trade(TradeRecord::cash(amount, kind)).await;
    }

    /// Move cash out to the manager pool
    pub(crate) async fn debit_cash(&self, amount: f64, kind: EntryKind) -> PortfolioResult<()> {
        let mut holdings = self.inner.holdings.lock().await;
        if holdings.cash < amount {
            return Err(PortfolioError::InsufficientFunds {
                portfolio: self.inner.name.clone(),
                required: amount,
                available: holdings.cash,
            });
        }
        holdings.cash -= amount;
        self.append_trade(TradeRecord::cash(amount, kind)).await;
        Ok(())
    }

    /// Fold pool shares into the position at `price`
    pub(crate) async fn add_pool_shares(&self, symbol: &str, price: f64, amount: f64) {
        let mut holdings = self.inner.holdings.lock().await;
        holdings.add_shares(symbol, price, amount);
        self.append_trade(TradeRecord::shares(symbol, price, amount, EntryKind::AddShares))
            .await;
    }

    /// Return shares to the pool, keeping the average cost of the rest
    pub(crate) async fn draw_pool_shares(&self, symbol: &str, amount: f64) -> PortfolioResult<()> {
        let mut holdings = self.inner.holdings.lock().await;
        let position = match holdings.positions.get(symbol) {
            Some(position) if position.shares >= amount => *position,
            held => {
                return Err(PortfolioError::InsufficientShares {
                    portfolio: self.inner.name.clone(),
                    symbol: symbol.to_string(),
                    required: amount,
                    available: held.map_or(0.0, |p| p.shares),
                })
            }
        };
        holdings.set_position(symbol, reduce(&position, amount));
        self.append_trade(TradeRecord::shares(
            symbol,
            position.avg_cost,
            amount,
            EntryKind::DrawShares,
        ))
        .await;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
