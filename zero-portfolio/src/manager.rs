//! Portfolio manager: allocation of one account across portfolios.
//!
//! The manager owns the unassigned pool, the cash and shares of the account
//! that no portfolio holds. Pool figures are recomputed from the broker
//! minus the sum of portfolio balances on every reconciliation rather than
//! tracked continuously. Lock order is portfolios map, then pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use zero_common::PortfolioServiceConfig;

use crate::broker::Broker;
use crate::error::{PortfolioError, PortfolioResult};
use crate::instrument::SymbolInstrumentCache;
use crate::portfolio::{EntryKind, Portfolio, PortfolioSettings, TransferDirection};
use crate::scheduler::SchedulerState;
use crate::store::PortfolioStore;

/// Account value not allocated to any portfolio
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pool {
    pub unassigned_cash: f64,
    pub unassigned_shares: BTreeMap<String, f64>,
    /// Account average buy price per symbol, used to value allocated shares
    pub account_cost: BTreeMap<String, f64>,
}

/// Creates portfolios over one broker account and keeps their allocations disjoint
pub struct PortfolioManager {
    name: String,
    broker: Arc<dyn Broker>,
    instruments: Arc<SymbolInstrumentCache>,
    settings: PortfolioSettings,
    pool: RwLock<Pool>,
    portfolios: RwLock<BTreeMap<String, Portfolio>>,
    pub(crate) scheduler: Arc<SchedulerState>,
}

impl PortfolioManager {
    /// Create a manager with an empty pool; call [`Self::reconcile`] before allocating
    pub fn new(config: &PortfolioServiceConfig, broker: Arc<dyn Broker>) -> Self {
        let instruments = Arc::new(SymbolInstrumentCache::new(
            broker.clone(),
            config.instrument_cache_capacity,
            config.instrument_ref_prefix.clone(),
        ));

        Self {
            name: config.manager_name.clone(),
            broker,
            instruments,
            settings: PortfolioSettings::from(config),
            pool: RwLock::new(Pool::default()),
            portfolios: RwLock::new(BTreeMap::new()),
            scheduler: Arc::new(SchedulerState::new(
                config.venue.clone(),
                Duration::from_secs(config.market_poll_minutes.max(1) * 60),
            )),
        }
    }

    /// Create a manager and seed the pool from the account
    pub async fn connect(
        config: &PortfolioServiceConfig,
        broker: Arc<dyn Broker>,
    ) -> PortfolioResult<Self> {
        let manager = Self::new(config, broker);
        manager.reconcile().await?;

        let pool = manager.pool.read().await;
        info!(
            manager = %manager.name,
            broker = manager.broker.name(),
            account = %manager.broker.account_id(),
            unassigned_cash = pool.unassigned_cash,
            symbols = pool.unassigned_shares.len(),
            "Portfolio manager connected"
        );
        drop(pool);
        Ok(manager)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn instruments(&self) -> &Arc<SymbolInstrumentCache> {
        &self.instruments
    }

    pub fn settings(&self) -> &PortfolioSettings {
        &self.settings
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Refresh both cash and share pools
    pub async fn reconcile(&self) -> PortfolioResult<()> {
        self.reconcile_cash().await?;
        self.reconcile_shares().await
    }

    /// `unassigned_cash = available_cash - Σ portfolio cash`
    pub async fn reconcile_cash(&self) -> PortfolioResult<f64> {
        let available = self.cash_owned().await?;
        let portfolios = self.portfolios.read().await;
        let mut pool = self.pool.write().await;
        Ok(recompute_cash(available, &portfolios, &mut pool).await)
    }

    /// `unassigned_shares[s] = account shares[s] - Σ portfolio shares[s]`
    pub async fn reconcile_shares(&self) -> PortfolioResult<()> {
        let account = self.account_holdings().await?;
        let portfolios = self.portfolios.read().await;
        let mut pool = self.pool.write().await;
        recompute_shares(account, &portfolios, &mut pool).await;
        Ok(())
    }

    /// Shares and average buy price per symbol held by the account
    async fn account_holdings(&self) -> PortfolioResult<AccountHoldings> {
        let owned = self
            .broker
            .securities_owned()
            .await
            .map_err(PortfolioError::Broker)?;

        let mut account = AccountHoldings::default();
        for security in owned {
            match self.instruments.symbol_for(&security.instrument).await {
                Some(symbol) => {
                    *account.shares.entry(symbol.clone()).or_insert(0.0) += security.quantity;
                    account.cost.insert(symbol, security.avg_buy_price);
                }
                None => {
                    warn!(instrument = %security.instrument, "Skipping unresolvable holding");
                }
            }
        }
        Ok(account)
    }

    // ========================================================================
    // Portfolio lifecycle
    // ========================================================================

    /// Create a portfolio funded from the pool
    pub async fn add_portfolio(&self, name: &str, initial_cash: f64) -> PortfolioResult<Portfolio> {
        self.add_portfolio_with(name, initial_cash, self.settings.clone())
            .await
    }

    /// Create a portfolio with its own settings (e.g. a cancel budget)
    pub async fn add_portfolio_with(
        &self,
        name: &str,
        initial_cash: f64,
        settings: PortfolioSettings,
    ) -> PortfolioResult<Portfolio> {
        if !(initial_cash.is_finite() && initial_cash >= 0.0) {
            return Err(PortfolioError::AllocationViolation(format!(
                "initial cash must be non-negative, got {}",
                initial_cash
            )));
        }

        let cash_limit = match settings.initial_cash_cap {
            Some(cap) => Some(self.cash_owned().await? * cap),
            None => None,
        };

        let mut portfolios = self.portfolios.write().await;
        if portfolios.contains_key(name) {
            return Err(PortfolioError::AllocationViolation(format!(
                "portfolio {} already exists",
                name
            )));
        }

        let mut pool = self.pool.write().await;
        if initial_cash >= pool.unassigned_cash {
            return Err(PortfolioError::AllocationViolation(format!(
                "initial cash {:.2} must be below unassigned cash {:.2}",
                initial_cash, pool.unassigned_cash
            )));
        }

        let cash = cash_limit.map_or(initial_cash, |limit| initial_cash.min(limit));
        let portfolio = Portfolio::new(
            name,
            self.broker.clone(),
            self.instruments.clone(),
            cash,
            settings,
        );
        pool.unassigned_cash -= cash;
        portfolios.insert(name.to_string(), portfolio.clone());

        info!(
            manager = %self.name,
            portfolio = %name,
            cash,
            unassigned_cash = pool.unassigned_cash,
            "Portfolio added"
        );
        Ok(portfolio)
    }

    /// Restore a saved portfolio into the manager
    pub async fn load_portfolio(&self, name: &str, store: &PortfolioStore) -> PortfolioResult<Portfolio> {
        let snapshot = store
            .load(name)
            .map_err(PortfolioError::Storage)?
            .ok_or_else(|| PortfolioError::UnknownPortfolio(name.to_string()))?;

        if snapshot.account_id != self.broker.account_id() {
            return Err(PortfolioError::AllocationViolation(format!(
                "saved portfolio {} belongs to account {}",
                name, snapshot.account_id
            )));
        }

        let mut portfolios = self.portfolios.write().await;
        if portfolios.contains_key(name) {
            return Err(PortfolioError::AllocationViolation(format!(
                "portfolio {} already exists",
                name
            )));
        }

        let mut pool = self.pool.write().await;
        if snapshot.holdings.cash >= pool.unassigned_cash {
            return Err(PortfolioError::AllocationViolation(format!(
                "saved cash {:.2} of {} exceeds unassigned cash {:.2}",
                snapshot.holdings.cash, name, pool.unassigned_cash
            )));
        }
        for (symbol, position) in &snapshot.holdings.positions {
            let free = pool.unassigned_shares.get(symbol).copied().unwrap_or(0.0);
            if position.shares > free {
                return Err(PortfolioError::AllocationViolation(format!(
                    "saved {} shares of {} exceed unassigned {}",
                    position.shares, symbol, free
                )));
            }
        }

        let cash = snapshot.holdings.cash;
        let positions = snapshot.holdings.positions.clone();
        let portfolio = Portfolio::new(
            name,
            self.broker.clone(),
            self.instruments.clone(),
            0.0,
            self.settings.clone(),
        );
        portfolio.restore(snapshot).await?;

        pool.unassigned_cash -= cash;
        for (symbol, position) in positions {
            if let Some(free) = pool.unassigned_shares.get_mut(&symbol) {
                *free -= position.shares;
            }
        }
        portfolios.insert(name.to_string(), portfolio.clone());

        info!(manager = %self.name, portfolio = %name, cash, "Portfolio loaded");
        Ok(portfolio)
    }

    /// Persist every portfolio
    pub async fn save_all(&self, store: &PortfolioStore) -> PortfolioResult<()> {
        let portfolios: Vec<Portfolio> = self.portfolios.read().await.values().cloned().collect();
        for portfolio in portfolios {
            portfolio.save(store).await?;
        }
        Ok(())
    }

    pub async fn portfolio(&self, name: &str) -> PortfolioResult<Portfolio> {
        self.portfolios
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PortfolioError::UnknownPortfolio(name.to_string()))
    }

    pub async fn portfolio_names(&self) -> Vec<String> {
        self.portfolios.read().await.keys().cloned().collect()
    }

    pub async fn portfolios(&self) -> Vec<Portfolio> {
        self.portfolios.read().await.values().cloned().collect()
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Move cash from the pool into a portfolio
    pub async fn add_cash_to(&self, name: &str, amount: f64) -> PortfolioResult<()> {
        let portfolio = self.portfolio(name).await?;
        require_positive(amount)?;
        let available = self.cash_owned().await?;

        let portfolios = self.portfolios.read().await;
        let mut pool = self.pool.write().await;
        let unassigned = recompute_cash(available, &portfolios, &mut pool).await;
        if unassigned <= amount {
            return Err(PortfolioError::AllocationViolation(format!(
                "cannot add {:.2} to {}: unassigned cash is {:.2}",
                amount, name, unassigned
            )));
        }
        portfolio.credit_cash(amount, EntryKind::AddCash).await;
        pool.unassigned_cash -= amount;

        info!(portfolio = %name, amount, unassigned_cash = pool.unassigned_cash, "Cash added from pool");
        Ok(())
    }

    /// Return cash from a portfolio to the pool
    pub async fn draw_cash_from(&self, name: &str, amount: f64) -> PortfolioResult<()> {
        let portfolio = self.portfolio(name).await?;
        require_positive(amount)?;
        let available = self.cash_owned().await?;

        let portfolios = self.portfolios.read().await;
        let mut pool = self.pool.write().await;
        recompute_cash(available, &portfolios, &mut pool).await;
        portfolio.debit_cash(amount, EntryKind::DrawCash).await?;
        pool.unassigned_cash += amount;

        info!(portfolio = %name, amount, unassigned_cash = pool.unassigned_cash, "Cash drawn to pool");
        Ok(())
    }

    /// Move shares from the pool into a portfolio at the account's average buy price
    pub async fn add_shares_to(&self, name: &str, symbol: &str, amount: f64) -> PortfolioResult<()> {
        let portfolio = self.portfolio(name).await?;
        require_positive(amount)?;
        let account = self.account_holdings().await?;

        let portfolios = self.portfolios.read().await;
        let mut pool = self.pool.write().await;
        recompute_shares(account, &portfolios, &mut pool).await;

        let free = pool.unassigned_shares.get(symbol).copied().unwrap_or(0.0);
        if free < amount {
            return Err(PortfolioError::AllocationViolation(format!(
                "cannot add {} {} to {}: unassigned shares are {}",
                amount, symbol, name, free
            )));
        }
        let price = pool.account_cost.get(symbol).copied().unwrap_or(0.0);

        portfolio.add_pool_shares(symbol, price, amount).await;
        if let Some(free) = pool.unassigned_shares.get_mut(symbol) {
            *free -= amount;
        }

        info!(portfolio = %name, symbol, amount, price, "Shares added from pool");
        Ok(())
    }

    /// Return shares from a portfolio to the pool
    pub async fn draw_shares_from(&self, name: &str, symbol: &str, amount: f64) -> PortfolioResult<()> {
        let portfolio = self.portfolio(name).await?;
        require_positive(amount)?;
        let account = self.account_holdings().await?;

        let portfolios = self.portfolios.read().await;
        let mut pool = self.pool.write().await;
        recompute_shares(account, &portfolios, &mut pool).await;
        portfolio.draw_pool_shares(symbol, amount).await?;
        *pool.unassigned_shares.entry(symbol.to_string()).or_insert(0.0) += amount;

        info!(portfolio = %name, symbol, amount, "Shares drawn to pool");
        Ok(())
    }

    /// Move cash between two managed portfolios
    pub async fn transfer_cash(&self, from: &str, to: &str, amount: f64) -> PortfolioResult<bool> {
        let source = self.portfolio(from).await?;
        let dest = self.portfolio(to).await?;
        source
            .transfer_cash(&dest, amount, TransferDirection::To)
            .await
    }

    /// Move shares between two managed portfolios
    pub async fn transfer_shares(
        &self,
        from: &str,
        to: &str,
        symbol: &str,
        amount: f64,
    ) -> PortfolioResult<bool> {
        let source = self.portfolio(from).await?;
        let dest = self.portfolio(to).await?;
        source
            .transfer_shares(&dest, symbol, amount, TransferDirection::To)
            .await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn unassigned_cash(&self) -> f64 {
        self.pool.read().await.unassigned_cash
    }

    pub async fn unassigned_shares(&self, symbol: &str) -> f64 {
        self.pool
            .read()
            .await
            .unassigned_shares
            .get(symbol)
            .copied()
            .unwrap_or(0.0)
    }

    pub async fn pool(&self) -> Pool {
        self.pool.read().await.clone()
    }

    /// Available cash of the whole account
    pub async fn cash_owned(&self) -> PortfolioResult<f64> {
        Ok(self
            .broker
            .account_balances()
            .await
            .map_err(PortfolioError::Broker)?
            .available_cash)
    }

    /// Shares of every symbol held by the whole account
    pub async fn securities_owned(&self) -> PortfolioResult<BTreeMap<String, f64>> {
        let owned = self
            .broker
            .securities_owned()
            .await
            .map_err(PortfolioError::Broker)?;

        let mut shares = BTreeMap::new();
        for security in owned {
            if let Some(symbol) = self.instruments.symbol_for(&security.instrument).await {
                *shares.entry(symbol).or_insert(0.0) += security.quantity;
            }
        }
        Ok(shares)
    }
}

/// Account-wide share balances before subtracting portfolio holdings
#[derive(Debug, Default)]
struct AccountHoldings {
    shares: BTreeMap<String, f64>,
    cost: BTreeMap<String, f64>,
}

/// Recompute the cash pool.
///
/// Callers keep the portfolios map and the pool locked until their move is
/// applied.
async fn recompute_cash(
    available: f64,
    portfolios: &BTreeMap<String, Portfolio>,
    pool: &mut Pool,
) -> f64 {
    let mut allocated = 0.0;
    for portfolio in portfolios.values() {
        allocated += portfolio.cash().await;
    }
    pool.unassigned_cash = available - allocated;
    pool.unassigned_cash
}

/// Recompute the share pool under the same guards as [`recompute_cash`]
async fn recompute_shares(
    account: AccountHoldings,
    portfolios: &BTreeMap<String, Portfolio>,
    pool: &mut Pool,
) {
    let mut shares = account.shares;
    for portfolio in portfolios.values() {
        for (symbol, position) in portfolio.positions().await {
            *shares.entry(symbol).or_insert(0.0) -= position.shares;
        }
    }
    pool.unassigned_shares = shares;
    pool.account_cost = account.cost;
}

fn require_positive(amount: f64) -> PortfolioResult<()> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(PortfolioError::AllocationViolation(format!(
            "amount must be positive, got {}",
            amount
        )))
    }
}

// ============================================================================
// Tests
// ============================================================================
