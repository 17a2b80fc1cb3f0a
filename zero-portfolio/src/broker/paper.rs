//! Paper broker: an in-memory simulated brokerage account.
//!
//! Used by the service in paper mode and as the broker double in tests.
//! Orders are accepted immediately and, when auto-fill is enabled, filled on
//! their first status poll if the last price satisfies the order's limit and
//! stop conditions. Every knob (prices, market session, clock, refusals,
//! manual fills) is adjustable at runtime.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    AccountBalances, Broker, Execution, InstrumentRef, MarketHours, OrderHandle, OrderSnapshot,
    OwnedSecurity,
};
use crate::execution::{combine, reduce, OrderRequest, OrderSide, OrderStatus, Position};

/// Prefix of every instrument reference handed out by the paper broker
pub const PAPER_INSTRUMENT_PREFIX: &str = "https://paper.zero/instruments/";

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    state: OrderStatus,
    executions: Vec<Execution>,
}

impl PaperOrder {
    fn snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            state: self.state,
            side: self.request.side,
            order_type: self.request.order_type,
            quantity: self.request.quantity,
            executions: self.executions.clone(),
        }
    }

    fn filled_quantity(&self) -> f64 {
        self.executions.iter().map(|e| e.quantity).sum()
    }

    /// Price at which the order would execute against `last`, if any.
    fn executable_price(&self, last: f64) -> Option<f64> {
        let req = &self.request;

        let triggered = match req.stop_price {
            Some(stop) if req.order_type.needs_stop_price() => match req.side {
                OrderSide::Buy => last >= stop,
                OrderSide::Sell => last <= stop,
            },
            _ => true,
        };
        if !triggered {
            return None;
        }

        match req.price {
            Some(limit) if req.order_type.needs_price() => match req.side {
                OrderSide::Buy => (last <= limit).then_some(last),
                OrderSide::Sell => (last >= limit).then_some(last),
            },
            _ => Some(last),
        }
    }
}

#[derive(Debug, Default)]
struct PaperState {
    cash: f64,
    holdings: HashMap<String, Position>,
    prices: HashMap<String, f64>,
    orders: HashMap<String, PaperOrder>,
    market_open: bool,
    clock: Option<DateTime<Utc>>,
    auto_fill: bool,
    refuse_next: usize,
    lookups: u64,
    cancelled: Vec<String>,
}

impl PaperState {
    fn book_execution(&mut self, side: OrderSide, symbol: &str, price: f64, quantity: f64) {
        let signed = side.sign() * quantity;
        self.cash -= price * signed;

        let next = match side {
            OrderSide::Buy => combine(self.holdings.get(symbol), price, signed),
            OrderSide::Sell => self
                .holdings
                .get(symbol)
                .and_then(|held| reduce(held, quantity.min(held.shares))),
        };
        match next {
            Some(position) => {
                self.holdings.insert(symbol.to_string(), position);
            }
            None => {
                self.holdings.remove(symbol);
            }
        }
    }
}

/// Simulated broker account
pub struct PaperBroker {
    account_id: String,
    state: RwLock<PaperState>,
}

impl PaperBroker {
    /// Create a paper account holding `cash`, with auto-fill enabled and the market closed
    pub fn new(account_id: impl Into<String>, cash: f64) -> Self {
        Self {
            account_id: account_id.into(),
            state: RwLock::new(PaperState {
                cash,
                auto_fill: true,
                ..Default::default()
            }),
        }
    }

    /// Instrument reference for a symbol
    pub fn instrument_for(symbol: &str) -> InstrumentRef {
        InstrumentRef::new(format!("{}{}/", PAPER_INSTRUMENT_PREFIX, symbol))
    }

    /// Set the last trade price of a symbol (also makes it resolvable)
    pub async fn set_price(&self, symbol: &str, price: f64) {
        self.state.write().await.prices.insert(symbol.to_string(), price);
    }

    /// Seed a holding in the account
    pub async fn set_holding(&self, symbol: &str, quantity: f64, avg_buy_price: f64) {
        let mut state = self.state.write().await;
        state
            .holdings
            .insert(symbol.to_string(), Position::new(avg_buy_price, quantity));
        state.prices.entry(symbol.to_string()).or_insert(avg_buy_price);
    }

    /// Overwrite the account's available cash
    pub async fn set_cash(&self, cash: f64) {
        self.state.write().await.cash = cash;
    }

    /// Open or close the simulated session
    pub async fn set_market_open(&self, open: bool) {
        self.state.write().await.market_open = open;
    }

    /// Pin the server clock (`None` follows the wall clock)
    pub async fn set_server_time(&self, time: Option<DateTime<Utc>>) {
        self.state.write().await.clock = time;
    }

    /// Enable or disable filling orders on their first status poll
    pub async fn set_auto_fill(&self, enabled: bool) {
        self.state.write().await.auto_fill = enabled;
    }

    /// Refuse to hand out a handle for the next `count` orders
    pub async fn refuse_next_orders(&self, count: usize) {
        self.state.write().await.refuse_next = count;
    }

    /// Report an execution against an open order
    pub async fn fill_order(&self, order_id: &str, price: f64, quantity: f64) -> Result<()> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow!("unknown paper order {}", order_id))?;

        order.executions.push(Execution {
            price,
            quantity,
            timestamp: Utc::now(),
        });
        order.state = if order.filled_quantity() >= order.request.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let side = order.request.side;
        let symbol = order.request.symbol.clone();

        state.book_execution(side, &symbol, price, quantity);
        Ok(())
    }

    /// Force an order into a status (e.g. a broker-side rejection)
    pub async fn set_order_state(&self, order_id: &str, status: OrderStatus) -> Result<()> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow!("unknown paper order {}", order_id))?;
        order.state = status;
        Ok(())
    }

    /// IDs of orders cancelled through the broker, in call order
    pub async fn cancelled_orders(&self) -> Vec<String> {
        self.state.read().await.cancelled.clone()
    }

    /// Number of orders ever accepted
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    /// Number of instrument lookups served (forward and reverse)
    pub async fn lookup_count(&self) -> u64 {
        self.state.read().await.lookups
    }

    /// Current simulated cash
    pub async fn cash(&self) -> f64 {
        self.state.read().await.cash
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn last_trade_price(&self, symbols: &[String]) -> Result<Vec<f64>> {
        let state = self.state.read().await;
        symbols
            .iter()
            .map(|symbol| {
                state
                    .prices
                    .get(symbol)
                    .copied()
                    .ok_or_else(|| anyhow!("no price for {}", symbol))
            })
            .collect()
    }

    async fn instrument_lookup(&self, symbol: &str) -> Result<InstrumentRef> {
        let mut state = self.state.write().await;
        state.lookups += 1;
        if !state.prices.contains_key(symbol) && !state.holdings.contains_key(symbol) {
            bail!("unknown symbol {}", symbol);
        }
        Ok(Self::instrument_for(symbol))
    }

    async fn reverse_instrument_lookup(&self, instrument: &InstrumentRef) -> Result<String> {
        let mut state = self.state.write().await;
        state.lookups += 1;
        let symbol = instrument
            .as_str()
            .strip_prefix(PAPER_INSTRUMENT_PREFIX)
            .map(|rest| rest.trim_end_matches('/'))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("not a paper instrument: {}", instrument))?;

        if !state.prices.contains_key(symbol) && !state.holdings.contains_key(symbol) {
            bail!("unknown instrument {}", instrument);
        }
        Ok(symbol.to_string())
    }

    async fn place_order(
        &self,
        instrument: &InstrumentRef,
        request: &OrderRequest,
    ) -> Result<Option<OrderHandle>> {
        let mut state = self.state.write().await;
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            debug!(order = %request.summary(), "Paper broker refused order");
            return Ok(None);
        }

        let id = format!("PAPER-{}", uuid::Uuid::new_v4());
        info!(
            broker = "paper",
            order_id = %id,
            instrument = %instrument,
            order = %request.summary(),
            "Accepted paper order"
        );
        state.orders.insert(
            id.clone(),
            PaperOrder {
                request: request.clone(),
                state: OrderStatus::Submitted,
                executions: Vec::new(),
            },
        );
        Ok(Some(OrderHandle::new(id)))
    }

    async fn order_status(&self, handle: &OrderHandle) -> Result<OrderSnapshot> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown paper order {}", handle.id))?;

        if order.state != OrderStatus::Submitted || !state.auto_fill {
            return Ok(order.snapshot());
        }

        let last = state.prices.get(&order.request.symbol).copied();
        let fill = last.and_then(|last| order.executable_price(last));

        let updated = match fill {
            Some(price) => {
                let quantity = order.request.quantity;
                state.book_execution(order.request.side, &order.request.symbol, price, quantity);
                let mut filled = order;
                filled.executions.push(Execution {
                    price,
                    quantity,
                    timestamp: Utc::now(),
                });
                filled.state = OrderStatus::Filled;
                filled
            }
            None if order.request.time_in_force.is_immediate() => {
                let mut killed = order;
                killed.state = OrderStatus::Cancelled;
                killed
            }
            None => order,
        };

        let snapshot = updated.snapshot();
        state.orders.insert(handle.id.clone(), updated);
        Ok(snapshot)
    }

    async fn cancel_order(&self, handle: &OrderHandle) -> Result<()> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&handle.id)
            .ok_or_else(|| anyhow!("unknown paper order {}", handle.id))?;
        if order.state.is_working() {
            order.state = OrderStatus::Cancelled;
        }
        state.cancelled.push(handle.id.clone());
        Ok(())
    }

    async fn account_balances(&self) -> Result<AccountBalances> {
        Ok(AccountBalances {
            available_cash: self.state.read().await.cash,
        })
    }

    async fn securities_owned(&self) -> Result<Vec<OwnedSecurity>> {
        let state = self.state.read().await;
        let mut owned: Vec<OwnedSecurity> = state
            .holdings
            .iter()
            .map(|(symbol, position)| OwnedSecurity {
                instrument: Self::instrument_for(symbol),
                quantity: position.shares,
                avg_buy_price: position.avg_cost,
            })
            .collect();
        owned.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        Ok(owned)
    }

    async fn market_hours(&self, _venue: &str, _date: NaiveDate) -> Result<MarketHours> {
        let state = self.state.read().await;
        if !state.market_open {
            return Ok(MarketHours::closed());
        }
        let now = state.clock.unwrap_or_else(Utc::now);
        Ok(MarketHours {
            is_open: true,
            opens_at: Some(now - Duration::hours(1)),
            closes_at: Some(now + Duration::hours(1)),
        })
    }

    async fn server_time(&self) -> Result<DateTime<Utc>> {
        Ok(self.state.read().await.clock.unwrap_or_else(Utc::now))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_market_order_fills_on_first_poll() {
        let broker = PaperBroker::new("paper-1", 1_000.0);
        broker.set_price("AAPL", 50.0).await;

        let instrument = broker.instrument_lookup("AAPL").await.unwrap();
        let handle = broker
            .place_order(&instrument, &OrderRequest::market("AAPL", OrderSide::Buy, 10.0))
            .await
            .unwrap()
            .unwrap();

        let snapshot = broker.order_status(&handle).await.unwrap();
        assert_eq!(snapshot.state, OrderStatus::Filled);
        assert_eq!(snapshot.executions.len(), 1);
        assert!((broker.cash().await - 500.0).abs() < 1e-9);

        let owned = broker.securities_owned().await.unwrap();
        assert_eq!(owned.len(), 1);
        assert!((owned[0].quantity - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_limit_order_waits_for_price() {
        let broker = PaperBroker::new("paper-1", 1_000.0);
        broker.set_price("AAPL", 50.0).await;
        let instrument = PaperBroker::instrument_for("AAPL");
        let handle = broker
            .place_order(
                &instrument,
                &OrderRequest::limit("AAPL", OrderSide::Buy, 1.0, 45.0),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            broker.order_status(&handle).await.unwrap().state,
            OrderStatus::Submitted
        );

        broker.set_price("AAPL", 44.0).await;
        let snapshot = broker.order_status(&handle).await.unwrap();
        assert_eq!(snapshot.state, OrderStatus::Filled);
        assert!((snapshot.executions[0].price - 44.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_refused_order_has_no_handle() {
        let broker = PaperBroker::new("paper-1", 1_000.0);
        broker.set_price("AAPL", 50.0).await;
        broker.refuse_next_orders(1).await;

        let instrument = PaperBroker::instrument_for("AAPL");
        let request = OrderRequest::market("AAPL", OrderSide::Buy, 1.0);
        assert!(broker.place_order(&instrument, &request).await.unwrap().is_none());
        assert!(broker.place_order(&instrument, &request).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reverse_lookup() {
        let broker = PaperBroker::new("paper-1", 0.0);
        broker.set_holding("MSFT", 3.0, 300.0).await;

        let instrument = PaperBroker::instrument_for("MSFT");
        assert_eq!(
            broker.reverse_instrument_lookup(&instrument).await.unwrap(),
            "MSFT"
        );
        assert!(broker
            .reverse_instrument_lookup(&InstrumentRef::new("https://elsewhere/x/"))
            .await
            .is_err());
        assert_eq!(broker.lookup_count().await, 2);
    }

    #[tokio::test]
    async fn test_market_hours_follow_flag() {
        let broker = PaperBroker::new("paper-1", 0.0);
        let now = broker.server_time().await.unwrap();
        let today = now.date_naive();

        assert!(!broker.market_hours("XNYS", today).await.unwrap().is_open_at(now));
        broker.set_market_open(true).await;
        assert!(broker.market_hours("XNYS", today).await.unwrap().is_open_at(now));
    }
}
