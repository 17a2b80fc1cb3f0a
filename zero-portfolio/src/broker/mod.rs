//! Broker adapters for order execution.
//!
//! The portfolio engine only talks to a brokerage through the [`Broker`]
//! trait. A single account backs every portfolio of a manager, so the trait
//! carries the account identity used to validate cross-portfolio transfers.
//!
//! - [`PaperBroker`]: in-memory simulated account

mod paper;

pub use paper::{PaperBroker, PAPER_INSTRUMENT_PREFIX};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::execution::{OrderRequest, OrderSide, OrderStatus, OrderType};

/// Broker-side reference to a tradable instrument
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentRef(String);

impl InstrumentRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle of an order accepted by the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderHandle {
    /// Order ID from broker
    pub id: String,
}

impl OrderHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// One execution reported against an order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Fill price
    pub price: f64,
    /// Fill quantity (always positive; the side lives on the order)
    pub quantity: f64,
    /// Execution timestamp
    pub timestamp: DateTime<Utc>,
}

/// Order status as returned by a status poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    /// Order status
    pub state: OrderStatus,
    /// Order side
    pub side: OrderSide,
    /// Order type
    pub order_type: OrderType,
    /// Requested quantity
    pub quantity: f64,
    /// Executions so far, oldest first
    pub executions: Vec<Execution>,
}

/// Account balances from broker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountBalances {
    /// Cash not committed to open orders
    pub available_cash: f64,
}

/// A security held by the account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedSecurity {
    /// Instrument reference
    pub instrument: InstrumentRef,
    /// Shares held
    pub quantity: f64,
    /// Average buy price
    pub avg_buy_price: f64,
}

/// Trading session for one venue and date
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketHours {
    /// Whether the venue trades on that date at all
    pub is_open: bool,
    /// Session open
    pub opens_at: Option<DateTime<Utc>>,
    /// Session close
    pub closes_at: Option<DateTime<Utc>>,
}

impl MarketHours {
    /// A date the venue does not trade.
    pub fn closed() -> Self {
        Self {
            is_open: false,
            opens_at: None,
            closes_at: None,
        }
    }

    /// Check whether `now` falls inside the session.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_open {
            return false;
        }
        match (self.opens_at, self.closes_at) {
            (Some(open), Some(close)) => now >= open && now < close,
            _ => false,
        }
    }
}

/// Brokerage capabilities the portfolio engine relies on
#[async_trait]
pub trait Broker: Send + Sync {
    /// Get broker name
    fn name(&self) -> &'static str;

    /// Identity of the account every portfolio draws from
    fn account_id(&self) -> &str;

    /// Last trade price for each symbol, in request order
    async fn last_trade_price(&self, symbols: &[String]) -> Result<Vec<f64>>;

    /// Resolve a ticker to the broker's instrument reference
    async fn instrument_lookup(&self, symbol: &str) -> Result<InstrumentRef>;

    /// Resolve an instrument reference back to its ticker
    async fn reverse_instrument_lookup(&self, instrument: &InstrumentRef) -> Result<String>;

    /// Submit an order; `None` means the broker refused to hand out a handle
    async fn place_order(
        &self,
        instrument: &InstrumentRef,
        request: &OrderRequest,
    ) -> Result<Option<OrderHandle>>;

    /// Get order status
    async fn order_status(&self, handle: &OrderHandle) -> Result<OrderSnapshot>;

    /// Cancel an order
    async fn cancel_order(&self, handle: &OrderHandle) -> Result<()>;

    /// Get account balances
    async fn account_balances(&self) -> Result<AccountBalances>;

    /// Get all securities held by the account
    async fn securities_owned(&self) -> Result<Vec<OwnedSecurity>>;

    /// Trading session for a venue on a date
    async fn market_hours(&self, venue: &str, date: NaiveDate) -> Result<MarketHours>;

    /// Current time on the broker's clock
    async fn server_time(&self) -> Result<DateTime<Utc>>;
}

// ============================================================================
// Tests
// ============================================================================
