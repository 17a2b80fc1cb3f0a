//! Order types and management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::broker::OrderHandle;

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    /// Market order
    Market,
    /// Limit order
    Limit,
    /// Stop order that becomes a market order once triggered
    StopLoss,
    /// Stop order that becomes a limit order once triggered
    StopLimit,
}

impl OrderType {
    /// Label used in the trade log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
            Self::StopLoss => "stop loss",
            Self::StopLimit => "stop limit",
        }
    }

    /// Whether the order carries a limit price.
    pub fn needs_price(&self) -> bool {
        matches!(self, Self::Limit | Self::StopLimit)
    }

    /// Whether the order carries a stop price.
    pub fn needs_stop_price(&self) -> bool {
        matches!(self, Self::StopLoss | Self::StopLimit)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Quantity sign applied to fills (+1 for buys, -1 for sells).
    pub fn sign(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// Order status as reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Order is pending submission
    Pending,
    /// Order has been submitted
    Submitted,
    /// Order is partially filled
    PartiallyFilled,
    /// Order is fully filled
    Filled,
    /// Order was cancelled
    Cancelled,
    /// Order was rejected
    Rejected,
    /// Order has expired
    Expired,
}

impl OrderStatus {
    /// Terminal states in which the order will never fill.
    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Rejected | Self::Expired)
    }

    /// Check if order is working (not complete)
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Submitted | Self::PartiallyFilled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Time in force accepted by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    #[default]
    GoodForDay,
    GoodTillCancelled,
    ImmediateOrCancel,
    FillOrKill,
    AtOpen,
}

impl TimeInForce {
    /// Short broker code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::GoodForDay => "gfd",
            Self::GoodTillCancelled => "gtc",
            Self::ImmediateOrCancel => "ioc",
            Self::FillOrKill => "fok",
            Self::AtOpen => "opg",
        }
    }

    /// Orders that must fill on first contact or die.
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::ImmediateOrCancel | Self::FillOrKill)
    }
}

/// An order a portfolio wants to send to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Symbol
    pub symbol: String,
    /// Order side
    pub side: OrderSide,
    /// Order type
    pub order_type: OrderType,
    /// Quantity
    pub quantity: f64,
    /// Limit price (for limit orders)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Stop price (for stop orders)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    /// Time in force
    #[serde(default)]
    pub time_in_force: TimeInForce,
    /// Skip the buying-power check
    #[serde(default)]
    pub force_buy: bool,
}

impl OrderRequest {
    /// Create a market order
    pub fn market(symbol: &str, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::GoodForDay,
            force_buy: false,
        }
    }

    /// Create a limit order
    pub fn limit(symbol: &str, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(symbol, side, quantity)
        }
    }

    /// Create a stop-loss order
    pub fn stop_loss(symbol: &str, side: OrderSide, quantity: f64, stop_price: f64) -> Self {
        Self {
            order_type: OrderType::StopLoss,
            stop_price: Some(stop_price),
            ..Self::market(symbol, side, quantity)
        }
    }

    /// Create a stop-limit order
    pub fn stop_limit(
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        stop_price: f64,
    ) -> Self {
        Self {
            order_type: OrderType::StopLimit,
            price: Some(price),
            stop_price: Some(stop_price),
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn with_time_in_force(mut self, time_in_force: TimeInForce) -> Self {
        self.time_in_force = time_in_force;
        self
    }

    pub fn with_force_buy(mut self, force_buy: bool) -> Self {
        self.force_buy = force_buy;
        self
    }

    /// Check the request is well formed before it reaches the broker.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("symbol is empty".into());
        }
        if !(self.quantity.is_finite() && self.quantity > 0.0) {
            return Err(format!("quantity must be positive, got {}", self.quantity));
        }
        if self.order_type.needs_price() && !matches!(self.price, Some(p) if p > 0.0) {
            return Err(format!("{} order needs a positive price", self.order_type.as_str()));
        }
        if self.order_type.needs_stop_price()
            && !matches!(self.stop_price, Some(p) if p > 0.0)
        {
            return Err(format!(
                "{} order needs a positive stop price",
                self.order_type.as_str()
            ));
        }
        Ok(())
    }

    /// Get a summary string
    pub fn summary(&self) -> String {
        format!(
            "{} {} {} {} ({})",
            self.order_type.as_str(),
            self.side.as_str(),
            self.quantity,
            self.symbol,
            self.time_in_force.code()
        )
    }
}

/// An order accepted by the broker and awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    /// Symbol
    pub symbol: String,
    /// Broker handle used for status polls and cancellation
    pub handle: OrderHandle,
    /// Polls that came back without executions
    pub retry_count: u32,
    /// Order side
    pub side: OrderSide,
    /// Order type
    pub order_type: OrderType,
    /// Submission timestamp
    pub submitted_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn new(request: &OrderRequest, handle: OrderHandle) -> Self {
        Self {
            symbol: request.symbol.clone(),
            handle,
            retry_count: 0,
            side: request.side,
            order_type: request.order_type,
            submitted_at: Utc::now(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_order_creation() {
        let order = OrderRequest::limit("AAPL", OrderSide::Buy, 10.0, 150.0);

        assert_eq!(order.symbol, "AAPL");
        assert_eq!(order.order_type, OrderType::Limit);
        assert_eq!(order.price, Some(150.0));
        assert_eq!(order.time_in_force, TimeInForce::GoodForDay);
        assert!(order.validate().is_ok());
    }

    #[test]
    fn test_stop_limit_requires_both_prices() {
        let mut order = OrderRequest::stop_limit("AAPL", OrderSide::Sell, 5.0, 140.0, 142.0);
        assert!(order.validate().is_ok());

        order.stop_price = None;
        let err = order.validate().unwrap_err();
        assert!(err.contains("stop price"));
    }

    #[test]
    fn test_rejects_non_positive_quantity() {
        let order = OrderRequest::market("AAPL", OrderSide::Buy, 0.0);
        assert!(order.validate().is_err());
    }

    #[test]
    fn test_side_sign() {
        assert_eq!(OrderSide::Buy.sign(), 1.0);
        assert_eq!(OrderSide::Sell.sign(), -1.0);
        assert_eq!(OrderSide::parse("sell"), Some(OrderSide::Sell));
    }

    #[test]
    fn test_dead_states() {
        assert!(OrderStatus::Rejected.is_dead());
        assert!(OrderStatus::Expired.is_dead());
        assert!(!OrderStatus::Filled.is_dead());
        assert!(OrderStatus::Submitted.is_working());
    }

    #[test]
    fn test_summary() {
        let order = OrderRequest::market("MSFT", OrderSide::Sell, 3.0)
            .with_time_in_force(TimeInForce::ImmediateOrCancel);
        assert_eq!(order.summary(), "market sell 3 MSFT (ioc)");
    }
}
