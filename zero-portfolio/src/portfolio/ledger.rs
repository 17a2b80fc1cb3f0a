//! Ledger records: holdings, trade log entries and diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::execution::{combine, OrderSide, OrderType, Position};

/// What produced a trade log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A broker fill of the given order type
    Order(OrderType),
    /// Cash allocated from the manager pool
    AddCash,
    /// Cash returned to the manager pool
    DrawCash,
    /// Shares allocated from the manager pool
    AddShares,
    /// Shares returned to the manager pool
    DrawShares,
    /// Value received from another portfolio
    TransferIn,
    /// Value sent to another portfolio
    TransferOut,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order(order_type) => order_type.as_str(),
            Self::AddCash => "add bp",
            Self::DrawCash => "draw bp",
            Self::AddShares => "add share",
            Self::DrawShares => "draw share",
            Self::TransferIn => "transfer in",
            Self::TransferOut => "transfer out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "market" => Self::Order(OrderType::Market),
            "limit" => Self::Order(OrderType::Limit),
            "stop loss" => Self::Order(OrderType::StopLoss),
            "stop limit" => Self::Order(OrderType::StopLimit),
            "add bp" => Self::AddCash,
            "draw bp" => Self::DrawCash,
            "add share" => Self::AddShares,
            "draw share" => Self::DrawShares,
            "transfer in" => Self::TransferIn,
            "transfer out" => Self::TransferOut,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the append-only trade log.
///
/// Cash movements carry no symbol and record the amount as `price` with a
/// quantity of 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    /// Present for broker fills only
    pub side: Option<OrderSide>,
    pub symbol: Option<String>,
    pub price: f64,
    pub quantity: f64,
    pub kind: EntryKind,
}

impl TradeRecord {
    /// Entry for a broker fill
    pub fn fill(side: OrderSide, symbol: &str, price: f64, quantity: f64, order_type: OrderType) -> Self {
        Self {
            timestamp: Utc::now(),
            side: Some(side),
            symbol: Some(symbol.to_string()),
            price,
            quantity,
            kind: EntryKind::Order(order_type),
        }
    }

    /// Entry for a cash movement
    pub fn cash(amount: f64, kind: EntryKind) -> Self {
        Self {
            timestamp: Utc::now(),
            side: None,
            symbol: None,
            price: amount,
            quantity: 1.0,
            kind,
        }
    }

    /// Entry for a share movement valued at `price`
    pub fn shares(symbol: &str, price: f64, quantity: f64, kind: EntryKind) -> Self {
        Self {
            timestamp: Utc::now(),
            side: None,
            symbol: Some(symbol.to_string()),
            price,
            quantity,
            kind,
        }
    }
}

/// A recovered failure kept for later inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub timestamp: DateTime<Utc>,
    /// Error code, see `PortfolioError::code`
    pub code: String,
    pub message: String,
}

impl DiagnosticEntry {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for DiagnosticEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: [{}] {}", self.timestamp.to_rfc3339(), self.code, self.message)
    }
}

/// Cash balance and position table of one portfolio
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Holdings {
    pub cash: f64,
    pub positions: BTreeMap<String, Position>,
}

impl Holdings {
    pub fn new(cash: f64) -> Self {
        Self {
            cash,
            positions: BTreeMap::new(),
        }
    }

    /// Shares held of a symbol, 0 when flat
    pub fn shares(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map_or(0.0, |p| p.shares)
    }

    /// Book one execution.
    ///
    /// Returns `false` when a sell exceeded the shares held; the position is
    /// dropped and the cash still booked.
    pub fn apply_fill(&mut self, side: OrderSide, symbol: &str, price: f64, quantity: f64) -> bool {
        let signed_qty = side.sign() * quantity;
        self.cash -= price * signed_qty;

        let held = self.shares(symbol);
        if side == OrderSide::Sell && quantity > held + crate::execution::FLAT_EPSILON {
            self.positions.remove(symbol);
            return false;
        }

        self.set_position(symbol, combine(self.positions.get(symbol), price, signed_qty));
        true
    }

    /// Fold `amount` shares at `price` into the position
    pub fn add_shares(&mut self, symbol: &str, price: f64, amount: f64) {
        self.set_position(symbol, combine(self.positions.get(symbol), price, amount));
    }

    pub(crate) fn set_position(&mut self, symbol: &str, position: Option<Position>) {
        match position {
            Some(position) => {
                self.positions.insert(symbol.to_string(), position);
            }
            None => {
                self.positions.remove(symbol);
            }
        }
    }
}

/// Everything persisted for one portfolio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub name: String,
    pub account_id: String,
    pub holdings: Holdings,
    pub trade_log: Vec<TradeRecord>,
    pub diagnostics: Vec<DiagnosticEntry>,
    pub saved_at: DateTime<Utc>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_fill_sequence_moves_cash_and_cost() {
        let mut holdings = Holdings::new(1000.0);

        assert!(holdings.apply_fill(OrderSide::Buy, "AAPL", 50.0, 10.0));
        assert!(close(holdings.cash, 500.0));

        assert!(holdings.apply_fill(OrderSide::Buy, "AAPL", 60.0, 5.0));
        assert!(close(holdings.cash, 200.0));
        assert!(close(holdings.positions["AAPL"].avg_cost, 800.0 / 15.0));

        assert!(holdings.apply_fill(OrderSide::Sell, "AAPL", 70.0, 5.0));
        assert!(close(holdings.cash, 550.0));
        assert!(close(holdings.shares("AAPL"), 10.0));
        assert!(close(holdings.positions["AAPL"].avg_cost, 45.0));
    }

    #[test]
    fn test_selling_everything_removes_position() {
        let mut holdings = Holdings::new(0.0);
        holdings.add_shares("MSFT", 20.0, 3.0);

        assert!(holdings.apply_fill(OrderSide::Sell, "MSFT", 25.0, 3.0));
        assert!(!holdings.positions.contains_key("MSFT"));
        assert!(close(holdings.cash, 75.0));
    }

    #[test]
    fn test_oversell_is_flagged() {
        let mut holdings = Holdings::new(0.0);
        holdings.add_shares("MSFT", 20.0, 1.0);

        assert!(!holdings.apply_fill(OrderSide::Sell, "MSFT", 25.0, 2.0));
        assert!(!holdings.positions.contains_key("MSFT"));
        assert!(close(holdings.cash, 50.0));
    }

    #[test]
    fn test_entry_kind_labels() {
        assert_eq!(EntryKind::AddCash.as_str(), "add bp");
        assert_eq!(EntryKind::Order(OrderType::StopLoss).to_string(), "stop loss");
        assert_eq!(EntryKind::parse("transfer out"), Some(EntryKind::TransferOut));
        assert_eq!(EntryKind::parse("bogus"), None);
    }

    #[test]
    fn test_cash_record_shape() {
        let record = TradeRecord::cash(5.0, EntryKind::TransferIn);
        assert!(record.symbol.is_none());
        assert!(close(record.price, 5.0));
        assert!(close(record.quantity, 1.0));
    }
}
