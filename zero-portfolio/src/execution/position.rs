//! Position tracking with weighted-average cost.

use serde::{Deserialize, Serialize};

/// Share balances closer to zero than this are treated as flat.
pub const FLAT_EPSILON: f64 = 1e-9;

/// A holding inside one portfolio
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Quantity-weighted average price paid for the current shares
    pub avg_cost: f64,
    /// Shares held, always positive
    pub shares: f64,
}

impl Position {
    /// Create a new position
    pub fn new(avg_cost: f64, shares: f64) -> Self {
        Self { avg_cost, shares }
    }

    /// Value at the given price
    pub fn market_value(&self, price: f64) -> f64 {
        price * self.shares
    }
}

/// Fold a signed quantity at `price` into an optional holding.
///
/// `total = held × avg + price × signed_qty`, `shares = held + signed_qty`,
/// `avg = total / shares`. Returns `None` once the holding is flat.
pub fn combine(held: Option<&Position>, price: f64, signed_qty: f64) -> Option<Position> {
    let (shares, avg_cost) = held.map_or((0.0, 0.0), |p| (p.shares, p.avg_cost));
    let total_cost = shares * avg_cost + price * signed_qty;
    let new_shares = shares + signed_qty;

    if new_shares.abs() < FLAT_EPSILON {
        return None;
    }

    Some(Position {
        avg_cost: total_cost / new_shares,
        shares: new_shares,
    })
}

/// Remove `amount` shares without touching the average cost.
///
/// Returns `None` once the holding is flat.
pub fn reduce(held: &Position, amount: f64) -> Option<Position> {
    let remaining = held.shares - amount;
    if remaining.abs() < FLAT_EPSILON {
        None
    } else {
        Some(Position {
            avg_cost: held.avg_cost,
            shares: remaining,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
