//! Error taxonomy for portfolio bookkeeping.
//!
//! Manager-level precondition failures are returned to the caller. Trading
//! failures met inside background workers are written to the owning
//! portfolio's diagnostic log instead, keyed by [`PortfolioError::code`].

use thiserror::Error;

use crate::execution::OrderStatus;

/// Result alias for portfolio operations.
pub type PortfolioResult<T> = Result<T, PortfolioError>;

/// Portfolio-specific error type.
#[derive(Debug, Error)]
pub enum PortfolioError {
    /// A buy would spend more than the portfolio's cash.
    #[error("insufficient funds in {portfolio}: need {required:.2}, have {available:.2}")]
    InsufficientFunds {
        portfolio: String,
        required: f64,
        available: f64,
    },

    /// A sell or transfer would take more shares than the portfolio holds.
    #[error("insufficient shares of {symbol} in {portfolio}: need {required}, have {available}")]
    InsufficientShares {
        portfolio: String,
        symbol: String,
        required: f64,
        available: f64,
    },

    /// The broker returned no order handle, or the submission itself failed.
    #[error("failed to place {order} for {symbol}: {reason}")]
    OrderPlacementFailure {
        symbol: String,
        order: String,
        reason: String,
    },

    /// The broker reports the order as rejected, cancelled or expired.
    #[error("order {order_id} for {symbol} ended as {status}")]
    OrderRejectedOrCancelled {
        symbol: String,
        order_id: String,
        status: OrderStatus,
    },

    /// Pool/portfolio mismatch on a manager operation.
    #[error("allocation violation: {0}")]
    AllocationViolation(String),

    /// Mismatched broker account, non-positive amount or self-transfer.
    #[error("transfer precondition failed: {0}")]
    TransferPrecondition(String),

    /// No portfolio registered under the given name.
    #[error("unknown portfolio: {0}")]
    UnknownPortfolio(String),

    /// A strategy is already registered for the portfolio.
    #[error("a strategy is already scheduled for portfolio {0}")]
    AlreadyScheduled(String),

    /// A strategy invocation refused to act.
    #[error("strategy validation failed: {0}")]
    Strategy(String),

    /// Portfolio state cannot be replaced while orders are in flight.
    #[error("portfolio {0} is busy")]
    Busy(String),

    /// Broker call failed outright.
    #[error("broker call failed: {0:#}")]
    Broker(anyhow::Error),

    /// Reading or writing saved state failed.
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl PortfolioError {
    /// Stable code written to diagnostic entries and the store.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::InsufficientShares { .. } => "insufficient_shares",
            Self::OrderPlacementFailure { .. } => "order_placement_failure",
            Self::OrderRejectedOrCancelled { .. } => "order_rejected_or_cancelled",
            Self::AllocationViolation(_) => "allocation_violation",
            Self::TransferPrecondition(_) => "transfer_precondition",
            Self::UnknownPortfolio(_) => "unknown_portfolio",
            Self::AlreadyScheduled(_) => "already_scheduled",
            Self::Strategy(_) => "strategy",
            Self::Busy(_) => "busy",
            Self::Broker(_) => "broker",
            Self::Storage(_) => "storage",
        }
    }

    /// Whether the failure reflects market conditions rather than a caller defect.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. }
                | Self::InsufficientShares { .. }
                | Self::OrderPlacementFailure { .. }
                | Self::OrderRejectedOrCancelled { .. }
                | Self::Strategy(_)
                | Self::Broker(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            PortfolioError::AllocationViolation("x".into()),
            PortfolioError::TransferPrecondition("x".into()),
            PortfolioError::UnknownPortfolio("x".into()),
            PortfolioError::Broker(anyhow::anyhow!("down")),
        ];
        let codes: std::collections::HashSet<_> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_recoverable_split() {
        let funds = PortfolioError::InsufficientFunds {
            portfolio: "First".into(),
            required: 10.0,
            available: 5.0,
        };
        assert!(funds.is_recoverable());
        assert!(!PortfolioError::AllocationViolation("pool".into()).is_recoverable());
    }

    #[test]
    fn test_rejection_message() {
        let err = PortfolioError::OrderRejectedOrCancelled {
            symbol: "AAPL".into(),
            order_id: "PAPER-00000001".into(),
            status: OrderStatus::Rejected,
        };
        assert_eq!(
            err.to_string(),
            "order PAPER-00000001 for AAPL ended as rejected"
        );
    }
}
