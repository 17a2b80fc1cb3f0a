//! Cash and share transfers between portfolios on the same account.
//!
//! Both ledgers are locked for the whole move, in portfolio-name order, so
//! concurrent transfers in opposite directions cannot deadlock.

use std::sync::Arc;
use tokio::sync::MutexGuard;
use tracing::info;

use super::{EntryKind, Holdings, Portfolio, TradeRecord};
use crate::error::{PortfolioError, PortfolioResult};
use crate::execution::reduce;

/// Which way value flows relative to the portfolio the method is called on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// From `self` to the other portfolio
    To,
    /// From the other portfolio to `self`
    From,
}

impl Portfolio {
    /// Move cash between this portfolio and `other`.
    ///
    /// Returns `Ok(false)` when the source lacks the funds; the shortfall is
    /// logged on this portfolio and nothing moves.
    pub async fn transfer_cash(
        &self,
        other: &Portfolio,
        amount: f64,
        direction: TransferDirection,
    ) -> PortfolioResult<bool> {
        self.check_transfer(other, amount)?;
        let (source, dest) = self.endpoints(other, direction);

        {
            let (mut from, mut to) = lock_pair(source, dest).await;
            if from.cash < amount {
                let err = PortfolioError::InsufficientFunds {
                    portfolio: source.name().to_string(),
                    required: amount,
                    available: from.cash,
                };
                drop((from, to));
                self.record_failure(&err).await;
                return Ok(false);
            }
            from.cash -= amount;
            to.cash += amount;

            source
                .append_trade(TradeRecord::cash(amount, EntryKind::TransferOut))
                .await;
            dest.append_trade(TradeRecord::cash(amount, EntryKind::TransferIn))
                .await;
        }

        info!(from = %source.name(), to = %dest.name(), amount, "Transferred cash");
        Ok(true)
    }

    /// Move shares between this portfolio and `other` at the source's average cost.
    ///
    /// Returns `Ok(false)` when the source holds too few shares; the shortfall
    /// is logged on this portfolio and nothing moves.
    pub async fn transfer_shares(
        &self,
        other: &Portfolio,
        symbol: &str,
        amount: f64,
        direction: TransferDirection,
    ) -> PortfolioResult<bool> {
        self.check_transfer(other, amount)?;
        let (source, dest) = self.endpoints(other, direction);

        let transfer_price = {
            let (mut from, mut to) = lock_pair(source, dest).await;
            let position = match from.positions.get(symbol) {
                Some(position) if position.shares >= amount => *position,
                held => {
                    let err = PortfolioError::InsufficientShares {
                        portfolio: source.name().to_string(),
                        symbol: symbol.to_string(),
                        required: amount,
                        available: held.map_or(0.0, |p| p.shares),
                    };
                    drop((from, to));
                    self.record_failure(&err).await;
                    return Ok(false);
                }
            };

            from.set_position(symbol, reduce(&position, amount));
            to.add_shares(symbol, position.avg_cost, amount);

            source
                .append_trade(TradeRecord::shares(
                    symbol,
                    position.avg_cost,
                    amount,
                    EntryKind::TransferOut,
                ))
                .await;
            dest.append_trade(TradeRecord::shares(
                symbol,
                position.avg_cost,
                amount,
                EntryKind::TransferIn,
            ))
            .await;
            position.avg_cost
        };

        info!(
            from = %source.name(),
            to = %dest.name(),
            symbol,
            amount,
            price = transfer_price,
            "Transferred shares"
        );
        Ok(true)
    }

    fn check_transfer(&self, other: &Portfolio, amount: f64) -> PortfolioResult<()> {
        if self.same_as(other) {
            return Err(PortfolioError::TransferPrecondition(format!(
                "{} cannot transfer to itself",
                self.name()
            )));
        }
        if self.account_id() != other.account_id() {
            return Err(PortfolioError::TransferPrecondition(format!(
                "{} and {} use different broker accounts",
                self.name(),
                other.name()
            )));
        }
        if !(amount.is_finite() && amount > 0.0) {
            return Err(PortfolioError::TransferPrecondition(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        Ok(())
    }

    fn endpoints<'a>(
        &'a self,
        other: &'a Portfolio,
        direction: TransferDirection,
    ) -> (&'a Portfolio, &'a Portfolio) {
        match direction {
            TransferDirection::To => (self, other),
            TransferDirection::From => (other, self),
        }
    }
}

/// Lock the holdings of two distinct portfolios, lowest name first.
async fn lock_pair<'a>(
    source: &'a Portfolio,
    dest: &'a Portfolio,
) -> (MutexGuard<'a, Holdings>, MutexGuard<'a, Holdings>) {
    let source_first = (source.name(), Arc::as_ptr(&source.inner) as usize)
        < (dest.name(), Arc::as_ptr(&dest.inner) as usize);

    if source_first {
        let from = source.lock_holdings().await;
        let to = dest.lock_holdings().await;
        (from, to)
    } else {
        let to = dest.lock_holdings().await;
        let from = source.lock_holdings().await;
        (from, to)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::PortfolioSettings;
    use super::*;
    use crate::broker::PaperBroker;
    use crate::instrument::SymbolInstrumentCache;

    fn pair(first_cash: f64, second_cash: f64) -> (Portfolio, Portfolio) {
        let broker = Arc::new(PaperBroker::new("paper-1", 0.0));
        let instruments = Arc::new(SymbolInstrumentCache::new(broker.clone(), 16, "https:"));
        let first = Portfolio::new("First", broker.clone(), instruments.clone(), first_cash, PortfolioSettings::default());
        let second = Portfolio::new("Second", broker, instruments, second_cash, PortfolioSettings::default());
        (first, second)
    }

    #[tokio::test]
    async fn test_cash_transfer_both_directions() {
        let (first, second) = pair(30.0, 30.0);

        assert!(first.transfer_cash(&second, 5.0, TransferDirection::To).await.unwrap());
        assert_eq!(first.cash().await, 25.0);
        assert_eq!(second.cash().await, 35.0);

        assert!(first.transfer_cash(&second, 10.0, TransferDirection::From).await.unwrap());
        assert_eq!(first.cash().await, 35.0);
        assert_eq!(second.cash().await, 25.0);

        let kinds: Vec<_> = second.trade_log().await.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![EntryKind::TransferIn, EntryKind::TransferOut]);
    }

    #[tokio::test]
    async fn test_share_transfer_recombines_cost() {
        let (first, second) = pair(0.0, 0.0);
        first.add_pool_shares("AAPL", 20.0, 3.0).await;
        second.add_pool_shares("AAPL", 30.0, 1.0).await;

        assert!(first
            .transfer_shares(&second, "AAPL", 1.0, TransferDirection::To)
            .await
            .unwrap());

        let source = first.position("AAPL").await.unwrap();
        assert!((source.shares - 2.0).abs() < 1e-9);
        assert!((source.avg_cost - 20.0).abs() < 1e-9);

        // (30 × 1 + 20 × 1) / 2
        let dest = second.position("AAPL").await.unwrap();
        assert!((dest.shares - 2.0).abs() < 1e-9);
        assert!((dest.avg_cost - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_transferring_last_share_removes_position() {
        let (first, second) = pair(0.0, 0.0);
        first.add_pool_shares("AAPL", 20.0, 1.0).await;

        assert!(second
            .transfer_shares(&first, "AAPL", 1.0, TransferDirection::From)
            .await
            .unwrap());
        assert!(first.position("AAPL").await.is_none());
        assert!((second.shares_owned("AAPL").await - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shortfall_is_logged_on_caller() {
        let (first, second) = pair(1.0, 0.0);

        assert!(!second
            .transfer_cash(&first, 5.0, TransferDirection::From)
            .await
            .unwrap());
        assert_eq!(first.cash().await, 1.0);
        assert!(first.diagnostics().await.is_empty());
        assert_eq!(second.diagnostics().await[0].code, "insufficient_funds");
    }

    #[tokio::test]
    async fn test_preconditions() {
        let (first, second) = pair(10.0, 10.0);
        let other_account = {
            let broker = Arc::new(PaperBroker::new("paper-2", 0.0));
            let instruments = Arc::new(SymbolInstrumentCache::new(broker.clone(), 16, "https:"));
            Portfolio::new("Third", broker, instruments, 10.0, PortfolioSettings::default())
        };

        assert!(first.transfer_cash(&first, 1.0, TransferDirection::To).await.is_err());
        assert!(first.transfer_cash(&second, 0.0, TransferDirection::To).await.is_err());
        assert!(matches!(
            first.transfer_cash(&other_account, 1.0, TransferDirection::To).await,
            Err(PortfolioError::TransferPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn test_opposite_transfers_do_not_deadlock() {
        let (first, second) = pair(1_000.0, 1_000.0);
        let mut tasks = Vec::new();
        for i in 0..50 {
            let (a, b) = if i % 2 == 0 {
                (first.clone(), second.clone())
            } else {
                (second.clone(), first.clone())
            };
            tasks.push(tokio::spawn(async move {
                a.transfer_cash(&b, 1.0, TransferDirection::To).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }
        assert!((first.cash().await + second.cash().await - 2_000.0).abs() < 1e-9);
    }
}
