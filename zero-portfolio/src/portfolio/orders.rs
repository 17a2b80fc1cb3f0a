//! Order placement intents.
//!
//! Every intent returns immediately; the funds/shares check and the broker
//! submission run on the portfolio's worker pool. Failures never reach the
//! caller, they land in the diagnostic log.

use tracing::{debug, info};

use super::Portfolio;
use crate::error::{PortfolioError, PortfolioResult};
use crate::execution::{OrderRequest, OrderSide, PendingOrder};

impl Portfolio {
    pub fn market_buy(&self, symbol: &str, quantity: f64) {
        self.submit(OrderRequest::market(symbol, OrderSide::Buy, quantity));
    }

    pub fn market_sell(&self, symbol: &str, quantity: f64) {
        self.submit(OrderRequest::market(symbol, OrderSide::Sell, quantity));
    }

    pub fn limit_buy(&self, symbol: &str, quantity: f64, price: f64) {
        self.submit(OrderRequest::limit(symbol, OrderSide::Buy, quantity, price));
    }

    pub fn limit_sell(&self, symbol: &str, quantity: f64, price: f64) {
        self.submit(OrderRequest::limit(symbol, OrderSide::Sell, quantity, price));
    }

    pub fn stop_loss_buy(&self, symbol: &str, quantity: f64, stop_price: f64) {
        self.submit(OrderRequest::stop_loss(symbol, OrderSide::Buy, quantity, stop_price));
    }

    pub fn stop_loss_sell(&self, symbol: &str, quantity: f64, stop_price: f64) {
        self.submit(OrderRequest::stop_loss(symbol, OrderSide::Sell, quantity, stop_price));
    }

    pub fn stop_limit_buy(&self, symbol: &str, quantity: f64, price: f64, stop_price: f64) {
        self.submit(OrderRequest::stop_limit(
            symbol,
            OrderSide::Buy,
            quantity,
            price,
            stop_price,
        ));
    }

    pub fn stop_limit_sell(&self, symbol: &str, quantity: f64, price: f64, stop_price: f64) {
        self.submit(OrderRequest::stop_limit(
            symbol,
            OrderSide::Sell,
            quantity,
            price,
            stop_price,
        ));
    }

    /// Hand an arbitrary request (time in force, forced buy) to a worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, request: OrderRequest) {
        debug!(portfolio = %self.name(), order = %request.summary(), "Queued order placement");
        let portfolio = self.clone();
        self.inner.workers.spawn(async move {
            if let Err(e) = portfolio.place_now(&request).await {
                portfolio.record_failure(&e).await;
            }
        });
    }

    /// Wait until every queued placement has finished
    pub async fn wait_for_placements(&self) {
        self.inner.workers.drain().await;
    }

    /// Check, resolve and submit one order, queueing it for confirmation.
    pub async fn place_now(&self, request: &OrderRequest) -> PortfolioResult<PendingOrder> {
        let placement_failure = |reason: String| PortfolioError::OrderPlacementFailure {
            symbol: request.symbol.clone(),
            order: request.summary(),
            reason,
        };

        request.validate().map_err(placement_failure)?;

        match request.side {
            OrderSide::Buy if !request.force_buy => self.check_buying_power(request).await?,
            OrderSide::Sell => self.check_shares(request).await?,
            OrderSide::Buy => {}
        }

        let instrument = self
            .inner
            .instruments
            .instrument_for(&request.symbol)
            .await
            .ok_or_else(|| placement_failure("instrument lookup failed".into()))?;

        let handle = match self.inner.broker.place_order(&instrument, request).await {
            Ok(Some(handle)) => handle,
            Ok(None) => return Err(placement_failure("broker returned no order handle".into())),
            Err(e) => return Err(placement_failure(format!("{:#}", e))),
        };

        let pending = PendingOrder::new(request, handle);
        self.inner.orders.lock().await.push_back(pending.clone());

        info!(
            portfolio = %self.name(),
            order_id = %pending.handle.id,
            order = %request.summary(),
            "Order submitted"
        );
        Ok(pending)
    }

    async fn check_buying_power(&self, request: &OrderRequest) -> PortfolioResult<()> {
        let price = self
            .inner
            .broker
            .last_trade_price(std::slice::from_ref(&request.symbol))
            .await
            .ok()
            .and_then(|prices| prices.first().copied())
            .ok_or_else(|| PortfolioError::OrderPlacementFailure {
                symbol: request.symbol.clone(),
                order: request.summary(),
                reason: "no last trade price".into(),
            })?;

        let required = price * request.quantity * (1.0 + self.inner.settings.buy_margin);
        let available = self.cash().await;
        if available < required {
            return Err(PortfolioError::InsufficientFunds {
                portfolio: self.name().to_string(),
                required,
                available,
            });
        }
        Ok(())
    }

    async fn check_shares(&self, request: &OrderRequest) -> PortfolioResult<()> {
        let available = self.shares_owned(&request.symbol).await;
        if available < request.quantity {
            return Err(PortfolioError::InsufficientShares {
                portfolio: self.name().to_string(),
                symbol: request.symbol.clone(),
                required: request.quantity,
                available,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::{EntryKind, PortfolioSettings};
    use super::*;
    use crate::broker::PaperBroker;
    use crate::instrument::SymbolInstrumentCache;
    use std::sync::Arc;

    async fn portfolio(cash: f64) -> (Arc<PaperBroker>, Portfolio) {
        let broker = Arc::new(PaperBroker::new("paper-1", 10_000.0));
        broker.set_price("AAPL", 100.0).await;
        let instruments = Arc::new(SymbolInstrumentCache::new(broker.clone(), 16, "https:"));
        let portfolio = Portfolio::new("A", broker.clone(), instruments, cash, PortfolioSettings::default());
        (broker, portfolio)
    }

    #[tokio::test]
    async fn test_buy_requires_margin() {
        // 10 × 100 × 1.005 = 1005
        let (_, portfolio) = portfolio(1_004.0).await;
        portfolio.market_buy("AAPL", 10.0);
        portfolio.wait_for_placements().await;

        assert_eq!(portfolio.pending_count().await, 0);
        let diagnostics = portfolio.diagnostics().await;
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, "insufficient_funds");
    }

    #[tokio::test]
    async fn test_buy_with_enough_cash_is_queued() {
        let (_, portfolio) = portfolio(1_005.0).await;
        portfolio.market_buy("AAPL", 10.0);
        portfolio.wait_for_placements().await;

        let pending = portfolio.pending_orders().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 0);
        assert_eq!(pending[0].symbol, "AAPL");
        // cash moves only on confirmation
        assert_eq!(portfolio.cash().await, 1_005.0);
    }

    #[tokio::test]
    async fn test_force_buy_skips_funds_check() {
        let (_, portfolio) = portfolio(0.0).await;
        portfolio.submit(OrderRequest::market("AAPL", OrderSide::Buy, 1.0).with_force_buy(true));
        portfolio.wait_for_placements().await;

        assert_eq!(portfolio.pending_count().await, 1);
        assert!(portfolio.diagnostics().await.is_empty());
    }

    #[tokio::test]
    async fn test_sell_without_shares_is_rejected() {
        let (broker, portfolio) = portfolio(0.0).await;
        portfolio.market_sell("AAPL", 1.0);
        portfolio.wait_for_placements().await;

        assert_eq!(broker.order_count().await, 0);
        assert_eq!(portfolio.diagnostics().await[0].code, "insufficient_shares");
    }

    #[tokio::test]
    async fn test_refused_placement_is_logged() {
        let (broker, portfolio) = portfolio(0.0).await;
        portfolio.add_pool_shares("AAPL", 90.0, 5.0).await;
        broker.refuse_next_orders(1).await;

        let err = portfolio
            .place_now(&OrderRequest::limit("AAPL", OrderSide::Sell, 5.0, 120.0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "order_placement_failure");
        assert_eq!(portfolio.pending_count().await, 0);
        assert_eq!(portfolio.trade_log().await[0].kind, EntryKind::AddShares);
    }
}
