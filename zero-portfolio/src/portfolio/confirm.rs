//! Confirmation loop: turns broker executions into ledger entries.

use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{DiagnosticEntry, Portfolio, TradeRecord};
use crate::error::PortfolioError;
use crate::execution::PendingOrder;

/// What one confirmation step did with the queue head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Queue was empty
    Idle,
    /// First execution booked; order left the queue
    Executed,
    /// Broker reports the order dead; order left the queue
    Dropped,
    /// No executions yet; requeued with one more retry
    Requeued,
    /// Retry budget spent; cancelled at the broker
    Cancelled,
    /// Broker call failed; requeued unchanged
    Deferred,
}

/// Continuation signal and task handle of the confirmation loop
pub(crate) struct ConfirmControl {
    running: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl ConfirmControl {
    pub(crate) fn new() -> Self {
        let (running, _) = watch::channel(false);
        Self {
            running,
            task: StdMutex::new(None),
        }
    }
}

impl Portfolio {
    /// Process the queue head once.
    pub async fn confirm_once(&self) -> ConfirmOutcome {
        let Some(order) = self.inner.orders.lock().await.pop_front() else {
            return ConfirmOutcome::Idle;
        };

        let snapshot = match self.inner.broker.order_status(&order.handle).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    portfolio = %self.name(),
                    order_id = %order.handle.id,
                    error = %e,
                    "Order status poll failed, requeueing"
                );
                self.requeue(order).await;
                return ConfirmOutcome::Deferred;
            }
        };

        if snapshot.state.is_dead() {
            self.record_failure(&PortfolioError::OrderRejectedOrCancelled {
                symbol: order.symbol.clone(),
                order_id: order.handle.id.clone(),
                status: snapshot.state,
            })
            .await;
            return ConfirmOutcome::Dropped;
        }

        let Some(execution) = snapshot.executions.first().copied() else {
            return self.handle_unfilled(order).await;
        };

        let within_holdings = {
            let mut holdings = self.inner.holdings.lock().await;
            let within = holdings.apply_fill(
                snapshot.side,
                &order.symbol,
                execution.price,
                execution.quantity,
            );
            self.append_trade(TradeRecord::fill(
                snapshot.side,
                &order.symbol,
                execution.price,
                execution.quantity,
                snapshot.order_type,
            ))
            .await;
            within
        };

        info!(
            portfolio = %self.name(),
            order_id = %order.handle.id,
            symbol = %order.symbol,
            side = snapshot.side.as_str(),
            price = execution.price,
            quantity = execution.quantity,
            "Order executed"
        );

        if !within_holdings {
            let message = format!(
                "sell fill of {} {} exceeded shares held; position closed",
                execution.quantity, order.symbol
            );
            warn!(portfolio = %self.name(), order_id = %order.handle.id, "{}", message);
            self.inner
                .diagnostics
                .lock()
                .await
                .push(DiagnosticEntry::new("oversold_fill", message));
        }

        ConfirmOutcome::Executed
    }

    async fn handle_unfilled(&self, mut order: PendingOrder) -> ConfirmOutcome {
        let budget_spent = self
            .inner
            .settings
            .cancel_budget
            .is_some_and(|budget| order.retry_count >= budget);

        if !budget_spent {
            order.retry_count += 1;
            debug!(
                portfolio = %self.name(),
                order_id = %order.handle.id,
                retries = order.retry_count,
                "Order not filled yet"
            );
            self.requeue(order).await;
            return ConfirmOutcome::Requeued;
        }

        match self.inner.broker.cancel_order(&order.handle).await {
            Ok(()) => {
                info!(
                    portfolio = %self.name(),
                    order_id = %order.handle.id,
                    retries = order.retry_count,
                    "Cancelled unfilled order"
                );
                ConfirmOutcome::Cancelled
            }
            Err(e) => {
                warn!(
                    portfolio = %self.name(),
                    order_id = %order.handle.id,
                    error = %e,
                    "Cancel failed, requeueing"
                );
                self.requeue(order).await;
                ConfirmOutcome::Deferred
            }
        }
    }

    async fn requeue(&self, order: PendingOrder) {
        self.inner.orders.lock().await.push_back(order);
    }

    /// Start polling the queue every `poll`.
    ///
    /// Returns `false` if the loop is already running.
    pub fn start_confirmation(&self, poll: Duration) -> bool {
        let control = &self.inner.confirm;
        let mut task = control.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        control.running.send_replace(true);
        let mut signal = control.running.subscribe();
        let portfolio = self.clone();

        *task = Some(tokio::spawn(async move {
            info!(portfolio = %portfolio.name(), poll_ms = poll.as_millis() as u64, "Confirmation loop started");
            while *signal.borrow_and_update() {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    changed = signal.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
                if !*signal.borrow() {
                    break;
                }
                portfolio.confirm_once().await;
            }
            info!(portfolio = %portfolio.name(), "Confirmation loop stopped");
        }));
        true
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// A broker call in flight finishes first.
    pub async fn stop_confirmation(&self) {
        let control = &self.inner.confirm;
        control.running.send_replace(false);

        let handle = control
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(portfolio = %self.name(), error = %e, "Confirmation loop failed");
            }
        }
    }

    pub fn is_confirming(&self) -> bool {
        let control = &self.inner.confirm;
        *control.running.borrow()
            && control
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel every queued order at the broker.
    ///
    /// Orders whose cancel fails stay queued. Returns the number cancelled.
    pub async fn cancel_pending_orders(&self) -> usize {
        let queued: Vec<PendingOrder> = self.inner.orders.lock().await.drain(..).collect();
        let mut cancelled = 0;

        for order in queued {
            match self.inner.broker.cancel_order(&order.handle).await {
                Ok(()) => cancelled += 1,
                Err(e) => {
                    warn!(
                        portfolio = %self.name(),
                        order_id = %order.handle.id,
                        error = %e,
                        "Cancel failed, keeping order queued"
                    );
                    self.requeue(order).await;
                }
            }
        }

        if cancelled > 0 {
            info!(portfolio = %self.name(), cancelled, "Cancelled pending orders");
        }
        cancelled
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
    use crate::execution::{OrderRequest, OrderSide, OrderStatus, OrderType};
    use crate::instrument::SymbolInstrumentCache;
    use std::sync::Arc;

    async fn setup(cash: f64, budget: Option<u32>) -> (Arc<PaperBroker>, Portfolio) {
        let broker = Arc::new(PaperBroker::new("paper-1", 10_000.0));
        broker.set_price("AAPL", 50.0).await;
        broker.set_auto_fill(false).await;
        let instruments = Arc::new(SymbolInstrumentCache::new(broker.clone(), 16, "https:"));
        let settings = PortfolioSettings::default().with_cancel_budget(budget);
        let portfolio = Portfolio::new("A", broker.clone(), instruments, cash, settings);
        (broker, portfolio)
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let (_, portfolio) = setup(100.0, None).await;

        assert_eq!(portfolio.confirm_once().await, ConfirmOutcome::Idle);
        assert_eq!(portfolio.confirm_once().await, ConfirmOutcome::Idle);
        assert_eq!(portfolio.cash().await, 100.0);
        assert!(portfolio.trade_log().await.is_empty());
        assert!(portfolio.diagnostics().await.is_empty());
    }

    #[tokio::test]
    async fn test_fill_is_applied_once() {
        let (broker, portfolio) = setup(1_000.0, None).await;
        let pending = portfolio
            .place_now(&OrderRequest::limit("AAPL", OrderSide::Buy, 10.0, 55.0))
            .await
            .unwrap();
        broker.fill_order(&pending.handle.id, 50.0, 10.0).await.unwrap();

        assert_eq!(portfolio.confirm_once().await, ConfirmOutcome::Executed);
        assert_eq!(portfolio.confirm_once().await, ConfirmOutcome::Idle);

        assert!((portfolio.cash().await - 500.0).abs() < 1e-9);
        let trades = portfolio.trade_log().await;
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].kind, EntryKind::Order(OrderType::Limit));
        assert_eq!(trades[0].side, Some(OrderSide::Buy));
    }

    #[tokio::test]
    async fn test_cancel_budget_reached_on_third_poll() {
        let (broker, portfolio) = setup(1_000.0, Some(2)).await;
        let pending = portfolio
            .place_now(&OrderRequest::market("AAPL", OrderSide::Buy, 1.0))
            .await
            .unwrap();

        assert_eq!(portfolio.confirm_once().await, ConfirmOutcome::Requeued);
        assert_eq!(portfolio.confirm_once().await, ConfirmOutcome::Requeued);
        assert_eq!(portfolio.pending_orders().await[0].retry_count, 2);
        assert_eq!(portfolio.confirm_once().await, ConfirmOutcome::Cancelled);

        assert_eq!(portfolio.pending_count().await, 0);
        assert_eq!(broker.cancelled_orders().await, vec![pending.handle.id]);
    }

    #[tokio::test]
    async fn test_rejected_order_is_dropped_and_logged() {
        let (broker, portfolio) = setup(1_000.0, None).await;
        let pending = portfolio
            .place_now(&OrderRequest::market("AAPL", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        broker
            .set_order_state(&pending.handle.id, OrderStatus::Rejected)
            .await
            .unwrap();

        assert_eq!(portfolio.confirm_once().await, ConfirmOutcome::Dropped);
        assert_eq!(portfolio.pending_count().await, 0);
        assert_eq!(
            portfolio.diagnostics().await[0].code,
            "order_rejected_or_cancelled"
        );
    }

    #[tokio::test]
    async fn test_loop_confirms_and_stops() {
        let (broker, portfolio) = setup(1_000.0, None).await;
        broker.set_auto_fill(true).await;
        portfolio
            .place_now(&OrderRequest::market("AAPL", OrderSide::Buy, 2.0))
            .await
            .unwrap();

        assert!(portfolio.start_confirmation(Duration::from_millis(5)));
        assert!(!portfolio.start_confirmation(Duration::from_millis(5)));

        for _ in 0..200 {
            if portfolio.pending_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        portfolio.stop_confirmation().await;

        assert!(!portfolio.is_confirming());
        assert!((portfolio.shares_owned("AAPL").await - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cancel_pending_orders_empties_queue() {
        let (broker, portfolio) = setup(1_000.0, None).await;
        for _ in 0..3 {
            portfolio
                .place_now(&OrderRequest::market("AAPL", OrderSide::Buy, 1.0))
                .await
                .unwrap();
        }

        assert_eq!(portfolio.cancel_pending_orders().await, 3);
        assert_eq!(portfolio.pending_count().await, 0);
        assert_eq!(broker.cancelled_orders().await.len(), 3);
    }
}
