//! Manager allocation and transfer scenarios
//!
//! Two portfolios carved out of one paper account, moving cash and shares
//! between themselves and the unassigned pool.

use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use zero_common::PortfolioServiceConfig;
use zero_portfolio::portfolio::EntryKind;
use zero_portfolio::{PaperBroker, PortfolioError, PortfolioManager};

async fn first_and_second() -> (Arc<PaperBroker>, PortfolioManager) {
    let broker = Arc::new(PaperBroker::new("paper-scenario", 100.0));
    broker.set_holding("X", 1.0, 20.0).await;

    let manager = PortfolioManager::connect(&PortfolioServiceConfig::default(), broker.clone())
        .await
        .unwrap();
    assert_ok!(manager.add_portfolio("First", 30.0).await);
    assert_ok!(manager.add_portfolio("Second", 30.0).await);
    (broker, manager)
}

// ============================================================================
// Cash
// ============================================================================

#[tokio::test]
async fn test_cash_transfer_leaves_pool_alone() {
    let (_, manager) = first_and_second().await;
    assert_eq!(manager.unassigned_cash().await, 40.0);

    assert!(manager.transfer_cash("Second", "First", 5.0).await.unwrap());

    let first = manager.portfolio("First").await.unwrap();
    let second = manager.portfolio("Second").await.unwrap();
    assert_eq!(first.cash().await, 35.0);
    assert_eq!(second.cash().await, 25.0);
    assert_eq!(manager.unassigned_cash().await, 40.0);

    let incoming = first.trade_log().await;
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].kind, EntryKind::TransferIn);
    assert!(incoming[0].symbol.is_none());
}

#[tokio::test]
async fn test_third_portfolio_cannot_take_rest_of_pool() {
    let (_, manager) = first_and_second().await;

    assert!(matches!(
        manager.add_portfolio("Third", 40.0).await,
        Err(PortfolioError::AllocationViolation(_))
    ));
    assert_ok!(manager.add_portfolio("Third", 39.0).await);
    assert_eq!(manager.portfolio_names().await, vec!["First", "Second", "Third"]);
}

#[tokio::test]
async fn test_add_and_draw_cash() {
    let (broker, manager) = first_and_second().await;

    assert_ok!(manager.add_cash_to("First", 10.0).await);
    assert_eq!(manager.unassigned_cash().await, 30.0);
    assert_err!(manager.add_cash_to("First", 30.0).await);

    assert_ok!(manager.draw_cash_from("Second", 30.0).await);
    assert_err!(manager.draw_cash_from("Second", 0.01).await);
    assert_eq!(manager.unassigned_cash().await, 60.0);

    // new money arriving at the account shows up after reconciliation
    broker.set_cash(150.0).await;
    assert_eq!(manager.reconcile_cash().await.unwrap(), 110.0);

    let first = manager.portfolio("First").await.unwrap();
    let kinds: Vec<_> = first.trade_log().await.iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![EntryKind::AddCash]);
    assert_eq!(first.trade_log().await[0].kind.as_str(), "add bp");
}

#[tokio::test]
async fn test_draw_reconciles_pool_first() {
    let (broker, manager) = first_and_second().await;

    // deposit lands at the account without a reconcile in between
    broker.set_cash(150.0).await;
    assert_ok!(manager.draw_cash_from("First", 10.0).await);
    assert_eq!(manager.unassigned_cash().await, 100.0);

    broker.set_holding("X", 3.0, 20.0).await;
    assert_ok!(manager.add_shares_to("First", "X", 1.0).await);
    assert_ok!(manager.draw_shares_from("First", "X", 1.0).await);
    assert_eq!(manager.unassigned_shares("X").await, 3.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cash_adds_never_overallocate() {
    for round in 0..20 {
        let broker = Arc::new(PaperBroker::new("paper-race", 100.0));
        let manager = Arc::new(
            PortfolioManager::connect(&PortfolioServiceConfig::default(), broker)
                .await
                .unwrap(),
        );
        for i in 0..50 {
            manager.add_portfolio(&format!("P{:04}", i), 0.0).await.unwrap();
        }

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.add_cash_to("P0000", 60.0).await })
        };
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.add_cash_to("P0001", 60.0).await })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(
            results.iter().filter(|r| r.is_ok()).count(),
            1,
            "round {}",
            round
        );

        let mut allocated = 0.0;
        for portfolio in manager.portfolios().await {
            allocated += portfolio.cash().await;
        }
        assert_eq!(allocated, 60.0);
        assert_eq!(manager.unassigned_cash().await, 40.0);
    }
}

// ============================================================================
// Shares
// ============================================================================

#[tokio::test]
async fn test_share_transfer_moves_cost_basis() {
    let (_, manager) = first_and_second().await;
    assert_ok!(manager.add_shares_to("Second", "X", 1.0).await);
    assert_eq!(manager.unassigned_shares("X").await, 0.0);

    assert!(manager.transfer_shares("Second", "First", "X", 1.0).await.unwrap());

    let first = manager.portfolio("First").await.unwrap();
    let second = manager.portfolio("Second").await.unwrap();
    let position = first.position("X").await.unwrap();
    assert_eq!(position.avg_cost, 20.0);
    assert_eq!(position.shares, 1.0);
    assert!(second.position("X").await.is_none());

    // the pool does not see transfers between portfolios
    assert_ok!(manager.reconcile_shares().await);
    assert_eq!(manager.unassigned_shares("X").await, 0.0);
}

#[tokio::test]
async fn test_transfer_shortfall_is_a_logged_no_op() {
    let (_, manager) = first_and_second().await;

    assert!(!manager.transfer_shares("Second", "First", "X", 1.0).await.unwrap());

    let second = manager.portfolio("Second").await.unwrap();
    let diagnostics = second.diagnostics().await;
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].code, "insufficient_shares");
    assert!(manager.portfolio("First").await.unwrap().position("X").await.is_none());
}

#[tokio::test]
async fn test_account_queries() {
    let (_, manager) = first_and_second().await;

    assert_eq!(manager.cash_owned().await.unwrap(), 100.0);
    let owned = manager.securities_owned().await.unwrap();
    assert_eq!(owned.get("X"), Some(&1.0));
}
