use settle_ledger::{
    AccountId, Amount, EscrowStatus, FeeConfig, FeeKind, LedgerError, LedgerEvent, LedgerState,
    MemoryPayoutChannel, SettlementEngine,
};
use std::sync::Arc;

const OWNER: AccountId = AccountId::from_bytes([0xAA; 32]);
const FEES: AccountId = AccountId::from_bytes([0xFE; 32]);
const ALICE: AccountId = AccountId::from_bytes([1; 32]);
const BOB: AccountId = AccountId::from_bytes([2; 32]);

fn engine_with_fees(transfer_bps: u16, withdrawal_bps: u16) -> SettlementEngine {
    let state = LedgerState::new(
        OWNER,
        FEES,
        FeeConfig::new(transfer_bps, withdrawal_bps).unwrap(),
    )
    .unwrap();
    SettlementEngine::new(state, Arc::new(MemoryPayoutChannel::new()))
}

fn units(n: u64) -> Amount {
    Amount::from_units(n)
}

/// Test that a transfer debits amount plus floored fee and credits the fee account
#[tokio::test]
async fn test_transfer_fee_correctness() {
    println!("\n=== Testing Transfer Fee Split ===");

    let engine = engine_with_fees(25, 0);
    engine.deposit(ALICE, units(5_000)).await.unwrap();

    let receipt = engine.transfer(ALICE, BOB, units(1_000)).await.unwrap();

    assert_eq!(receipt.fee, units(2));
    assert_eq!(engine.balance_of(ALICE).await, units(5_000 - 1_002));
    assert_eq!(engine.balance_of(BOB).await, units(1_000));
    assert_eq!(engine.balance_of(FEES).await, units(2));
    assert_eq!(engine.counters().await.transaction_counter, 1);
    assert!(engine.audit().await.holds());
}

/// Test that a completed escrow cannot release funds again
#[tokio::test]
async fn test_no_double_release() {
    println!("\n=== Testing Single Escrow Release ===");

    let engine = engine_with_fees(0, 0);
    engine.deposit(ALICE, units(800)).await.unwrap();

    let id = engine
        .create_escrow(Some(ALICE), BOB, units(500), "task")
        .await
        .unwrap();
    engine.complete_escrow(id).await.unwrap();

    let second = engine.complete_escrow(id).await;
    assert!(matches!(
        second,
        Err(LedgerError::InvalidEscrowState { .. })
    ));
    assert_eq!(engine.balance_of(BOB).await, units(500));
    assert_eq!(engine.balance_of(ALICE).await, units(300));

    let completions = engine
        .events
        .records_since(0)
        .await
        .into_iter()
        .filter(|r| matches!(r.event, LedgerEvent::EscrowCompleted { .. }))
        .count();
    assert_eq!(completions, 1);
}

/// Test that cancelling restores the payer balance exactly
#[tokio::test]
async fn test_cancel_refunds_exactly() {
    println!("\n=== Testing Escrow Cancellation Refund ===");

    let engine = engine_with_fees(25, 25);
    engine.deposit(ALICE, units(1_234)).await.unwrap();
    engine.deposit(BOB, units(7)).await.unwrap();

    let id = engine
        .create_escrow(Some(ALICE), BOB, units(500), "task")
        .await
        .unwrap();
    assert_eq!(engine.balance_of(ALICE).await, units(734));

    engine.cancel_escrow(id).await.unwrap();
    assert_eq!(engine.balance_of(ALICE).await, units(1_234));
    assert_eq!(engine.balance_of(BOB).await, units(7));
    assert_eq!(
        engine.get_escrow(id).await.unwrap().status,
        EscrowStatus::Cancelled
    );
    assert!(engine.cancel_escrow(id).await.is_err());
}

/// Test that pausing halts every mutation except deposits
#[tokio::test]
async fn test_pause_blocks_mutation_not_deposits() {
    println!("\n=== Testing Pause Coverage ===");

    let engine = engine_with_fees(0, 0);
    engine.deposit(ALICE, units(1_000)).await.unwrap();
    let id = engine
        .create_escrow(Some(ALICE), BOB, units(100), "task")
        .await
        .unwrap();
    let open = engine
        .create_escrow(None, BOB, units(100), "open task")
        .await
        .unwrap();

    engine.pause(OWNER).await.unwrap();

    assert!(matches!(
        engine.transfer(ALICE, BOB, units(1)).await,
        Err(LedgerError::Paused)
    ));
    assert!(matches!(
        engine.withdraw(ALICE, units(1)).await,
        Err(LedgerError::Paused)
    ));
    assert!(matches!(
        engine.complete_escrow(id).await,
        Err(LedgerError::Paused)
    ));
    assert!(matches!(
        engine.cancel_escrow(id).await,
        Err(LedgerError::Paused)
    ));
    assert!(matches!(
        engine.bind_payer(open, ALICE).await,
        Err(LedgerError::Paused)
    ));
    assert!(matches!(
        engine.create_escrow(Some(ALICE), BOB, units(1), "x").await,
        Err(LedgerError::Paused)
    ));

    let balance = engine.deposit(ALICE, units(50)).await.unwrap();
    assert_eq!(balance, units(950));

    engine.unpause(OWNER).await.unwrap();
    engine.complete_escrow(id).await.unwrap();
    assert_eq!(engine.balance_of(BOB).await, units(100));
}

/// Test spending a balance down to zero and one unit past it
#[tokio::test]
async fn test_insufficient_balance_boundary() {
    println!("\n=== Testing Balance Boundary ===");

    let engine = engine_with_fees(0, 0);
    engine.deposit(ALICE, units(100)).await.unwrap();

    engine.transfer(ALICE, BOB, units(100)).await.unwrap();
    assert_eq!(engine.balance_of(ALICE).await, Amount::ZERO);

    let err = engine.transfer(ALICE, BOB, units(1)).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InsufficientBalance { available, required, .. }
            if available == Amount::ZERO && required == units(1)
    ));
    assert_eq!(engine.balance_of(BOB).await, units(100));
}

/// Test that transfers to the sending account are refused
#[tokio::test]
async fn test_self_transfer_rejected() {
    println!("\n=== Testing Self Transfer ===");

    let engine = engine_with_fees(0, 0);

    assert!(matches!(
        engine.transfer(ALICE, ALICE, units(10)).await,
        Err(LedgerError::SelfTransferNotAllowed(_))
    ));
    engine.deposit(ALICE, units(1_000)).await.unwrap();
    assert!(matches!(
        engine.transfer(ALICE, ALICE, units(10)).await,
        Err(LedgerError::SelfTransferNotAllowed(_))
    ));
    assert_eq!(engine.balance_of(ALICE).await, units(1_000));
}

/// Test balance reads for accounts the ledger has never seen
#[tokio::test]
async fn test_balance_of_unknown_is_zero() {
    println!("\n=== Testing Unknown Accounts ===");

    let engine = engine_with_fees(0, 0);
    assert_eq!(
        engine.balance_of(AccountId::from_bytes([0x42; 32])).await,
        Amount::ZERO
    );
    assert!(engine
        .account(AccountId::from_bytes([0x42; 32]))
        .await
        .is_none());
}

/// Test that fee updates only apply to later operations
#[tokio::test]
async fn test_fee_change_not_retroactive() {
    println!("\n=== Testing Fee Updates ===");

    let engine = engine_with_fees(0, 0);
    engine.deposit(ALICE, units(10_000)).await.unwrap();

    let before = engine.transfer(ALICE, BOB, units(1_000)).await.unwrap();
    assert_eq!(before.fee, Amount::ZERO);

    engine
        .update_fee(OWNER, FeeKind::Transfer, 100)
        .await
        .unwrap();
    let after = engine.transfer(ALICE, BOB, units(1_000)).await.unwrap();
    assert_eq!(after.fee, units(10));

    assert!(matches!(
        engine.update_fee(OWNER, FeeKind::Transfer, 5_000).await,
        Err(LedgerError::FeeRateExceedsMaximum { .. })
    ));
    assert_eq!(engine.fee_config().await.rate(FeeKind::Transfer), 100);

    // earlier events keep the fee charged at the time
    let fees: Vec<_> = engine
        .events
        .records_since(0)
        .await
        .into_iter()
        .filter_map(|r| match r.event {
            LedgerEvent::Transferred { fee, .. } => Some(fee),
            _ => None,
        })
        .collect();
    assert_eq!(fees, vec![Amount::ZERO, units(10)]);
}

/// Test an open task escrow from creation through payer binding to payout
#[tokio::test]
async fn test_marketplace_escrow_flow() {
    println!("\n=== Testing Marketplace Escrow Flow ===");

    let engine = engine_with_fees(0, 0);
    let worker = BOB;
    let client = ALICE;
    engine.deposit(client, units(2_000)).await.unwrap();

    let id = engine
        .create_escrow(None, worker, units(1_500), "translate docs")
        .await
        .unwrap();
    let escrow = engine.get_escrow(id).await.unwrap();
    assert_eq!(escrow.payer(), None);
    assert_eq!(escrow.description, "translate docs");
    assert!(engine.audit().await.holds());

    engine.bind_payer(id, client).await.unwrap();
    assert_eq!(engine.balance_of(client).await, units(500));
    let report = engine.audit().await;
    assert_eq!(report.escrow_held, 1_500);
    assert!(report.holds());

    engine.complete_escrow(id).await.unwrap();
    assert_eq!(engine.balance_of(worker).await, units(1_500));
    assert_eq!(engine.escrows_for(client).await.len(), 1);
    assert_eq!(engine.escrows_for(worker).await.len(), 1);
}

/// Test that the event log replays operations in order
#[tokio::test]
async fn test_event_sequence_describes_history() {
    println!("\n=== Testing Event History ===");

    let engine = engine_with_fees(25, 0);
    let mut rx = engine.subscribe();

    engine.deposit(ALICE, units(2_000)).await.unwrap();
    engine.transfer(ALICE, BOB, units(1_000)).await.unwrap();
    engine.withdraw(BOB, units(400)).await.unwrap();

    let records = engine.events.records_since(0).await;
    let seqs: Vec<_> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    match &records[1].event {
        LedgerEvent::Transferred {
            from_balance,
            to_balance,
            fee,
            ..
        } => {
            assert_eq!(*from_balance, units(998));
            assert_eq!(*to_balance, units(1_000));
            assert_eq!(*fee, units(2));
        }
        other => panic!("unexpected event {:?}", other),
    }

    for expected in 1..=3 {
        assert_eq!(rx.recv().await.unwrap().seq, expected);
    }
    assert_eq!(engine.events.records_for(FEES).await.len(), 1);
}

/// Test that ledger-wide totals past u64 still satisfy conservation
#[tokio::test]
async fn test_totals_beyond_u64_conserve() {
    let engine = engine_with_fees(25, 10);
    let carol = AccountId::from_bytes([3; 32]);

    println!("\n=== Testing Totals Beyond u64 ===");

    engine.deposit(ALICE, units(u64::MAX)).await.unwrap();
    engine.deposit(BOB, units(1)).await.unwrap();
    engine.deposit(carol, units(u64::MAX - 5)).await.unwrap();

    let counters = engine.counters().await;
    println!("Total deposits: {}", counters.total_deposits);
    assert_eq!(counters.total_deposits, 2 * u64::MAX as u128 - 4);

    let report = engine.audit().await;
    assert_eq!(report.account_total, counters.total_deposits);
    assert!(report.holds());

    // a single account still cannot pass u64::MAX
    let err = engine.deposit(ALICE, units(1)).await.unwrap_err();
    assert!(matches!(err, LedgerError::BalanceOverflow(_)));
    assert_eq!(engine.counters().await, counters);

    assert!(matches!(
        engine.transfer(carol, ALICE, units(1_000)).await,
        Err(LedgerError::BalanceOverflow(_))
    ));
    assert_eq!(engine.balance_of(carol).await, units(u64::MAX - 5));

    // large custody and withdrawals keep the books exact
    let id = engine
        .create_escrow(Some(ALICE), BOB, units(u64::MAX / 2), "large")
        .await
        .unwrap();
    engine
        .withdraw(carol, units(u64::MAX / 4))
        .await
        .unwrap();
    let report = engine.audit().await;
    assert_eq!(report.escrow_held, (u64::MAX / 2) as u128);
    assert!(report.holds());

    engine.complete_escrow(id).await.unwrap();
    assert!(engine.audit().await.holds());
}
