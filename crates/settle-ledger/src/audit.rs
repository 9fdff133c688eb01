use crate::balance::AccountLedger;
use crate::escrow::EscrowManager;
use crate::state::CounterSnapshot;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Point-in-time check of the conservation law
/// `sum(balances) + sum(escrow custody) == deposits - withdrawals`.
///
/// Totals use 128-bit arithmetic so the check itself cannot overflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConservationReport {
    pub account_total: u128,
    pub escrow_held: u128,
    pub open_escrows: usize,
    pub accounts: usize,
    pub total_deposits: u128,
    pub total_withdrawals: u128,
    pub transaction_counter: u64,
}

impl ConservationReport {
    /// Must only be called while no mutation is in flight.
    pub(crate) async fn collect(
        ledger: &AccountLedger,
        escrows: &EscrowManager,
        counters: CounterSnapshot,
    ) -> Self {
        let accounts = ledger.accounts_snapshot().await;
        let account_total = accounts.iter().map(|a| a.balance.units() as u128).sum();
        let (escrow_held, open_escrows) = escrows.held_total().await;

        let report = Self {
            account_total,
            escrow_held,
            open_escrows,
            accounts: accounts.len(),
            total_deposits: counters.total_deposits,
            total_withdrawals: counters.total_withdrawals,
            transaction_counter: counters.transaction_counter,
        };

        if report.holds() {
            info!(
                account_total = %report.account_total,
                escrow_held = %report.escrow_held,
                net_inflow = ?report.net_inflow(),
                "📊 Conservation audit passed"
            );
        } else {
            error!(
                account_total = %report.account_total,
                escrow_held = %report.escrow_held,
                total_deposits = %report.total_deposits,
                total_withdrawals = %report.total_withdrawals,
                "❌ Conservation audit FAILED"
            );
        }
        report
    }

    pub fn ledger_value(&self) -> u128 {
        self.account_total.saturating_add(self.escrow_held)
    }

    /// Deposits minus withdrawals, or `None` if more left than came in.
    pub fn net_inflow(&self) -> Option<u128> {
        self.total_deposits.checked_sub(self.total_withdrawals)
    }

    pub fn holds(&self) -> bool {
        self.net_inflow() == Some(self.ledger_value())
    }
}
