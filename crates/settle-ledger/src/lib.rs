//! Balance ledger and escrow settlement engine.
//!
//! [`SettlementEngine`] custodies user funds, mediates fee-bearing transfers
//! and withdrawals, and drives task-payment escrows from creation to
//! completion or cancellation. Surrounding services (payment and task APIs,
//! reward crediting, notifications) call into the engine and observe it
//! through its [`EventLog`]; they never touch balances directly.

pub mod audit;
pub mod auth;
pub mod balance;
pub mod config;
pub mod error;
pub mod escrow;
pub mod events;
pub mod fee;
pub mod logging;
pub mod payout;
pub mod state;
pub mod types;

pub use audit::ConservationReport;
pub use auth::AuthorizationGate;
pub use balance::{AccountInfo, AccountLedger};
pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use escrow::{Escrow, EscrowManager, EscrowStatus, Funding};
pub use events::{EventLog, EventRecord, LedgerEvent};
pub use fee::{compute_fee, FeeConfig, MAX_FEE_BPS};
pub use payout::{MemoryPayoutChannel, PayoutChannel, PayoutKind, PayoutRequest};
pub use state::{CounterSnapshot, LedgerState};
pub use types::{AccountId, Amount, EscrowId, FeeKind, TransferReceipt, TxId, WithdrawalReceipt};

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// One independent ledger instance.
///
/// Operations hold the state read guard while they check and mutate, and
/// release every guard before calling the payout channel. Admin changes and
/// audits take the write guard, so they never interleave with a half-applied
/// operation.
pub struct SettlementEngine {
    state: RwLock<LedgerState>,
    pub ledger: Arc<AccountLedger>,
    pub escrows: Arc<EscrowManager>,
    pub events: Arc<EventLog>,
    payout: Arc<dyn PayoutChannel>,
}

impl SettlementEngine {
    pub fn new(state: LedgerState, payout: Arc<dyn PayoutChannel>) -> Self {
        Self::with_event_log(state, payout, Arc::new(EventLog::default()))
    }

    pub fn with_event_log(
        state: LedgerState,
        payout: Arc<dyn PayoutChannel>,
        events: Arc<EventLog>,
    ) -> Self {
        let ledger = Arc::new(AccountLedger::new(events.clone()));
        let escrows = Arc::new(EscrowManager::new(ledger.clone()));
        info!(
            owner = %state.owner(),
            fee_recipient = %state.fee_recipient(),
            transfer_fee_bps = state.fees().rate(FeeKind::Transfer),
            withdrawal_fee_bps = state.fees().rate(FeeKind::Withdrawal),
            "✨ Settlement engine initialized"
        );
        Self {
            state: RwLock::new(state),
            ledger,
            escrows,
            events,
            payout,
        }
    }

    pub fn from_config(config: &LedgerConfig, payout: Arc<dyn PayoutChannel>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| LedgerError::InvalidConfiguration(format!("{:#}", e)))?;
        let parse = |r: anyhow::Result<AccountId>| {
            r.map_err(|e| LedgerError::InvalidConfiguration(format!("{:#}", e)))
        };
        let owner = parse(config.owner())?;
        let fees = FeeConfig::new(config.fees.transfer_fee_bps, config.fees.withdrawal_fee_bps)?;
        let mut state = LedgerState::new(owner, parse(config.fee_recipient())?, fees)?;
        let operators = config
            .operators()
            .map_err(|e| LedgerError::InvalidConfiguration(format!("{:#}", e)))?;
        for operator in operators {
            state.update_operator(owner, operator, true)?;
        }

        let events = Arc::new(EventLog::new(config.events.broadcast_capacity));
        Ok(Self::with_event_log(state, payout, events))
    }

    // ---- account ledger ----

    pub async fn deposit(&self, account: AccountId, amount: Amount) -> Result<Amount> {
        let state = self.state.read().await;
        self.ledger.deposit(&state, account, amount).await
    }

    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> Result<TransferReceipt> {
        let state = self.state.read().await;
        self.ledger.transfer(&state, from, to, amount).await
    }

    /// Books the withdrawal, then asks the payout channel to deliver
    /// `amount`. A delivery failure is reported as `PayoutDeliveryFailed`
    /// with the debit left in place.
    pub async fn withdraw(&self, account: AccountId, amount: Amount) -> Result<WithdrawalReceipt> {
        let receipt = {
            let state = self.state.read().await;
            self.ledger.withdraw(&state, account, amount).await?
        };
        self.deliver(account, receipt.amount, PayoutKind::Withdrawal)
            .await?;
        Ok(receipt)
    }

    pub async fn balance_of(&self, account: AccountId) -> Amount {
        self.ledger.balance_of(account).await
    }

    pub async fn account(&self, account: AccountId) -> Option<AccountInfo> {
        self.ledger.account(account).await
    }

    // ---- escrow ----

    pub async fn create_escrow(
        &self,
        payer: Option<AccountId>,
        payee: AccountId,
        amount: Amount,
        description: impl Into<String>,
    ) -> Result<EscrowId> {
        let state = self.state.read().await;
        self.escrows
            .create_escrow(&state, payer, payee, amount, description)
            .await
    }

    pub async fn bind_payer(&self, id: EscrowId, payer: AccountId) -> Result<()> {
        let state = self.state.read().await;
        self.escrows.bind_payer(&state, id, payer).await
    }

    pub async fn complete_escrow(&self, id: EscrowId) -> Result<()> {
        let state = self.state.read().await;
        self.escrows.complete_escrow(&state, id).await
    }

    pub async fn cancel_escrow(&self, id: EscrowId) -> Result<()> {
        let state = self.state.read().await;
        self.escrows.cancel_escrow(&state, id).await
    }

    pub async fn get_escrow(&self, id: EscrowId) -> Result<Escrow> {
        self.escrows.get_escrow(id).await
    }

    pub async fn escrows_for(&self, account: AccountId) -> Vec<Escrow> {
        self.escrows.escrows_for(account).await
    }

    // ---- administration ----

    pub async fn pause(&self, caller: AccountId) -> Result<()> {
        let mut state = self.state.write().await;
        state.pause(caller)?;
        self.events.append(LedgerEvent::Paused { by: caller }).await;
        Ok(())
    }

    pub async fn unpause(&self, caller: AccountId) -> Result<()> {
        let mut state = self.state.write().await;
        state.unpause(caller)?;
        self.events.append(LedgerEvent::Unpaused { by: caller }).await;
        Ok(())
    }

    pub async fn update_fee(&self, caller: AccountId, kind: FeeKind, bps: u16) -> Result<()> {
        let mut state = self.state.write().await;
        let old_bps = state.update_fee(caller, kind, bps)?;
        self.events
            .append(LedgerEvent::FeeUpdated {
                kind,
                old_bps,
                new_bps: bps,
                by: caller,
            })
            .await;
        Ok(())
    }

    pub async fn update_operator(
        &self,
        caller: AccountId,
        operator: AccountId,
        enabled: bool,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.update_operator(caller, operator, enabled)?;
        self.events
            .append(LedgerEvent::OperatorUpdated {
                operator,
                enabled,
                by: caller,
            })
            .await;
        Ok(())
    }

    /// Owner-only recovery while paused: zeroes the account and pays out the
    /// full balance with no fee. Returns the recovered amount.
    pub async fn emergency_withdraw(&self, caller: AccountId, account: AccountId) -> Result<Amount> {
        let amount = {
            let state = self.state.read().await;
            self.ledger.emergency_drain(&state, caller, account).await?
        };
        self.deliver(account, amount, PayoutKind::Emergency).await?;
        Ok(amount)
    }

    pub async fn sweep_unbound_escrows(
        &self,
        caller: AccountId,
        max_age: chrono::Duration,
    ) -> Result<Vec<EscrowId>> {
        let state = self.state.read().await;
        self.escrows.sweep_unbound(&state, caller, max_age).await
    }

    // ---- observation ----

    pub async fn is_paused(&self) -> bool {
        self.state.read().await.is_paused()
    }

    pub async fn fee_config(&self) -> FeeConfig {
        self.state.read().await.fees()
    }

    pub async fn counters(&self) -> CounterSnapshot {
        self.state.read().await.counters().snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    /// Checks the conservation law on a consistent snapshot.
    pub async fn audit(&self) -> ConservationReport {
        let state = self.state.write().await;
        ConservationReport::collect(&self.ledger, &self.escrows, state.counters().snapshot()).await
    }

    async fn deliver(&self, account: AccountId, amount: Amount, kind: PayoutKind) -> Result<()> {
        let request = PayoutRequest {
            account,
            amount,
            kind,
        };
        match self.payout.deliver(request).await {
            Ok(receipt) => {
                debug!(
                    account = %account,
                    amount = amount.units(),
                    reference = %receipt.reference,
                    "Payout confirmed"
                );
                Ok(())
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(
                    account = %account,
                    amount = amount.units(),
                    kind = ?kind,
                    error = %reason,
                    "⚠️ Payout delivery failed, debit stands for reconciliation"
                );
                self.events
                    .append(LedgerEvent::PayoutFailed {
                        account,
                        amount,
                        reason: reason.clone(),
                    })
                    .await;
                Err(LedgerError::PayoutDeliveryFailed {
                    account,
                    amount,
                    reason,
                })
            }
        }
    }
}
