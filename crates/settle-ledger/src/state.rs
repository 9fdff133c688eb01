use crate::auth::AuthorizationGate;
use crate::error::{LedgerError, Result};
use crate::fee::FeeConfig;
use crate::types::{AccountId, Amount, FeeKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Monotonic audit counters, advanced while operations share read access to
/// the [`LedgerState`].
///
/// Value totals are cumulative over the life of the ledger, so they are kept
/// in 128 bits: many accounts may each hold up to `u64::MAX`.
#[derive(Debug, Default)]
pub struct LedgerCounters {
    flows: Mutex<FlowTotals>,
    transaction_counter: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
struct FlowTotals {
    deposits: u128,
    withdrawals: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub total_deposits: u128,
    pub total_withdrawals: u128,
    pub transaction_counter: u64,
}

impl LedgerCounters {
    fn flows(&self) -> MutexGuard<'_, FlowTotals> {
        // plain integers, a panicked holder cannot leave them half-written
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_deposit(&self, amount: Amount) {
        let mut flows = self.flows();
        flows.deposits = flows.deposits.saturating_add(amount.units() as u128);
    }

    pub(crate) fn record_withdrawal(&self, amount: Amount) {
        let mut flows = self.flows();
        flows.withdrawals = flows.withdrawals.saturating_add(amount.units() as u128);
    }

    /// Returns the new counter value.
    pub(crate) fn next_transaction(&self) -> u64 {
        self.transaction_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let flows = *self.flows();
        CounterSnapshot {
            total_deposits: flows.deposits,
            total_withdrawals: flows.withdrawals,
            transaction_counter: self.transaction_counter.load(Ordering::SeqCst),
        }
    }
}

/// Process-wide settings and flags of one ledger instance.
///
/// The engine keeps it behind a single `RwLock`: operations borrow it shared
/// for their whole effect phase, admin changes take it exclusively.
#[derive(Debug)]
pub struct LedgerState {
    pub(crate) owner: AccountId,
    pub(crate) operators: BTreeSet<AccountId>,
    pub(crate) paused: bool,
    pub(crate) fees: FeeConfig,
    pub(crate) fee_recipient: AccountId,
    pub(crate) counters: LedgerCounters,
}

impl LedgerState {
    pub fn new(owner: AccountId, fee_recipient: AccountId, fees: FeeConfig) -> Result<Self> {
        owner.ensure_valid()?;
        fee_recipient.ensure_valid()?;
        Ok(Self {
            owner,
            operators: BTreeSet::new(),
            paused: false,
            fees,
            fee_recipient,
            counters: LedgerCounters::default(),
        })
    }

    pub fn gate(&self) -> AuthorizationGate<'_> {
        AuthorizationGate::new(self)
    }

    pub fn owner(&self) -> AccountId {
        self.owner
    }

    pub fn fee_recipient(&self) -> AccountId {
        self.fee_recipient
    }

    pub fn fees(&self) -> FeeConfig {
        self.fees
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_operator(&self, account: &AccountId) -> bool {
        self.operators.contains(account)
    }

    pub fn operators(&self) -> impl Iterator<Item = &AccountId> {
        self.operators.iter()
    }

    pub fn counters(&self) -> &LedgerCounters {
        &self.counters
    }

    pub fn pause(&mut self, caller: AccountId) -> Result<()> {
        self.gate().require_owner_or_operator(caller, "pause")?;
        self.gate().require_not_paused()?;
        self.paused = true;
        warn!(caller = %caller, "⏸️ Ledger paused");
        Ok(())
    }

    pub fn unpause(&mut self, caller: AccountId) -> Result<()> {
        self.gate().require_owner_or_operator(caller, "unpause")?;
        self.gate().require_paused()?;
        self.paused = false;
        info!(caller = %caller, "▶️ Ledger unpaused");
        Ok(())
    }

    /// Returns the previous rate. Takes effect for the next operation.
    pub fn update_fee(&mut self, caller: AccountId, kind: FeeKind, bps: u16) -> Result<u16> {
        self.gate().require_owner_or_operator(caller, "update_fee")?;
        let old = self.fees.set(kind, bps)?;
        info!(
            caller = %caller,
            kind = %kind,
            old_bps = old,
            new_bps = bps,
            "⚙️ Fee rate updated"
        );
        Ok(old)
    }

    pub fn update_operator(
        &mut self,
        caller: AccountId,
        operator: AccountId,
        enabled: bool,
    ) -> Result<()> {
        self.gate().require_owner(caller, "update_operator")?;
        operator.ensure_valid()?;
        if operator == self.owner {
            return Err(LedgerError::InvalidAccount(
                "owner cannot be listed as operator".to_string(),
            ));
        }
        let changed = if enabled {
            self.operators.insert(operator)
        } else {
            self.operators.remove(&operator)
        };
        info!(
            caller = %caller,
            operator = %operator,
            enabled,
            changed,
            operator_count = self.operators.len(),
            "🔑 Operator set updated"
        );
        Ok(())
    }
}
