use crate::error::{LedgerError, Result};
use crate::state::LedgerState;
use crate::types::AccountId;
use tracing::debug;

/// Privilege and pause checks evaluated against a borrowed [`LedgerState`].
///
/// Every mutating operation runs its checks through the gate before touching
/// balances, so a rejection never leaves partial state behind.
pub struct AuthorizationGate<'a> {
    state: &'a LedgerState,
}

impl<'a> AuthorizationGate<'a> {
    pub fn new(state: &'a LedgerState) -> Self {
        Self { state }
    }

    pub fn is_owner(&self, caller: AccountId) -> bool {
        caller == self.state.owner
    }

    pub fn require_owner(&self, caller: AccountId, action: &'static str) -> Result<()> {
        if self.is_owner(caller) {
            return Ok(());
        }
        debug!(caller = %caller, action, "Owner check rejected");
        Err(LedgerError::Unauthorized { caller, action })
    }

    pub fn require_owner_or_operator(&self, caller: AccountId, action: &'static str) -> Result<()> {
        if self.is_owner(caller) || self.state.operators.contains(&caller) {
            return Ok(());
        }
        debug!(caller = %caller, action, "Owner/operator check rejected");
        Err(LedgerError::Unauthorized { caller, action })
    }

    pub fn require_not_paused(&self) -> Result<()> {
        if self.state.paused {
            return Err(LedgerError::Paused);
        }
        Ok(())
    }

    /// Emergency paths are only open while the ledger is halted.
    pub fn require_paused(&self) -> Result<()> {
        if !self.state.paused {
            return Err(LedgerError::NotPaused);
        }
        Ok(())
    }
}
