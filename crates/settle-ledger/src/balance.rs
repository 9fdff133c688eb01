use crate::error::{LedgerError, Result};
use crate::events::{EventLog, LedgerEvent};
use crate::state::LedgerState;
use crate::types::{AccountId, Amount, FeeKind, TransferReceipt, TxId, WithdrawalReceipt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: AccountId,
    pub balance: Amount,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct AccountSlot {
    balance: Amount,
    opened_at: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
}

/// One leg of an atomic balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Posting {
    Debit(AccountId, Amount),
    Credit(AccountId, Amount),
}

/// Exclusive guards over a set of accounts, acquired in ascending id order.
///
/// Dropping the set releases every account at once.
pub struct LockedAccounts {
    guards: BTreeMap<AccountId, OwnedMutexGuard<AccountSlot>>,
}

impl LockedAccounts {
    pub fn balance(&self, account: &AccountId) -> Amount {
        self.guards
            .get(account)
            .map(|slot| slot.balance)
            .unwrap_or(Amount::ZERO)
    }

    /// Applies all postings or none of them.
    ///
    /// Postings are staged in order on copies of the locked balances; the
    /// first debit that cannot be covered or credit that would overflow
    /// aborts the batch before any slot is written. Returns the resulting
    /// balance of every locked account.
    pub fn apply(&mut self, postings: &[Posting]) -> Result<BTreeMap<AccountId, Amount>> {
        let mut staged: BTreeMap<AccountId, Amount> = self
            .guards
            .iter()
            .map(|(id, slot)| (*id, slot.balance))
            .collect();
        let mut credited = BTreeSet::new();

        for posting in postings {
            match *posting {
                Posting::Debit(account, amount) => {
                    let current = Self::staged_slot(&mut staged, account)?;
                    *current = current.checked_sub(amount).ok_or(
                        LedgerError::InsufficientBalance {
                            account,
                            available: *current,
                            required: amount,
                        },
                    )?;
                }
                Posting::Credit(account, amount) => {
                    let current = Self::staged_slot(&mut staged, account)?;
                    *current = current
                        .checked_add(amount)
                        .ok_or(LedgerError::BalanceOverflow(account))?;
                    if !amount.is_zero() {
                        credited.insert(account);
                    }
                }
            }
        }

        let now = Utc::now();
        for (id, slot) in self.guards.iter_mut() {
            let new_balance = staged[id];
            let touched = new_balance != slot.balance || credited.contains(id);
            slot.balance = new_balance;
            if touched {
                slot.last_activity = Some(now);
            }
            if credited.contains(id) && slot.opened_at.is_none() {
                slot.opened_at = Some(now);
            }
        }

        Ok(staged)
    }

    fn staged_slot(
        staged: &mut BTreeMap<AccountId, Amount>,
        account: AccountId,
    ) -> Result<&mut Amount> {
        staged.get_mut(&account).ok_or_else(|| {
            LedgerError::InvalidAccount(format!("{} is not locked for this operation", account))
        })
    }
}

/// Per-account balances with all-or-nothing mutation.
pub struct AccountLedger {
    accounts: RwLock<HashMap<AccountId, Arc<Mutex<AccountSlot>>>>,
    events: Arc<EventLog>,
}

impl AccountLedger {
    pub fn new(events: Arc<EventLog>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub(crate) fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    async fn handles(&self, ids: &[AccountId]) -> Vec<Arc<Mutex<AccountSlot>>> {
        {
            let accounts = self.accounts.read().await;
            let found: Vec<_> = ids.iter().filter_map(|id| accounts.get(id).cloned()).collect();
            if found.len() == ids.len() {
                return found;
            }
        }

        let mut accounts = self.accounts.write().await;
        ids.iter()
            .map(|id| accounts.entry(*id).or_default().clone())
            .collect()
    }

    /// Locks every listed account (duplicates allowed) in ascending order.
    pub async fn lock_accounts(&self, ids: &[AccountId]) -> LockedAccounts {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let handles = self.handles(&ids).await;
        let mut guards = BTreeMap::new();
        for (id, handle) in ids.into_iter().zip(handles) {
            guards.insert(id, handle.lock_owned().await);
        }
        LockedAccounts { guards }
    }

    /// Applies `postings` and hands the guards back for the rest of the
    /// operation. On failure the guards are released through [`Self::discard`].
    pub async fn settle(
        &self,
        mut locked: LockedAccounts,
        postings: &[Posting],
    ) -> Result<(LockedAccounts, BTreeMap<AccountId, Amount>)> {
        match locked.apply(postings) {
            Ok(balances) => Ok((locked, balances)),
            Err(e) => {
                self.discard(locked).await;
                Err(e)
            }
        }
    }

    /// Releases an abandoned lock set and forgets any slot it created that
    /// was never credited, so rejected calls do not grow the account map.
    pub async fn discard(&self, locked: LockedAccounts) {
        let ids: Vec<AccountId> = locked.guards.keys().copied().collect();
        drop(locked);

        let mut accounts = self.accounts.write().await;
        let mut pruned = 0usize;
        for id in ids {
            let unused = match accounts.get(&id) {
                // a clone elsewhere means another operation is using the slot
                Some(handle) if Arc::strong_count(handle) == 1 => handle
                    .try_lock()
                    .map(|slot| slot.opened_at.is_none() && slot.balance.is_zero())
                    .unwrap_or(false),
                _ => false,
            };
            if unused {
                accounts.remove(&id);
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, tracked = accounts.len(), "Dropped unused account slots");
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked_slots(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn balance_of(&self, account: AccountId) -> Amount {
        let handle = {
            let accounts = self.accounts.read().await;
            match accounts.get(&account) {
                Some(handle) => handle.clone(),
                None => return Amount::ZERO,
            }
        };
        let slot = handle.lock().await;
        slot.balance
    }

    pub async fn account(&self, account: AccountId) -> Option<AccountInfo> {
        let handle = self.accounts.read().await.get(&account).cloned()?;
        let slot = handle.lock().await;
        slot.opened_at.map(|_| AccountInfo {
            id: account,
            balance: slot.balance,
            opened_at: slot.opened_at,
            last_activity: slot.last_activity,
        })
    }

    /// Every account that has ever been credited, zero balances included,
    /// ordered by id.
    pub async fn accounts_snapshot(&self) -> Vec<AccountInfo> {
        let handles: Vec<_> = {
            let accounts = self.accounts.read().await;
            accounts
                .iter()
                .map(|(id, handle)| (*id, handle.clone()))
                .collect()
        };

        let mut result = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let slot = handle.lock().await;
            if slot.opened_at.is_some() {
                result.push(AccountInfo {
                    id,
                    balance: slot.balance,
                    opened_at: slot.opened_at,
                    last_activity: slot.last_activity,
                });
            }
        }
        result.sort_by_key(|info| info.id);
        result
    }

    /// Credits external value. Accepted while paused.
    pub async fn deposit(
        &self,
        state: &LedgerState,
        account: AccountId,
        amount: Amount,
    ) -> Result<Amount> {
        ensure_positive(amount)?;
        account.ensure_valid()?;

        let locked = self.lock_accounts(&[account]).await;
        let before = locked.balance(&account);
        let (_locked, balances) = self
            .settle(locked, &[Posting::Credit(account, amount)])
            .await?;
        let balance = balances[&account];
        state.counters.record_deposit(amount);

        self.events
            .append(LedgerEvent::Deposited {
                account,
                amount,
                balance,
            })
            .await;

        info!(
            account = %account,
            amount = amount.units(),
            balance_before = before.units(),
            balance_after = balance.units(),
            "💰 Deposit credited"
        );
        Ok(balance)
    }

    pub async fn transfer(
        &self,
        state: &LedgerState,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> Result<TransferReceipt> {
        ensure_positive(amount)?;
        to.ensure_valid()?;
        from.ensure_valid()?;
        if from == to {
            return Err(LedgerError::SelfTransferNotAllowed(from));
        }
        state.gate().require_not_paused()?;

        let fee = state.fees.fee_for(FeeKind::Transfer, amount);
        let fee_recipient = state.fee_recipient;
        let total = amount
            .checked_add(fee)
            .ok_or_else(|| LedgerError::InvalidAmount("amount plus fee overflows".to_string()))?;

        let locked = self.lock_accounts(&[from, to, fee_recipient]).await;
        let from_before = locked.balance(&from);
        let postings = [
            Posting::Debit(from, total),
            Posting::Credit(to, amount),
            Posting::Credit(fee_recipient, fee),
        ];
        let (_locked, balances) = match self.settle(locked, &postings).await {
            Ok(settled) => settled,
            Err(e) => {
                debug!(
                    from = %from,
                    to = %to,
                    amount = amount.units(),
                    fee = fee.units(),
                    error = %e,
                    "❌ Transfer rejected"
                );
                return Err(e);
            }
        };

        let counter = state.counters.next_transaction();
        let tx_id = TxId::derive(from, to, amount, counter);

        self.events
            .append(LedgerEvent::Transferred {
                tx_id: tx_id.clone(),
                from,
                to,
                amount,
                fee,
                fee_recipient,
                from_balance: balances[&from],
                to_balance: balances[&to],
            })
            .await;

        info!(
            from = %from,
            to = %to,
            amount = amount.units(),
            fee = fee.units(),
            from_balance_before = from_before.units(),
            from_balance_after = balances[&from].units(),
            to_balance_after = balances[&to].units(),
            tx_id = %tx_id,
            "✅ Transfer committed"
        );

        Ok(TransferReceipt { tx_id, amount, fee })
    }

    /// Debits `amount + fee` and books the withdrawal.
    ///
    /// Only the ledger side: the caller must hand `amount` to the payout
    /// channel after this returns and every lock is gone.
    pub async fn withdraw(
        &self,
        state: &LedgerState,
        account: AccountId,
        amount: Amount,
    ) -> Result<WithdrawalReceipt> {
        ensure_positive(amount)?;
        account.ensure_valid()?;
        state.gate().require_not_paused()?;

        let fee = state.fees.fee_for(FeeKind::Withdrawal, amount);
        let fee_recipient = state.fee_recipient;
        let total = amount
            .checked_add(fee)
            .ok_or_else(|| LedgerError::InvalidAmount("amount plus fee overflows".to_string()))?;

        let locked = self.lock_accounts(&[account, fee_recipient]).await;
        let before = locked.balance(&account);
        let (_locked, balances) = self
            .settle(
                locked,
                &[
                    Posting::Debit(account, total),
                    Posting::Credit(fee_recipient, fee),
                ],
            )
            .await?;
        let new_balance = balances[&account];
        state.counters.record_withdrawal(amount);

        self.events
            .append(LedgerEvent::Withdrawn {
                account,
                amount,
                fee,
                balance: new_balance,
            })
            .await;

        info!(
            account = %account,
            amount = amount.units(),
            fee = fee.units(),
            balance_before = before.units(),
            balance_after = new_balance.units(),
            "💸 Withdrawal booked"
        );

        Ok(WithdrawalReceipt {
            amount,
            fee,
            new_balance,
        })
    }

    /// Zeroes an account for the emergency recovery path and returns the
    /// amount to pay out. Owner-only and only while paused; no fee.
    pub async fn emergency_drain(
        &self,
        state: &LedgerState,
        caller: AccountId,
        account: AccountId,
    ) -> Result<Amount> {
        state.gate().require_owner(caller, "emergency_withdraw")?;
        state.gate().require_paused()?;
        account.ensure_valid()?;

        let locked = self.lock_accounts(&[account]).await;
        let amount = locked.balance(&account);
        if amount.is_zero() {
            self.discard(locked).await;
            return Err(LedgerError::InvalidAmount(format!(
                "{} holds no funds to recover",
                account
            )));
        }
        let (_locked, _) = self
            .settle(locked, &[Posting::Debit(account, amount)])
            .await?;
        state.counters.record_withdrawal(amount);

        self.events
            .append(LedgerEvent::EmergencyWithdrawn {
                account,
                amount,
                by: caller,
            })
            .await;

        warn!(
            caller = %caller,
            account = %account,
            amount = amount.units(),
            "🚨 Emergency withdrawal booked"
        );
        Ok(amount)
    }
}

pub(crate) fn ensure_positive(amount: Amount) -> Result<()> {
    if amount.is_zero() {
        return Err(LedgerError::InvalidAmount(
            "amount must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
