use crate::balance::{ensure_positive, AccountLedger, Posting};
use crate::error::{LedgerError, Result};
use crate::events::LedgerEvent;
use crate::state::LedgerState;
use crate::types::{AccountId, Amount, EscrowId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Who funds an escrow. Open marketplace tasks start `Unbound` and hold no
/// value until a payer claims them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Funding {
    Unbound,
    Bound { payer: AccountId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowStatus {
    Open,
    Completed,
    Cancelled,
}

impl EscrowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EscrowStatus::Open)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: EscrowId,
    pub payee: AccountId,
    pub amount: Amount,
    pub description: String,
    pub funding: Funding,
    pub status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Escrow {
    pub fn payer(&self) -> Option<AccountId> {
        match self.funding {
            Funding::Unbound => None,
            Funding::Bound { payer } => Some(payer),
        }
    }

    /// Value currently in custody for this escrow.
    pub fn held(&self) -> Amount {
        match (self.status, self.funding) {
            (EscrowStatus::Open, Funding::Bound { .. }) => self.amount,
            _ => Amount::ZERO,
        }
    }

    fn require_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(LedgerError::InvalidEscrowState {
                id: self.id,
                reason: format!("escrow is {:?}", self.status),
            });
        }
        Ok(())
    }
}

/// Escrow records and their custody pool.
///
/// Lock order is escrow first, then accounts, so escrow transitions never
/// deadlock against plain transfers.
pub struct EscrowManager {
    ledger: Arc<AccountLedger>,
    escrows: RwLock<HashMap<EscrowId, Arc<Mutex<Escrow>>>>,
    next_id: AtomicU64,
}

impl EscrowManager {
    pub fn new(ledger: Arc<AccountLedger>) -> Self {
        Self {
            ledger,
            escrows: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn handle(&self, id: EscrowId) -> Result<Arc<Mutex<Escrow>>> {
        let escrows = self.escrows.read().await;
        escrows
            .get(&id)
            .cloned()
            .ok_or(LedgerError::EscrowNotFound(id))
    }

    async fn all_handles(&self) -> Vec<Arc<Mutex<Escrow>>> {
        let escrows = self.escrows.read().await;
        escrows.values().cloned().collect()
    }

    fn allocate_id(&self) -> EscrowId {
        EscrowId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub async fn create_escrow(
        &self,
        state: &LedgerState,
        payer: Option<AccountId>,
        payee: AccountId,
        amount: Amount,
        description: impl Into<String>,
    ) -> Result<EscrowId> {
        ensure_positive(amount)?;
        payee.ensure_valid()?;
        if let Some(payer) = payer {
            payer.ensure_valid()?;
            if payer == payee {
                return Err(LedgerError::SelfTransferNotAllowed(payer));
            }
        }
        state.gate().require_not_paused()?;
        let description = description.into();

        let (funding, payer_balance, _locked) = match payer {
            Some(payer) => {
                let locked = self.ledger.lock_accounts(&[payer]).await;
                let (locked, balances) = self
                    .ledger
                    .settle(locked, &[Posting::Debit(payer, amount)])
                    .await?;
                // keep the payer locked until the escrow is registered
                (Funding::Bound { payer }, Some(balances[&payer]), Some(locked))
            }
            None => (Funding::Unbound, None, None),
        };

        let id = self.allocate_id();
        let escrow = Escrow {
            id,
            payee,
            amount,
            description,
            funding,
            status: EscrowStatus::Open,
            created_at: Utc::now(),
            settled_at: None,
        };
        self.escrows
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(escrow)));

        self.ledger
            .events()
            .append(LedgerEvent::EscrowCreated {
                escrow_id: id,
                payer,
                payee,
                amount,
                payer_balance,
            })
            .await;

        info!(
            escrow_id = %id,
            payer = ?payer.map(|p| p.short()),
            payee = %payee,
            amount = amount.units(),
            funded = payer.is_some(),
            "🔒 Escrow created"
        );
        Ok(id)
    }

    /// Claims an unbound escrow for `payer` and moves the amount into custody.
    pub async fn bind_payer(&self, state: &LedgerState, id: EscrowId, payer: AccountId) -> Result<()> {
        payer.ensure_valid()?;
        state.gate().require_not_paused()?;

        let handle = self.handle(id).await?;
        let mut escrow = handle.lock().await;
        escrow.require_open()?;
        if let Funding::Bound { payer: bound } = escrow.funding {
            return Err(LedgerError::InvalidEscrowState {
                id,
                reason: format!("payer {} already bound", bound),
            });
        }
        if payer == escrow.payee {
            return Err(LedgerError::SelfTransferNotAllowed(payer));
        }

        let locked = self.ledger.lock_accounts(&[payer]).await;
        let (_locked, balances) = self
            .ledger
            .settle(locked, &[Posting::Debit(payer, escrow.amount)])
            .await?;
        escrow.funding = Funding::Bound { payer };

        self.ledger
            .events()
            .append(LedgerEvent::PayerBound {
                escrow_id: id,
                payer,
                amount: escrow.amount,
                payer_balance: balances[&payer],
            })
            .await;

        info!(
            escrow_id = %id,
            payer = %payer,
            amount = escrow.amount.units(),
            payer_balance_after = balances[&payer].units(),
            "🔒 Escrow payer bound"
        );
        Ok(())
    }

    /// Releases custody to the payee. Single-fire: the status flips under
    /// the escrow lock together with the credit.
    pub async fn complete_escrow(&self, state: &LedgerState, id: EscrowId) -> Result<()> {
        state.gate().require_not_paused()?;

        let handle = self.handle(id).await?;
        let mut escrow = handle.lock().await;
        escrow.require_open()?;
        if escrow.payer().is_none() {
            return Err(LedgerError::InvalidEscrowState {
                id,
                reason: "no payer bound".to_string(),
            });
        }

        let payee = escrow.payee;
        let locked = self.ledger.lock_accounts(&[payee]).await;
        let (_locked, balances) = self
            .ledger
            .settle(locked, &[Posting::Credit(payee, escrow.amount)])
            .await?;
        escrow.status = EscrowStatus::Completed;
        escrow.settled_at = Some(Utc::now());

        self.ledger
            .events()
            .append(LedgerEvent::EscrowCompleted {
                escrow_id: id,
                payee,
                amount: escrow.amount,
                payee_balance: balances[&payee],
            })
            .await;

        info!(
            escrow_id = %id,
            payee = %payee,
            amount = escrow.amount.units(),
            payee_balance_after = balances[&payee].units(),
            "🔓 Escrow released"
        );
        Ok(())
    }

    /// Returns custody (if any) to the payer.
    pub async fn cancel_escrow(&self, state: &LedgerState, id: EscrowId) -> Result<()> {
        state.gate().require_not_paused()?;

        let handle = self.handle(id).await?;
        let mut escrow = handle.lock().await;
        escrow.require_open()?;
        self.cancel_locked(&mut escrow).await
    }

    async fn cancel_locked(&self, escrow: &mut Escrow) -> Result<()> {
        let payer = escrow.payer();
        let payer_balance = match payer {
            Some(payer) => {
                let locked = self.ledger.lock_accounts(&[payer]).await;
                let (_locked, balances) = self
                    .ledger
                    .settle(locked, &[Posting::Credit(payer, escrow.amount)])
                    .await?;
                Some(balances[&payer])
            }
            None => None,
        };
        escrow.status = EscrowStatus::Cancelled;
        escrow.settled_at = Some(Utc::now());

        self.ledger
            .events()
            .append(LedgerEvent::EscrowCancelled {
                escrow_id: escrow.id,
                refunded_to: payer,
                amount: escrow.amount,
                payer_balance,
            })
            .await;

        info!(
            escrow_id = %escrow.id,
            refunded_to = ?payer.map(|p| p.short()),
            amount = escrow.amount.units(),
            "🔄 Escrow cancelled"
        );
        Ok(())
    }

    /// Cancels OPEN escrows that never found a payer within `max_age`.
    ///
    /// Unbound escrows hold no value, so this only retires records.
    pub async fn sweep_unbound(
        &self,
        state: &LedgerState,
        caller: AccountId,
        max_age: Duration,
    ) -> Result<Vec<EscrowId>> {
        state
            .gate()
            .require_owner_or_operator(caller, "sweep_unbound_escrows")?;
        state.gate().require_not_paused()?;

        let cutoff = Utc::now() - max_age;
        let mut swept = Vec::new();
        for handle in self.all_handles().await {
            let mut escrow = handle.lock().await;
            let stale = escrow.status == EscrowStatus::Open
                && escrow.funding == Funding::Unbound
                && escrow.created_at <= cutoff;
            if stale {
                self.cancel_locked(&mut escrow).await?;
                swept.push(escrow.id);
            }
        }
        swept.sort();

        info!(
            caller = %caller,
            swept = swept.len(),
            max_age_secs = max_age.num_seconds(),
            "🧹 Unbound escrows swept"
        );
        Ok(swept)
    }

    pub async fn get_escrow(&self, id: EscrowId) -> Result<Escrow> {
        let handle = self.handle(id).await?;
        let escrow = handle.lock().await;
        Ok(escrow.clone())
    }

    /// Escrows where `account` is the payer or the payee, by id.
    pub async fn escrows_for(&self, account: AccountId) -> Vec<Escrow> {
        let mut result = Vec::new();
        for handle in self.all_handles().await {
            let escrow = handle.lock().await;
            if escrow.payee == account || escrow.payer() == Some(account) {
                result.push(escrow.clone());
            }
        }
        result.sort_by_key(|e| e.id);
        result
    }

    /// Total custody and the number of escrows holding it.
    pub async fn held_total(&self) -> (u128, usize) {
        let mut total = 0u128;
        let mut count = 0usize;
        for handle in self.all_handles().await {
            let escrow = handle.lock().await;
            let held = escrow.held();
            if !held.is_zero() {
                total += held.units() as u128;
                count += 1;
            }
        }
        debug!(held = %total, escrows = count, "Escrow custody totalled");
        (total, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::fee::FeeConfig;

    const OWNER: AccountId = AccountId::from_bytes([0xAA; 32]);
    const PAYER: AccountId = AccountId::from_bytes([1; 32]);
    const PAYEE: AccountId = AccountId::from_bytes([2; 32]);

    async fn setup() -> (LedgerState, Arc<AccountLedger>, EscrowManager) {
        let state = LedgerState::new(
            OWNER,
            AccountId::from_bytes([0xFE; 32]),
            FeeConfig::new(25, 25).unwrap(),
        )
        .unwrap();
        let ledger = Arc::new(AccountLedger::new(Arc::new(EventLog::default())));
        ledger
            .deposit(&state, PAYER, Amount::from_units(1_000))
            .await
            .unwrap();
        let escrows = EscrowManager::new(ledger.clone());
        (state, ledger, escrows)
    }

    #[tokio::test]
    async fn test_escrow_lifecycle() {
        let (state, ledger, escrows) = setup().await;

        let id = escrows
            .create_escrow(&state, Some(PAYER), PAYEE, Amount::from_units(500), "task")
            .await
            .unwrap();
        assert_eq!(id, EscrowId::new(1));
        // no fee on escrow custody
        assert_eq!(ledger.balance_of(PAYER).await, Amount::from_units(500));
        assert_eq!(escrows.held_total().await, (500, 1));

        escrows.complete_escrow(&state, id).await.unwrap();
        assert_eq!(ledger.balance_of(PAYEE).await, Amount::from_units(500));
        assert_eq!(escrows.held_total().await, (0, 0));

        let escrow = escrows.get_escrow(id).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Completed);
        assert!(escrow.settled_at.is_some());

        let err = escrows.complete_escrow(&state, id).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidEscrowState { .. }));
        assert!(escrows.cancel_escrow(&state, id).await.is_err());
        assert_eq!(ledger.balance_of(PAYEE).await, Amount::from_units(500));
    }

    #[tokio::test]
    async fn test_unbound_escrow_binding() {
        let (state, ledger, escrows) = setup().await;

        let id = escrows
            .create_escrow(&state, None, PAYEE, Amount::from_units(300), "open task")
            .await
            .unwrap();
        assert_eq!(escrows.held_total().await, (0, 0));

        let err = escrows.complete_escrow(&state, id).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidEscrowState { .. }));

        assert!(matches!(
            escrows.bind_payer(&state, id, PAYEE).await,
            Err(LedgerError::SelfTransferNotAllowed(_))
        ));

        escrows.bind_payer(&state, id, PAYER).await.unwrap();
        assert_eq!(ledger.balance_of(PAYER).await, Amount::from_units(700));
        assert_eq!(escrows.get_escrow(id).await.unwrap().payer(), Some(PAYER));

        let other = AccountId::from_bytes([3; 32]);
        assert!(matches!(
            escrows.bind_payer(&state, id, other).await,
            Err(LedgerError::InvalidEscrowState { .. })
        ));

        escrows.cancel_escrow(&state, id).await.unwrap();
        assert_eq!(ledger.balance_of(PAYER).await, Amount::from_units(1_000));
        assert!(escrows.bind_payer(&state, id, other).await.is_err());
    }

    #[tokio::test]
    async fn test_create_rejections() {
        let (mut state, ledger, escrows) = setup().await;

        assert!(matches!(
            escrows
                .create_escrow(&state, Some(PAYER), PAYEE, Amount::ZERO, "")
                .await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            escrows
                .create_escrow(&state, Some(PAYER), AccountId::NULL, Amount::from_units(1), "")
                .await,
            Err(LedgerError::InvalidAccount(_))
        ));
        assert!(matches!(
            escrows
                .create_escrow(&state, Some(PAYER), PAYEE, Amount::from_units(1_001), "")
                .await,
            Err(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(ledger.balance_of(PAYER).await, Amount::from_units(1_000));

        // failed creations do not consume ids
        let id = escrows
            .create_escrow(&state, Some(PAYER), PAYEE, Amount::from_units(1), "")
            .await
            .unwrap();
        assert_eq!(id, EscrowId::new(1));

        state.pause(OWNER).unwrap();
        assert!(matches!(
            escrows.complete_escrow(&state, id).await,
            Err(LedgerError::Paused)
        ));
        assert!(matches!(
            escrows.cancel_escrow(&state, id).await,
            Err(LedgerError::Paused)
        ));
        assert!(matches!(
            escrows.get_escrow(EscrowId::new(42)).await,
            Err(LedgerError::EscrowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unfunded_payers_leave_no_slots() {
        let (state, ledger, escrows) = setup().await;
        let stranger = AccountId::from_bytes([9; 32]);
        let tracked = ledger.tracked_slots().await;

        assert!(matches!(
            escrows
                .create_escrow(&state, Some(stranger), PAYEE, Amount::from_units(5), "")
                .await,
            Err(LedgerError::InsufficientBalance { .. })
        ));
        let id = escrows
            .create_escrow(&state, None, PAYEE, Amount::from_units(5), "open")
            .await
            .unwrap();
        assert!(escrows.bind_payer(&state, id, stranger).await.is_err());

        assert_eq!(ledger.tracked_slots().await, tracked);
        assert_eq!(escrows.get_escrow(id).await.unwrap().payer(), None);
    }

    #[tokio::test]
    async fn test_sweep_only_touches_stale_unbound() {
        let (state, _ledger, escrows) = setup().await;

        let unbound = escrows
            .create_escrow(&state, None, PAYEE, Amount::from_units(10), "abandoned")
            .await
            .unwrap();
        let funded = escrows
            .create_escrow(&state, Some(PAYER), PAYEE, Amount::from_units(10), "funded")
            .await
            .unwrap();

        assert!(matches!(
            escrows.sweep_unbound(&state, PAYER, Duration::zero()).await,
            Err(LedgerError::Unauthorized { .. })
        ));
        assert!(escrows
            .sweep_unbound(&state, OWNER, Duration::hours(1))
            .await
            .unwrap()
            .is_empty());

        let swept = escrows
            .sweep_unbound(&state, OWNER, Duration::zero())
            .await
            .unwrap();
        assert_eq!(swept, vec![unbound]);
        assert_eq!(
            escrows.get_escrow(unbound).await.unwrap().status,
            EscrowStatus::Cancelled
        );
        assert_eq!(
            escrows.get_escrow(funded).await.unwrap().status,
            EscrowStatus::Open
        );
        assert_eq!(escrows.escrows_for(PAYER).await.len(), 1);
        assert_eq!(escrows.escrows_for(PAYEE).await.len(), 2);
    }
}
