//! Append-only ledger event log.
//!
//! Downstream collaborators (reward crediting, notifications, leaderboard
//! refresh) integrate with the ledger through this log only. Records are
//! kept for the life of the ledger; live subscribers additionally receive
//! each record over a broadcast channel and may lag without affecting the log.

use crate::error::Result;
use crate::types::{AccountId, Amount, EscrowId, FeeKind, TxId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LedgerEvent {
    Deposited {
        account: AccountId,
        amount: Amount,
        balance: Amount,
    },
    Transferred {
        tx_id: TxId,
        from: AccountId,
        to: AccountId,
        amount: Amount,
        fee: Amount,
        fee_recipient: AccountId,
        from_balance: Amount,
        to_balance: Amount,
    },
    Withdrawn {
        account: AccountId,
        amount: Amount,
        fee: Amount,
        balance: Amount,
    },
    /// The external channel rejected a payout whose debit is already
    /// committed. Needs reconciliation by the host.
    PayoutFailed {
        account: AccountId,
        amount: Amount,
        reason: String,
    },
    EscrowCreated {
        escrow_id: EscrowId,
        payer: Option<AccountId>,
        payee: AccountId,
        amount: Amount,
        payer_balance: Option<Amount>,
    },
    PayerBound {
        escrow_id: EscrowId,
        payer: AccountId,
        amount: Amount,
        payer_balance: Amount,
    },
    EscrowCompleted {
        escrow_id: EscrowId,
        payee: AccountId,
        amount: Amount,
        payee_balance: Amount,
    },
    EscrowCancelled {
        escrow_id: EscrowId,
        refunded_to: Option<AccountId>,
        amount: Amount,
        payer_balance: Option<Amount>,
    },
    Paused {
        by: AccountId,
    },
    Unpaused {
        by: AccountId,
    },
    FeeUpdated {
        kind: FeeKind,
        old_bps: u16,
        new_bps: u16,
        by: AccountId,
    },
    OperatorUpdated {
        operator: AccountId,
        enabled: bool,
        by: AccountId,
    },
    EmergencyWithdrawn {
        account: AccountId,
        amount: Amount,
        by: AccountId,
    },
}

impl LedgerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::Deposited { .. } => "deposited",
            LedgerEvent::Transferred { .. } => "transferred",
            LedgerEvent::Withdrawn { .. } => "withdrawn",
            LedgerEvent::PayoutFailed { .. } => "payout_failed",
            LedgerEvent::EscrowCreated { .. } => "escrow_created",
            LedgerEvent::PayerBound { .. } => "payer_bound",
            LedgerEvent::EscrowCompleted { .. } => "escrow_completed",
            LedgerEvent::EscrowCancelled { .. } => "escrow_cancelled",
            LedgerEvent::Paused { .. } => "paused",
            LedgerEvent::Unpaused { .. } => "unpaused",
            LedgerEvent::FeeUpdated { .. } => "fee_updated",
            LedgerEvent::OperatorUpdated { .. } => "operator_updated",
            LedgerEvent::EmergencyWithdrawn { .. } => "emergency_withdrawn",
        }
    }

    /// Accounts whose balance or escrow exposure this event concerns.
    pub fn involves(&self, account: &AccountId) -> bool {
        match self {
            LedgerEvent::Deposited { account: a, .. }
            | LedgerEvent::Withdrawn { account: a, .. }
            | LedgerEvent::PayoutFailed { account: a, .. }
            | LedgerEvent::EmergencyWithdrawn { account: a, .. } => a == account,
            LedgerEvent::Transferred {
                from,
                to,
                fee_recipient,
                ..
            } => from == account || to == account || fee_recipient == account,
            LedgerEvent::EscrowCreated { payer, payee, .. } => {
                payee == account || payer.as_ref() == Some(account)
            }
            LedgerEvent::PayerBound { payer, .. } => payer == account,
            LedgerEvent::EscrowCompleted { payee, .. } => payee == account,
            LedgerEvent::EscrowCancelled { refunded_to, .. } => refunded_to.as_ref() == Some(account),
            LedgerEvent::Paused { .. }
            | LedgerEvent::Unpaused { .. }
            | LedgerEvent::FeeUpdated { .. }
            | LedgerEvent::OperatorUpdated { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub event: LedgerEvent,
}

impl EventRecord {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub struct EventLog {
    records: RwLock<Vec<EventRecord>>,
    sender: broadcast::Sender<EventRecord>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl EventLog {
    pub fn new(broadcast_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            records: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Appends a record and returns its sequence number (starting at 1).
    pub async fn append(&self, event: LedgerEvent) -> u64 {
        let mut records = self.records.write().await;
        let seq = records.len() as u64 + 1;
        let record = EventRecord {
            seq,
            timestamp: Utc::now(),
            event,
        };
        records.push(record.clone());

        let event_type = record.event.event_type();
        match self.sender.send(record) {
            Ok(subscribers) => debug!(seq, event_type, subscribers, "📦 Event appended"),
            Err(_) => debug!(seq, event_type, "📦 Event appended, no live subscribers"),
        }
        seq
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// Records with `seq > after`, in order.
    pub async fn records_since(&self, after: u64) -> Vec<EventRecord> {
        let records = self.records.read().await;
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(records.len());
        records[start..].to_vec()
    }

    pub async fn records_for(&self, account: AccountId) -> Vec<EventRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|r| r.event.involves(&account))
            .cloned()
            .collect()
    }

    pub async fn latest_seq(&self) -> u64 {
        self.records.read().await.len() as u64
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}
