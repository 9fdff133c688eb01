use crate::types::{AccountId, Amount, EscrowId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid account: {0}")]
    InvalidAccount(String),

    #[error("Sender and recipient are the same account: {0}")]
    SelfTransferNotAllowed(AccountId),

    #[error("Insufficient balance for {account}: available {available}, required {required}")]
    InsufficientBalance {
        account: AccountId,
        available: Amount,
        required: Amount,
    },

    #[error("Balance overflow for {0}")]
    BalanceOverflow(AccountId),

    #[error("Ledger is paused")]
    Paused,

    #[error("Ledger is not paused")]
    NotPaused,

    #[error("Unauthorized caller {caller} for {action}")]
    Unauthorized {
        caller: AccountId,
        action: &'static str,
    },

    #[error("Fee rate {requested} bps exceeds maximum {max} bps")]
    FeeRateExceedsMaximum { requested: u16, max: u16 },

    #[error("Escrow not found: {0}")]
    EscrowNotFound(EscrowId),

    #[error("Invalid escrow state for {id}: {reason}")]
    InvalidEscrowState { id: EscrowId, reason: String },

    #[error("Payout of {amount} to {account} failed: {reason}")]
    PayoutDeliveryFailed {
        account: AccountId,
        amount: Amount,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// True when the ledger was left untouched by the failed call.
    ///
    /// `PayoutDeliveryFailed` is the only error raised after state has been
    /// committed.
    pub fn is_precondition(&self) -> bool {
        !matches!(self, LedgerError::PayoutDeliveryFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
