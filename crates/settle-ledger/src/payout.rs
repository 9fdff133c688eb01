use crate::types::{AccountId, Amount};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutKind {
    Withdrawal,
    Emergency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub account: AccountId,
    pub amount: Amount,
    pub kind: PayoutKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub reference: String,
    pub delivered_at: DateTime<Utc>,
}

/// External rail (bank, chain) that moves withdrawn value out of the ledger.
///
/// Called strictly after the ledger has committed the debit and released
/// all of its locks. Implementations may call back into the engine.
#[async_trait]
pub trait PayoutChannel: Send + Sync {
    async fn deliver(&self, request: PayoutRequest) -> Result<PayoutReceipt>;
}

/// In-process channel that records every delivery.
#[derive(Default)]
pub struct MemoryPayoutChannel {
    delivered: RwLock<Vec<PayoutRequest>>,
    failing: AtomicBool,
}

impl MemoryPayoutChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every delivery is rejected.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn delivered(&self) -> Vec<PayoutRequest> {
        self.delivered.read().await.clone()
    }

    pub async fn total_delivered(&self) -> u128 {
        self.delivered
            .read()
            .await
            .iter()
            .map(|r| r.amount.units() as u128)
            .sum()
    }
}

#[async_trait]
impl PayoutChannel for MemoryPayoutChannel {
    async fn deliver(&self, request: PayoutRequest) -> Result<PayoutReceipt> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("payout rail unavailable");
        }
        let mut delivered = self.delivered.write().await;
        delivered.push(request.clone());
        let reference = format!("mem-{}", delivered.len());
        info!(
            account = %request.account,
            amount = request.amount.units(),
            kind = ?request.kind,
            reference = %reference,
            "🏦 Payout delivered"
        );
        Ok(PayoutReceipt {
            reference,
            delivered_at: Utc::now(),
        })
    }
}
