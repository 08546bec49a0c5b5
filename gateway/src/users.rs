//! Credit accounting interface.
//!
//! The streaming core touches the user subsystem in exactly one place: a
//! debit right before a stream link is composed, and a compensating refund
//! when the reply carrying that link fails to send. [`CreditService`] is
//! that seam; the rest of the user machinery (records, bans, referral
//! bookkeeping) lives outside this process.
//!
//! [`RedisCreditLedger`] is the in-process implementation: one integer
//! balance per user in Redis, initialized on first sight and clamped to
//! the configured ceiling. Every call runs under a fixed deadline so a
//! slow ledger cannot stall the bot loop.

use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;

use crate::cache::Cache;
use crate::config::CREDIT_CALL_TIMEOUT_SECS;

#[async_trait]
pub trait CreditService: Send + Sync {
    /// Current balance, creating the account at the initial balance if the
    /// user is new.
    async fn credits(&self, user_id: i64) -> anyhow::Result<i64>;
    /// Debit `amount` and return the new balance.
    async fn decrement_credits(&self, user_id: i64, amount: i64) -> anyhow::Result<i64>;
    /// Credit `amount`, clamped to the ceiling, and return the new balance.
    async fn increment_credits(&self, user_id: i64, amount: i64) -> anyhow::Result<i64>;
}

pub struct RedisCreditLedger {
    cache: Cache,
    initial: i64,
    max: i64,
}

impl RedisCreditLedger {
    pub fn new(cache: Cache, initial: i64, max: i64) -> Self {
        Self {
            cache,
            initial,
            max,
        }
    }

    fn key(user_id: i64) -> String {
        format!("credits:{user_id}")
    }

    async fn ensure_account(&self, user_id: i64) -> anyhow::Result<()> {
        self.cache
            .set_if_absent(&Self::key(user_id), &self.initial.to_string())
            .await
    }

    async fn adjust(&self, user_id: i64, delta: i64) -> anyhow::Result<i64> {
        let key = Self::key(user_id);
        self.ensure_account(user_id).await?;
        let balance = self.cache.incr_by(&key, delta).await?;
        if balance > self.max {
            self.cache.set_persistent(&key, &self.max.to_string()).await?;
            return Ok(self.max);
        }
        Ok(balance)
    }
}

async fn with_deadline<T>(
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::time::timeout(Duration::from_secs(CREDIT_CALL_TIMEOUT_SECS), fut)
        .await
        .map_err(|_| anyhow!("credit service call timed out"))?
}

#[async_trait]
impl CreditService for RedisCreditLedger {
    async fn credits(&self, user_id: i64) -> anyhow::Result<i64> {
        with_deadline(async {
            self.ensure_account(user_id).await?;
            self.cache
                .get(&Self::key(user_id))
                .await
                .context("credit balance missing after init")?
                .parse::<i64>()
                .context("credit balance is not an integer")
        })
        .await
    }

    async fn decrement_credits(&self, user_id: i64, amount: i64) -> anyhow::Result<i64> {
        with_deadline(self.adjust(user_id, -amount)).await
    }

    async fn increment_credits(&self, user_id: i64, amount: i64) -> anyhow::Result<i64> {
        with_deadline(self.adjust(user_id, amount)).await
    }
}
