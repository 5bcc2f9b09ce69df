//! Persistence and collaborator seams used by the check-in pipeline.
//!
//! The guard and check-in crates depend only on these traits. Writes to
//! check-ins, balances, and counters go exclusively through
//! [`CheckInLedger::commit_check_in`] and [`SettlementLedger::settle_check_in`],
//! each of which is one atomic unit of work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zzik_core::{Campaign, CheckInRecord, HistoryEntry, Poi, Subscription};

use crate::StoreError;

// ── Read-side collaborators ──

#[async_trait]
pub trait PoiStore: Send + Sync {
    async fn find_poi(&self, poi_id: &str) -> Result<Option<Poi>, StoreError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Stored subscription, or `None` for a user who never subscribed.
    async fn get_subscription(&self, user_id: &str) -> Result<Option<Subscription>, StoreError>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Up to `limit` check-ins at or after `since`, newest first.
    async fn recent_check_ins(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    /// The user's most recent check-in, if any.
    async fn last_check_in(&self, user_id: &str) -> Result<Option<HistoryEntry>, StoreError>;

    /// Count of check-ins, optionally restricted to those at or after `since`.
    async fn count_check_ins(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError>;

    /// Full records, newest first.
    async fn list_check_ins(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckInRecord>, StoreError>;
}

// ── Check-in commit ──

/// How the user's subscription counter changes on commit.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionChange {
    /// Bump `check_ins_this_month` on the stored subscription.
    Increment,
    /// No stored subscription: create a FREE one with this check-in counted.
    CreateFree { limit: u32, period_days: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenAward {
    pub amount: u64,
    pub description: String,
    pub expires_at: DateTime<Utc>,
}

/// Everything one accepted check-in writes, applied all-or-nothing.
///
/// Effects: insert `record`; apply `subscription`; user `total_check_ins += 1`,
/// `points += record.tokens_earned`, `last_check_in_at`; POI `visit_count += 1`;
/// credit `token_award` to the token balance with an `EARN_CHECKIN`
/// transaction; mark `record.qr_token` used. A QR token that is already used
/// fails the whole unit with [`StoreError::Conflict`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckInCommit {
    pub record: CheckInRecord,
    pub subscription: SubscriptionChange,
    pub token_award: Option<TokenAward>,
}

#[async_trait]
pub trait CheckInLedger: Send + Sync {
    async fn commit_check_in(&self, commit: CheckInCommit) -> Result<CheckInRecord, StoreError>;
}

// ── Settlement ──

/// Integer shares of one CPCV payout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementSplit {
    pub user_reward: i64,
    pub platform_fee: i64,
    pub network_fee: i64,
}

impl SettlementSplit {
    pub fn total(&self) -> i64 {
        self.user_reward + self.platform_fee + self.network_fee
    }
}

/// Computes the split from the campaign as read inside the transaction.
pub type SplitFn<'a> = &'a (dyn Fn(&Campaign) -> SettlementSplit + Send + Sync);

#[async_trait]
pub trait SettlementLedger: Send + Sync {
    /// Settle a check-in against its campaign under serializable isolation.
    ///
    /// Debits the sponsor wallet by the CPCV amount, credits the user's
    /// points, writes `SPEND` / `PLATFORM_FEE` / `NETWORK_POOL` credit
    /// transactions, stores the user reward on the check-in, and bumps the
    /// campaign spend counters. Returns `None` when the check-in is not
    /// campaign-funded, has no sponsor wallet, or the budget is exhausted.
    /// Settling twice returns the stored split without debiting again.
    async fn settle_check_in(
        &self,
        check_in_id: &str,
        split: SplitFn<'_>,
    ) -> Result<Option<SettlementSplit>, StoreError>;
}

// ── Anomaly audit log ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub user_id: String,
    pub anomalies: Vec<String>,
    pub score: f64,
    pub auto_block: bool,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait AnomalyLog: Send + Sync {
    async fn record_anomaly(&self, report: AnomalyReport) -> Result<(), StoreError>;

    async fn count_auto_blocks(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    async fn reports_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AnomalyReport>, StoreError>;

    async fn suspend_user(&self, user_id: &str, reason: &str) -> Result<(), StoreError>;
}

// ── External services ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    pub poi_id: String,
    pub merchant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrValidation {
    pub valid: bool,
    pub payload: Option<QrPayload>,
    pub error: Option<String>,
}

impl QrValidation {
    pub fn ok(payload: QrPayload) -> Self {
        Self {
            valid: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// Single-use QR token validation. Token cryptography lives behind this trait.
#[async_trait]
pub trait QrVerifier: Send + Sync {
    async fn validate(&self, token: &str, user_id: &str) -> Result<QrValidation, StoreError>;

    async fn mark_used(&self, token: &str, user_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakEvent {
    pub user_id: String,
    pub check_in_id: String,
    pub check_in_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakOutcome {
    pub streak_updated: bool,
    pub current_streak: u32,
    pub bonus_tokens: u64,
    pub milestone: Option<String>,
    pub message: String,
}

/// Post-commit gamification hook.
#[async_trait]
pub trait StreakHook: Send + Sync {
    async fn on_check_in(&self, event: StreakEvent) -> Result<StreakOutcome, StoreError>;
}

/// A streak hook for deployments without a streak service.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStreak;

#[async_trait]
impl StreakHook for NoopStreak {
    async fn on_check_in(&self, _event: StreakEvent) -> Result<StreakOutcome, StoreError> {
        Ok(StreakOutcome {
            message: "streak tracking disabled".into(),
            ..StreakOutcome::default()
        })
    }
}
