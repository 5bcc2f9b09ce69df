//! Row types owned by the stores beyond the shared domain types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zzik_core::Subscription;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub total_check_ins: u64,
    pub points: i64,
    pub last_check_in_at: Option<DateTime<Utc>>,
    /// Suspension reason, if suspended.
    pub suspended: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSubscription {
    pub subscription: Subscription,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl StoredSubscription {
    pub fn new(subscription: Subscription, start: DateTime<Utc>, period_days: i64) -> Self {
        Self {
            subscription,
            period_start: start,
            period_end: period_end(start, period_days),
        }
    }

    /// Move to the period containing `now` and zero the usage counter if the
    /// current period has ended. Returns whether a rollover happened.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        let Some((start, end)) = next_period(self.period_start, self.period_end, now) else {
            return false;
        };
        self.period_start = start;
        self.period_end = end;
        self.subscription.check_ins_this_month = 0;
        true
    }
}

/// End of a period of `days` starting at `start`, saturating.
pub fn period_end(start: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    Duration::try_days(days)
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The period containing `now` once `now` has reached `end`. Later periods
/// keep the original length and stay aligned to the original boundaries.
pub fn next_period(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    if now < end {
        return None;
    }
    let len = (end - start).num_milliseconds().max(1);
    let skipped = (now - end).num_milliseconds() / len;
    let aligned = skipped
        .checked_mul(len)
        .and_then(|offset| end.timestamp_millis().checked_add(offset))
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(now);
    let next_end = aligned
        .timestamp_millis()
        .checked_add(len)
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Some((aligned, next_end))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrCode {
    pub token: String,
    pub poi_id: String,
    pub merchant_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub used: bool,
    pub used_by: Option<String>,
    pub used_at: Option<DateTime<Utc>>,
    pub scans_total: u64,
}

impl QrCode {
    pub fn new(token: &str, poi_id: &str, merchant_id: &str) -> Self {
        Self {
            token: token.to_string(),
            poi_id: poi_id.to_string(),
            merchant_id: merchant_id.to_string(),
            expires_at: None,
            used: false,
            used_by: None,
            used_at: None,
            scans_total: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub balance: u64,
    pub total_earned: u64,
    pub last_earned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub user_id: String,
    pub kind: String,
    pub amount: i64,
    pub check_in_id: Option<String>,
    pub description: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorWallet {
    pub id: String,
    pub balance: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditKind {
    Spend,
    PlatformFee,
    NetworkPool,
}

impl CreditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spend => "SPEND",
            Self::PlatformFee => "PLATFORM_FEE",
            Self::NetworkPool => "NETWORK_POOL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub wallet_id: String,
    pub kind: CreditKind,
    pub amount: i64,
    pub campaign_id: String,
    pub check_in_id: String,
}
