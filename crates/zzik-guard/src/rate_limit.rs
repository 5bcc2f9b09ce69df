//! Fixed-window rate limiting on top of a shared atomic counter store.
//!
//! Counter failures fail open: the fraud and anomaly layers downstream remain
//! the primary defence, so an unreachable counter store never blocks users.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zzik_core::{Clock, NamedLimit, RateLimitConfig, after_secs};
use zzik_store::{CounterError, CounterStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[serde(rename = "checkin")]
    CheckIn,
    TokenRedeem,
    QrScan,
    ApiCall,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckIn => "checkin",
            Self::TokenRedeem => "token_redeem",
            Self::QrScan => "qr_scan",
            Self::ApiCall => "api_call",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub limit: u32,
}

/// The first named limit that rejected a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitExceeded {
    pub name: String,
    pub decision: RateLimitDecision,
}

pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

/// Counter key. The window is part of the key so hourly and daily limits on
/// the same action keep separate counters.
pub fn counter_key(user_id: &str, action: Action, config: &RateLimitConfig) -> String {
    format!(
        "rate_limit:{}:{}:{}",
        action.as_str(),
        config.window_secs,
        user_id
    )
}

impl RateLimiter {
    pub fn new(counters: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { counters, clock }
    }

    fn open_decision(&self, config: &RateLimitConfig) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            remaining: config.count,
            reset_at: after_secs(self.clock.now(), config.window_secs),
            limit: config.count,
        }
    }

    fn decide(config: &RateLimitConfig, count: u64, reset_at: DateTime<Utc>) -> RateLimitDecision {
        let used = u32::try_from(count).unwrap_or(u32::MAX);
        RateLimitDecision {
            allowed: count <= u64::from(config.count),
            remaining: config.count.saturating_sub(used),
            reset_at,
            limit: config.count,
        }
    }

    /// Count this request against the limit and decide.
    pub async fn check_limit(
        &self,
        user_id: &str,
        action: Action,
        config: &RateLimitConfig,
    ) -> RateLimitDecision {
        let key = counter_key(user_id, action, config);
        match self.counters.incr(&key, config.window_secs).await {
            Ok(hit) => {
                let decision = Self::decide(config, hit.count, hit.expires_at);
                if !decision.allowed {
                    info!(
                        user_id,
                        action = action.as_str(),
                        count = hit.count,
                        limit = config.count,
                        "rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                warn!(user_id, action = action.as_str(), error = %e, "counter store unavailable, failing open");
                self.open_decision(config)
            }
        }
    }

    /// Check each named limit in order, stopping at the first rejection.
    pub async fn check_many(
        &self,
        user_id: &str,
        action: Action,
        limits: &[NamedLimit],
    ) -> Result<(), LimitExceeded> {
        for limit in limits {
            let decision = self.check_limit(user_id, action, &limit.config).await;
            if !decision.allowed {
                return Err(LimitExceeded {
                    name: limit.name.clone(),
                    decision,
                });
            }
        }
        Ok(())
    }

    /// Current usage without counting a request.
    pub async fn status(
        &self,
        user_id: &str,
        action: Action,
        config: &RateLimitConfig,
    ) -> RateLimitDecision {
        let key = counter_key(user_id, action, config);
        match self.counters.get(&key).await {
            Ok(Some(hit)) => Self::decide(config, hit.count, hit.expires_at),
            Ok(None) => self.open_decision(config),
            Err(e) => {
                warn!(user_id, action = action.as_str(), error = %e, "counter store unavailable, failing open");
                self.open_decision(config)
            }
        }
    }

    /// Clear a user's counter for one action and window.
    pub async fn reset(
        &self,
        user_id: &str,
        action: Action,
        config: &RateLimitConfig,
    ) -> Result<(), CounterError> {
        self.counters
            .reset(&counter_key(user_id, action, config))
            .await
    }
}
