//! The check-in state machine: rate limit, tier gate, anomaly check, POI
//! lookup, method resolution, fraud scoring, atomic commit, settlement, streak.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zzik_core::cell::to_default_cell;
use zzik_core::geo::distance_meters;
use zzik_core::{
    CheckInMethod, CheckInRecord, Clock, Coordinate, EngineConfig, HistoryEntry, Poi,
    Subscription, Tier,
};
use zzik_guard::{
    Action, AnomalyDetector, AnomalyInput, FraudInput, LimitExceeded, RateLimiter, detect_fraud,
};
use zzik_store::{
    AnomalyLog, CheckInCommit, CheckInLedger, CounterStore, HistoryStore, NoopStreak, PoiStore,
    QrVerifier, SettlementLedger, StoreError, StreakEvent, StreakHook, StreakOutcome,
    SubscriptionChange, SubscriptionStore, TokenAward,
};

use crate::error::{CheckInError, Rejection};
use crate::settlement::SettlementService;

const TOKEN_EXPIRY_DAYS: i64 = 365;

/// Device-reported position as submitted by the client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationInput {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInRequest {
    /// Authenticated caller; taken as given.
    pub user_id: String,
    pub poi_id: String,
    pub location: LocationInput,
    #[serde(default)]
    pub qr_token: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub device_info: Option<serde_json::Value>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInResponse {
    pub success: bool,
    pub check_in_id: String,
    pub tokens_earned: u64,
    /// Points credited by campaign settlement, if the POI is funded.
    #[serde(default)]
    pub reward_points: Option<i64>,
    pub message: String,
    pub tier: Tier,
    pub method: CheckInMethod,
    /// `None` for unlimited tiers.
    #[serde(default)]
    pub check_ins_remaining: Option<u32>,
    pub fraud_score: f64,
    #[serde(default)]
    pub streak: Option<StreakOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInStats {
    pub total: u64,
    pub today: u64,
    pub this_month: u64,
    pub monthly_limit: Option<u32>,
    pub tier: Tier,
    pub remaining: Option<u32>,
}

/// Where the single-use QR mark is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrMarking {
    /// The ledger owns the QR table and marks the token inside the commit.
    InCommit,
    /// An external verifier owns the token; it is marked after the commit.
    AfterCommit,
}

/// Every collaborator the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub pois: Arc<dyn PoiStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub history: Arc<dyn HistoryStore>,
    pub ledger: Arc<dyn CheckInLedger>,
    pub settlement: Arc<dyn SettlementLedger>,
    pub anomaly_log: Arc<dyn AnomalyLog>,
    pub counters: Arc<dyn CounterStore>,
    pub qr: Arc<dyn QrVerifier>,
    pub qr_marking: QrMarking,
    pub streak: Arc<dyn StreakHook>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Wire a single store that implements every persistence seam, including
    /// QR validation. Streaks are disabled until [`Self::with_streak`].
    pub fn from_store<S>(
        store: Arc<S>,
        counters: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        S: PoiStore
            + SubscriptionStore
            + HistoryStore
            + CheckInLedger
            + SettlementLedger
            + AnomalyLog
            + QrVerifier
            + 'static,
    {
        Self {
            pois: store.clone(),
            subscriptions: store.clone(),
            history: store.clone(),
            ledger: store.clone(),
            settlement: store.clone(),
            anomaly_log: store.clone(),
            counters,
            qr: store,
            qr_marking: QrMarking::InCommit,
            streak: Arc::new(NoopStreak),
            clock,
        }
    }

    /// Use an external QR verifier, which then also owns the used mark.
    pub fn with_qr(mut self, qr: Arc<dyn QrVerifier>) -> Self {
        self.qr = qr;
        self.qr_marking = QrMarking::AfterCommit;
        self
    }

    pub fn with_streak(mut self, streak: Arc<dyn StreakHook>) -> Self {
        self.streak = streak;
        self
    }
}

/// How the location was established, with the numbers that led there.
struct Resolution {
    method: CheckInMethod,
    distance_m: f64,
    fraud_score: f64,
}

pub struct CheckInService {
    collab: Collaborators,
    config: EngineConfig,
    limiter: RateLimiter,
    anomalies: AnomalyDetector,
    settlement: SettlementService,
}

impl CheckInService {
    pub fn new(collab: Collaborators, config: EngineConfig) -> Self {
        let limiter = RateLimiter::new(collab.counters.clone(), collab.clock.clone());
        let anomalies = AnomalyDetector::new(
            collab.history.clone(),
            collab.anomaly_log.clone(),
            collab.clock.clone(),
            &config,
        );
        let settlement = SettlementService::new(collab.settlement.clone());
        Self {
            collab,
            config,
            limiter,
            anomalies,
            settlement,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.collab.clock
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn anomalies(&self) -> &AnomalyDetector {
        &self.anomalies
    }

    /// Run one check-in attempt to completion.
    ///
    /// Nothing is written before the commit; a rejection at any earlier stage
    /// leaves no trace beyond the rate-limit counters and the anomaly log.
    pub async fn check_in(&self, req: &CheckInRequest) -> Result<CheckInResponse, CheckInError> {
        let now = self.collab.clock.now();
        let current = validate_request(req, now)?;
        let user_id = req.user_id.as_str();

        debug!(user_id, stage = "rate_limit");
        self.limiter
            .check_many(user_id, Action::CheckIn, &self.config.rate_limits)
            .await
            .map_err(rate_limited)?;

        debug!(user_id, stage = "tier_gate");
        let (subscription, stored) = self.subscription(user_id).await?;
        gate_tier(&subscription)?;

        debug!(user_id, stage = "anomaly_check");
        let anomaly = self
            .anomalies
            .detect(&AnomalyInput {
                user_id,
                location: current.point(),
                poi_id: &req.poi_id,
                timestamp: now,
            })
            .await?;
        if anomaly.auto_block && self.anomalies.check_auto_block(user_id).await? {
            return Err(Rejection::AccountSuspended {
                anomalies: anomaly.anomalies,
            }
            .into());
        }
        if anomaly.suspicious {
            warn!(
                user_id,
                score = anomaly.score,
                anomalies = ?anomaly.anomalies,
                "suspicious check-in allowed"
            );
        }

        debug!(user_id, stage = "poi_lookup");
        let poi = self
            .collab
            .pois
            .find_poi(&req.poi_id)
            .await?
            .ok_or_else(|| Rejection::PoiNotFound {
                poi_id: req.poi_id.clone(),
            })?;

        debug!(user_id, stage = "method_resolution");
        let previous = self.collab.history.last_check_in(user_id).await?;
        let resolution = self
            .resolve(req, &current, &poi, previous.as_ref())
            .await?;

        debug!(user_id, stage = "commit", method = resolution.method.as_str());
        let tokens = match subscription.tier {
            Tier::Premium => self.config.premium_tokens_per_check_in,
            Tier::Free => 0,
        };
        let record = CheckInRecord {
            id: Uuid::new_v4().to_string(),
            user_id: req.user_id.clone(),
            poi_id: poi.id.clone(),
            location: current.point(),
            accuracy_m: current.accuracy_m,
            distance_m: round_meters(resolution.distance_m),
            fraud_score: resolution.fraud_score,
            verified: true,
            tokens_earned: tokens,
            method: resolution.method,
            tier: subscription.tier,
            cell: to_default_cell(current.point()).ok().map(|c| c.into_string()),
            qr_token: match self.collab.qr_marking {
                QrMarking::InCommit => req.qr_token.clone(),
                QrMarking::AfterCommit => None,
            },
            campaign_id: poi.campaign_id.clone(),
            points_earned: None,
            device_info: req.device_info.clone(),
            ip_address: req.ip_address.clone(),
            checked_at: now,
        };
        let commit = CheckInCommit {
            record,
            subscription: if stored {
                SubscriptionChange::Increment
            } else {
                SubscriptionChange::CreateFree {
                    limit: self.config.free_monthly_limit,
                    period_days: self.config.free_period_days,
                }
            },
            token_award: (tokens > 0).then(|| TokenAward {
                amount: tokens,
                description: format!("Check-in at {}", poi.name),
                expires_at: now + Duration::days(TOKEN_EXPIRY_DAYS),
            }),
        };
        let record = match self.collab.ledger.commit_check_in(commit).await {
            Ok(record) => record,
            Err(StoreError::Conflict(detail)) if req.qr_token.is_some() => {
                info!(user_id, detail = %detail, "qr code consumed concurrently");
                return Err(Rejection::InvalidQrCode {
                    reason: "QR code already used".into(),
                }
                .into());
            }
            Err(e) => {
                error!(user_id, poi_id = %poi.id, error = %e, "check-in commit failed");
                return Err(e.into());
            }
        };
        info!(
            user_id,
            check_in_id = %record.id,
            poi_id = %record.poi_id,
            method = record.method.as_str(),
            fraud_score = record.fraud_score,
            tokens,
            "check-in committed"
        );

        if let (QrMarking::AfterCommit, Some(token)) = (self.collab.qr_marking, &req.qr_token) {
            if let Err(e) = self.collab.qr.mark_used(token, user_id).await {
                error!(user_id, check_in_id = %record.id, error = %e, "failed to mark qr code used");
            }
        }

        let reward_points = if record.campaign_id.is_some() {
            debug!(user_id, stage = "settlement");
            match self.settlement.settle(&record.id).await {
                Ok(split) => split.map(|s| s.user_reward),
                Err(e) => {
                    error!(check_in_id = %record.id, error = %e, "settlement failed");
                    None
                }
            }
        } else {
            None
        };

        debug!(user_id, stage = "streak");
        let streak = match self
            .collab
            .streak
            .on_check_in(StreakEvent {
                user_id: req.user_id.clone(),
                check_in_id: record.id.clone(),
                check_in_time: record.checked_at,
            })
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(user_id, check_in_id = %record.id, error = %e, "streak update failed");
                None
            }
        };

        Ok(CheckInResponse {
            success: true,
            check_in_id: record.id,
            tokens_earned: tokens,
            reward_points,
            message: success_message(tokens),
            tier: subscription.tier,
            method: record.method,
            check_ins_remaining: subscription.remaining_after(1),
            fraud_score: record.fraud_score,
            streak,
        })
    }

    /// Stored subscription, or the implicit FREE one. The flag says which.
    async fn subscription(&self, user_id: &str) -> Result<(Subscription, bool), StoreError> {
        Ok(
            match self.collab.subscriptions.get_subscription(user_id).await? {
                Some(sub) => (sub, true),
                None => (
                    Subscription::implicit_free(self.config.free_monthly_limit),
                    false,
                ),
            },
        )
    }

    async fn resolve(
        &self,
        req: &CheckInRequest,
        current: &Coordinate,
        poi: &Poi,
        previous: Option<&HistoryEntry>,
    ) -> Result<Resolution, CheckInError> {
        let distance_m = distance_meters(current.point(), poi.point());
        let within = distance_m <= self.config.max_gps_distance_m;
        let fraud_input = FraudInput {
            current: *current,
            poi: poi.point(),
            poi_cell: poi.cell.as_deref(),
            previous,
        };

        let Some(token) = &req.qr_token else {
            if !within {
                return Err(Rejection::TooFar {
                    distance_m: round_meters(distance_m),
                    required_m: round_meters(self.config.max_gps_distance_m),
                }
                .into());
            }
            let fraud = detect_fraud(&fraud_input);
            if !fraud.passed {
                warn!(
                    user_id = %req.user_id,
                    poi_id = %poi.id,
                    score = fraud.score,
                    flags = ?fraud.flags.iter().map(|f| f.kind.as_str()).collect::<Vec<_>>(),
                    "fraud check failed"
                );
                return Err(Rejection::Fraud { score: fraud.score }.into());
            }
            return Ok(Resolution {
                method: CheckInMethod::Gps,
                distance_m,
                fraud_score: fraud.score,
            });
        };

        let validation = self.collab.qr.validate(token, &req.user_id).await?;
        if !validation.valid {
            return Err(Rejection::InvalidQrCode {
                reason: validation
                    .error
                    .unwrap_or_else(|| "QR code is invalid or already used".into()),
            }
            .into());
        }
        if validation.payload.is_none_or(|p| p.poi_id != poi.id) {
            return Err(Rejection::QrPoiMismatch.into());
        }

        if within {
            // The token is the trust anchor; the score is kept for review only.
            let fraud = detect_fraud(&fraud_input);
            if !fraud.passed {
                info!(
                    user_id = %req.user_id,
                    poi_id = %poi.id,
                    score = fraud.score,
                    "hybrid check-in over fraud threshold, accepted on qr"
                );
            }
            Ok(Resolution {
                method: CheckInMethod::Hybrid,
                distance_m,
                fraud_score: fraud.score,
            })
        } else {
            Ok(Resolution {
                method: CheckInMethod::QrCode,
                distance_m,
                fraud_score: 0.0,
            })
        }
    }

    pub async fn user_check_in_stats(&self, user_id: &str) -> Result<CheckInStats, StoreError> {
        let now = self.collab.clock.now();
        let history = &self.collab.history;
        let total = history.count_check_ins(user_id, None).await?;
        let today = history
            .count_check_ins(user_id, Some(start_of_day(now)))
            .await?;
        let this_month = history
            .count_check_ins(user_id, Some(start_of_month(now)))
            .await?;
        let (subscription, _) = self.subscription(user_id).await?;
        Ok(CheckInStats {
            total,
            today,
            this_month,
            monthly_limit: subscription.check_in_limit,
            tier: subscription.tier,
            remaining: subscription.remaining_after(0),
        })
    }

    pub async fn recent_check_ins(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckInRecord>, StoreError> {
        self.collab.history.list_check_ins(user_id, limit).await
    }
}

fn validate_request(req: &CheckInRequest, now: DateTime<Utc>) -> Result<Coordinate, CheckInError> {
    if req.user_id.trim().is_empty() {
        return Err(CheckInError::InvalidInput("user_id is required".into()));
    }
    if req.poi_id.trim().is_empty() {
        return Err(CheckInError::InvalidInput("poi_id is required".into()));
    }
    if req.qr_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(CheckInError::InvalidInput("qr_token must not be empty".into()));
    }
    let current = Coordinate {
        lat: req.location.lat,
        lng: req.location.lng,
        accuracy_m: req.location.accuracy,
        timestamp: now,
    };
    current.validate()?;
    Ok(current)
}

fn rate_limited(exceeded: LimitExceeded) -> Rejection {
    Rejection::RateLimitExceeded {
        limit: exceeded.name,
        reset_at: exceeded.decision.reset_at,
    }
}

fn gate_tier(sub: &Subscription) -> Result<(), Rejection> {
    if sub.tier.is_paid() {
        if !sub.status.allows_check_in() {
            return Err(Rejection::SubscriptionInactive { status: sub.status });
        }
        return Ok(());
    }
    match sub.check_in_limit {
        Some(limit) if sub.check_ins_this_month >= limit => Err(Rejection::TierLimitReached {
            limit,
            used: sub.check_ins_this_month,
        }),
        _ => Ok(()),
    }
}

fn round_meters(m: f64) -> u32 {
    m.round().clamp(0.0, f64::from(u32::MAX)) as u32
}

fn success_message(tokens: u64) -> String {
    if tokens > 0 {
        format!("Check-in successful! You earned {tokens} tokens.")
    } else {
        "Check-in successful!".into()
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use zzik_core::config::limits;
    use zzik_core::{
        Campaign, Distribution, GeoPoint, ManualClock, NamedLimit, RateLimitConfig,
        SubscriptionStatus,
    };
    use zzik_store::records::{QrCode, SponsorWallet};
    use zzik_store::{MemoryCounterStore, MemoryStore, QrPayload, QrValidation};

    const POI_LAT: f64 = 37.5665;
    const POI_LNG: f64 = 126.978;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        service: CheckInService,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).single().unwrap()
    }

    fn poi(id: &str) -> Poi {
        Poi {
            id: id.into(),
            name: "City Hall".into(),
            lat: POI_LAT,
            lng: POI_LNG,
            cell: None,
            campaign_id: None,
        }
    }

    fn harness_with(config: EngineConfig, wire: impl FnOnce(Collaborators) -> Collaborators) -> Harness {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        store.insert_poi(poi("poi-1"));
        let counters = Arc::new(MemoryCounterStore::new(clock.clone()));
        let collab = wire(Collaborators::from_store(store.clone(), counters, clock.clone()));
        Harness {
            clock,
            store,
            service: CheckInService::new(collab, config),
        }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default(), |c| c)
    }

    fn request(user: &str, lat: f64, lng: f64) -> CheckInRequest {
        CheckInRequest {
            user_id: user.into(),
            poi_id: "poi-1".into(),
            location: LocationInput {
                lat,
                lng,
                accuracy: 10.0,
            },
            qr_token: None,
            idempotency_key: None,
            device_info: None,
            ip_address: None,
        }
    }

    fn at_poi(user: &str) -> CheckInRequest {
        request(user, POI_LAT + 0.00001, POI_LNG)
    }

    fn premium() -> Subscription {
        Subscription {
            tier: Tier::Premium,
            status: SubscriptionStatus::Active,
            check_ins_this_month: 0,
            check_in_limit: None,
        }
    }

    fn past(id: &str, poi_id: &str, lat: f64, at: DateTime<Utc>) -> CheckInRecord {
        CheckInRecord {
            id: id.into(),
            user_id: "u1".into(),
            poi_id: poi_id.into(),
            location: GeoPoint { lat, lng: POI_LNG },
            accuracy_m: 10.0,
            distance_m: 0,
            fraud_score: 0.0,
            verified: true,
            tokens_earned: 0,
            method: CheckInMethod::Gps,
            tier: Tier::Premium,
            cell: None,
            qr_token: None,
            campaign_id: None,
            points_earned: None,
            device_info: None,
            ip_address: None,
            checked_at: at,
        }
    }

    fn rejection(err: CheckInError) -> Rejection {
        match err {
            CheckInError::Rejected(r) => r,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_free_check_in_creates_subscription() {
        let h = harness();
        let resp = h.service.check_in(&at_poi("u1")).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.tokens_earned, 0);
        assert_eq!(resp.tier, Tier::Free);
        assert_eq!(resp.method, CheckInMethod::Gps);
        assert_eq!(resp.check_ins_remaining, Some(2));

        let stored = h.store.stored_subscription("u1").unwrap();
        assert_eq!(stored.subscription.check_ins_this_month, 1);
        assert_eq!(h.store.poi_visits("poi-1"), 1);
        let record = h.store.check_in(&resp.check_in_id).unwrap();
        assert!(record.verified);
        assert!(record.cell.is_some());
        assert_eq!(record.distance_m, 1);
    }

    #[tokio::test]
    async fn premium_earns_tokens_with_one_year_expiry() {
        let h = harness();
        h.store.put_subscription("u1", premium(), 30);
        let resp = h.service.check_in(&at_poi("u1")).await.unwrap();
        assert_eq!(resp.tokens_earned, 100);
        assert_eq!(resp.check_ins_remaining, None);
        assert_eq!(h.store.token_balance("u1").unwrap().balance, 100);
        let txs = h.store.token_transactions();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, "EARN_CHECKIN");
        assert_eq!(txs[0].expires_at, Some(start() + Duration::days(365)));
        assert_eq!(h.store.user("u1").unwrap().points, 100);
    }

    #[tokio::test]
    async fn fourth_free_check_in_is_tier_limited() {
        let h = harness();
        for i in 0..3 {
            h.service.check_in(&at_poi("u1")).await.unwrap();
            // Stay clear of the duplicate-POI and rapid-sequence checks.
            h.clock.advance(Duration::hours(2 + i));
        }
        let err = h.service.check_in(&at_poi("u1")).await.unwrap_err();
        assert_eq!(
            rejection(err),
            Rejection::TierLimitReached { limit: 3, used: 3 }
        );
        assert_eq!(h.store.check_in_total(), 3);
    }

    #[tokio::test]
    async fn free_allowance_returns_next_period() {
        let h = harness();
        for i in 0..3 {
            h.service.check_in(&at_poi("u1")).await.unwrap();
            h.clock.advance(Duration::hours(2 + i));
        }
        assert_eq!(
            h.service.check_in(&at_poi("u1")).await.unwrap_err().code(),
            "tier_limit_reached"
        );

        h.clock.advance(Duration::days(40));
        let resp = h.service.check_in(&at_poi("u1")).await.unwrap();
        assert_eq!(resp.check_ins_remaining, Some(2));
        let stored = h.store.stored_subscription("u1").unwrap();
        assert_eq!(stored.subscription.check_ins_this_month, 1);
    }

    #[tokio::test]
    async fn lapsed_paid_subscription_is_rejected() {
        let h = harness();
        let mut sub = premium();
        sub.status = SubscriptionStatus::PastDue;
        h.store.put_subscription("u1", sub, 30);
        let err = h.service.check_in(&at_poi("u1")).await.unwrap_err();
        assert_eq!(err.code(), "subscription_inactive");
        assert_eq!(err.to_body().message, "Payment required to continue");
    }

    #[tokio::test]
    async fn too_far_reports_rounded_distance() {
        let h = harness();
        // ~111m north of the POI.
        let err = h
            .service
            .check_in(&request("u1", POI_LAT + 0.001, POI_LNG))
            .await
            .unwrap_err();
        match rejection(err) {
            Rejection::TooFar {
                distance_m,
                required_m,
            } => {
                assert!((110..=112).contains(&distance_m));
                assert_eq!(required_m, 50);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.store.check_in_total(), 0);
    }

    #[tokio::test]
    async fn poor_accuracy_fails_fraud_check() {
        let h = harness();
        let mut req = at_poi("u1");
        req.location.accuracy = 500.0;
        let err = h.service.check_in(&req).await.unwrap_err();
        assert_eq!(err.code(), "fraud");
        assert_eq!(h.store.check_in_total(), 0);
        assert!(h.store.stored_subscription("u1").is_none());
    }

    #[tokio::test]
    async fn unknown_poi() {
        let h = harness();
        let mut req = at_poi("u1");
        req.poi_id = "nowhere".into();
        let err = h.service.check_in(&req).await.unwrap_err();
        assert_eq!(err.code(), "poi_not_found");
    }

    #[tokio::test]
    async fn invalid_coordinates_are_input_errors() {
        let h = harness();
        let err = h.service.check_in(&request("u1", 91.0, 0.0)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        let err = h.service.check_in(&request("", POI_LAT, POI_LNG)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn eleventh_hourly_attempt_is_rate_limited() {
        let mut config = EngineConfig::default();
        config.rate_limits = vec![NamedLimit::new("hourly", RateLimitConfig::new(10, 3_600))];
        let h = harness_with(config, |c| c);
        let mut req = at_poi("u1");
        req.poi_id = "nowhere".into();
        for _ in 0..10 {
            let err = h.service.check_in(&req).await.unwrap_err();
            assert_eq!(err.code(), "poi_not_found");
        }
        let err = h.service.check_in(&req).await.unwrap_err();
        assert_eq!(err.http_status(), 429);
        match rejection(err) {
            Rejection::RateLimitExceeded { limit, reset_at } => {
                assert_eq!(limit, "hourly");
                assert_eq!(reset_at, start() + Duration::hours(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn qr_far_from_poi_is_qr_code_method() {
        let h = harness();
        h.store.insert_qr_code(QrCode::new("qr-1", "poi-1", "m1"));
        let mut req = request("u1", POI_LAT + 0.01, POI_LNG);
        req.qr_token = Some("qr-1".into());
        let resp = h.service.check_in(&req).await.unwrap();
        assert_eq!(resp.method, CheckInMethod::QrCode);
        assert_eq!(resp.fraud_score, 0.0);
        let qr = h.store.qr_code("qr-1").unwrap();
        assert!(qr.used);
        assert_eq!(qr.used_by.as_deref(), Some("u1"));

        // Single use.
        h.clock.advance(Duration::hours(2));
        let mut again = at_poi("u2");
        again.qr_token = Some("qr-1".into());
        let err = h.service.check_in(&again).await.unwrap_err();
        assert_eq!(err.code(), "invalid_qr_code");
        assert_eq!(err.to_body().message, "QR code already used");
    }

    #[tokio::test]
    async fn qr_near_poi_is_hybrid_and_fraud_is_advisory() {
        let h = harness();
        h.store.insert_qr_code(QrCode::new("qr-1", "poi-1", "m1"));
        let mut req = at_poi("u1");
        req.qr_token = Some("qr-1".into());
        req.location.accuracy = 500.0;
        let resp = h.service.check_in(&req).await.unwrap();
        assert_eq!(resp.method, CheckInMethod::Hybrid);
        assert!(resp.fraud_score >= 0.5);
        let record = h.store.check_in(&resp.check_in_id).unwrap();
        assert_eq!(record.fraud_score, resp.fraud_score);
    }

    #[tokio::test]
    async fn qr_for_another_poi_is_mismatch() {
        let h = harness();
        h.store.insert_poi(poi("poi-2"));
        h.store.insert_qr_code(QrCode::new("qr-2", "poi-2", "m1"));
        let mut req = at_poi("u1");
        req.qr_token = Some("qr-2".into());
        let err = h.service.check_in(&req).await.unwrap_err();
        assert_eq!(rejection(err), Rejection::QrPoiMismatch);
        assert!(!h.store.qr_code("qr-2").unwrap().used);
    }

    #[tokio::test]
    async fn unknown_qr_is_invalid() {
        let h = harness();
        let mut req = at_poi("u1");
        req.qr_token = Some("forged".into());
        let err = h.service.check_in(&req).await.unwrap_err();
        assert_eq!(
            rejection(err),
            Rejection::InvalidQrCode {
                reason: "QR code not found".into()
            }
        );
    }

    #[tokio::test]
    async fn teleport_after_previous_check_in_is_fraud() {
        let h = harness();
        h.store.insert_poi(poi("poi-2"));
        h.store.put_subscription("u1", premium(), 30);
        // Previous check-in 12km away, one minute ago.
        h.store.insert_history(past(
            "prev",
            "poi-2",
            POI_LAT + 0.108,
            start() - Duration::seconds(60),
        ));
        let err = h.service.check_in(&at_poi("u1")).await.unwrap_err();
        assert_eq!(err.code(), "fraud");
        assert_eq!(h.store.check_in_total(), 1);
    }

    #[tokio::test]
    async fn repeated_auto_blocks_suspend_account() {
        let mut config = EngineConfig::default();
        config.rate_limits = vec![NamedLimit::new("hourly", limits::API_HOURLY)];
        let h = harness_with(config, |c| c);
        h.store.put_subscription("u1", premium(), 30);
        // Ten check-ins inside the last hour make every new attempt auto-block.
        for i in 0..10 {
            h.store.insert_history(past(
                &format!("h{i}"),
                "poi-1",
                POI_LAT,
                start() - Duration::minutes(50 - i),
            ));
        }
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(h.service.check_in(&at_poi("u1")).await);
        }
        let last = outcomes.pop().unwrap().unwrap_err();
        assert_eq!(last.code(), "account_suspended");
        assert_eq!(last.http_status(), 403);
        assert!(h.store.user("u1").unwrap().suspended.is_some());
    }

    #[tokio::test]
    async fn campaign_funded_check_in_is_settled() {
        let h = harness();
        let mut funded = poi("poi-c");
        funded.campaign_id = Some("camp".into());
        h.store.insert_poi(funded);
        h.store.insert_wallet(SponsorWallet {
            id: "w1".into(),
            balance: 10_000,
        });
        h.store.insert_campaign(Campaign {
            id: "camp".into(),
            sponsor_wallet_id: Some("w1".into()),
            cpcv_amount: 700,
            distribution: Distribution::default(),
            budget_total: None,
            budget_spent: 0,
            total_check_ins: 0,
        });
        let mut req = at_poi("u1");
        req.poi_id = "poi-c".into();
        let resp = h.service.check_in(&req).await.unwrap();
        assert_eq!(resp.reward_points, Some(490));
        assert_eq!(h.store.wallet("w1").unwrap().balance, 9_300);
        let record = h.store.check_in(&resp.check_in_id).unwrap();
        assert_eq!(record.campaign_id.as_deref(), Some("camp"));
        assert_eq!(record.points_earned, Some(490));
    }

    struct ExternalQr;

    #[async_trait]
    impl QrVerifier for ExternalQr {
        async fn validate(&self, token: &str, _user_id: &str) -> Result<QrValidation, StoreError> {
            Ok(if token == "ext-1" {
                QrValidation::ok(QrPayload {
                    poi_id: "poi-1".into(),
                    merchant_id: "m1".into(),
                })
            } else {
                QrValidation::invalid("unknown token")
            })
        }

        async fn mark_used(&self, _token: &str, _user_id: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("qr service down".into()))
        }
    }

    struct FailingStreak;

    #[async_trait]
    impl StreakHook for FailingStreak {
        async fn on_check_in(&self, _event: StreakEvent) -> Result<StreakOutcome, StoreError> {
            Err(StoreError::Unavailable("streak service down".into()))
        }
    }

    #[tokio::test]
    async fn external_qr_and_failed_hooks_keep_the_check_in() {
        let h = harness_with(EngineConfig::default(), |c| {
            c.with_qr(Arc::new(ExternalQr))
                .with_streak(Arc::new(FailingStreak))
        });
        let mut req = request("u1", POI_LAT + 0.01, POI_LNG);
        req.qr_token = Some("ext-1".into());
        let resp = h.service.check_in(&req).await.unwrap();
        assert_eq!(resp.method, CheckInMethod::QrCode);
        assert!(resp.streak.is_none());
        let record = h.store.check_in(&resp.check_in_id).unwrap();
        assert!(record.qr_token.is_none());
    }

    #[tokio::test]
    async fn stats_count_day_and_month() {
        let h = harness();
        h.store.put_subscription("u1", premium(), 30);
        h.service.check_in(&at_poi("u1")).await.unwrap();
        h.clock.advance(Duration::hours(2));
        h.service.check_in(&at_poi("u1")).await.unwrap();
        h.clock.advance(Duration::days(1));
        h.service.check_in(&at_poi("u1")).await.unwrap();

        let stats = h.service.user_check_in_stats("u1").await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.today, 1);
        assert_eq!(stats.this_month, 3);
        assert_eq!(stats.tier, Tier::Premium);
        assert_eq!(stats.remaining, None);

        let recent = h.service.recent_check_ins("u1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].checked_at > recent[1].checked_at);
    }

    #[test]
    fn response_serializes_method_and_tier() {
        let resp = CheckInResponse {
            success: true,
            check_in_id: "c1".into(),
            tokens_earned: 100,
            reward_points: None,
            message: success_message(100),
            tier: Tier::Premium,
            method: CheckInMethod::Hybrid,
            check_ins_remaining: None,
            fraud_score: 0.1,
            streak: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["method"], "HYBRID");
        assert_eq!(json["tier"], "PREMIUM");
        assert_eq!(json["message"], "Check-in successful! You earned 100 tokens.");
    }
}
