//! Scenario replay: seed a store from JSON and push a scripted sequence of
//! check-in requests through the idempotent boundary on a manual clock.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use zzik_checkin::{
    CheckInRequest, CheckInResponse, CheckInService, Collaborators, ErrorBody, IdempotentCheckIn,
};
use zzik_core::{Campaign, CheckInRecord, Clock, EngineConfig, ManualClock, Poi, Subscription};
use zzik_store::records::{QrCode, SponsorWallet};
use zzik_store::{
    AnomalyLog, CheckInLedger, HistoryStore, MemoryCache, MemoryCounterStore, MemoryStore,
    PoiStore, QrVerifier, SettlementLedger, StreakHook, SubscriptionStore,
};

#[derive(Debug, Clone, Deserialize)]
pub struct SeedSubscription {
    pub user_id: String,
    #[serde(flatten)]
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedQrCode {
    pub token: String,
    pub poi_id: String,
    pub merchant_id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SeedQrCode {
    fn to_qr_code(&self) -> QrCode {
        let mut qr = QrCode::new(&self.token, &self.poi_id, &self.merchant_id);
        qr.expires_at = self.expires_at;
        qr
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    /// Seconds to move the clock forward before this request.
    #[serde(default)]
    pub advance_secs: i64,
    pub request: CheckInRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default = "Utc::now")]
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub pois: Vec<Poi>,
    #[serde(default)]
    pub subscriptions: Vec<SeedSubscription>,
    #[serde(default)]
    pub qr_codes: Vec<SeedQrCode>,
    #[serde(default)]
    pub wallets: Vec<SponsorWallet>,
    #[serde(default)]
    pub campaigns: Vec<Campaign>,
    #[serde(default)]
    pub history: Vec<CheckInRecord>,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing scenario {}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub step: usize,
    pub at: DateTime<Utc>,
    pub user_id: String,
    pub poi_id: String,
    pub result: Result<CheckInResponse, ErrorBody>,
}

/// Stores the replay can seed.
pub trait Seed {
    fn seed(&self, scenario: &Scenario, period_days: i64) -> anyhow::Result<()>;
}

impl Seed for MemoryStore {
    fn seed(&self, scenario: &Scenario, period_days: i64) -> anyhow::Result<()> {
        for poi in &scenario.pois {
            self.insert_poi(poi.clone());
        }
        for s in &scenario.subscriptions {
            self.put_subscription(&s.user_id, s.subscription.clone(), period_days);
        }
        for qr in &scenario.qr_codes {
            self.insert_qr_code(qr.to_qr_code());
        }
        for wallet in &scenario.wallets {
            self.insert_wallet(wallet.clone());
        }
        for campaign in &scenario.campaigns {
            self.insert_campaign(campaign.clone());
        }
        for record in &scenario.history {
            self.insert_history(record.clone());
        }
        Ok(())
    }
}

#[cfg(feature = "duckdb")]
impl Seed for zzik_store::DuckStore {
    fn seed(&self, scenario: &Scenario, period_days: i64) -> anyhow::Result<()> {
        for poi in &scenario.pois {
            self.insert_poi(poi)?;
        }
        for s in &scenario.subscriptions {
            self.put_subscription(&s.user_id, &s.subscription, period_days)?;
        }
        for qr in &scenario.qr_codes {
            self.insert_qr_code(&qr.to_qr_code())?;
        }
        for wallet in &scenario.wallets {
            self.insert_wallet(wallet)?;
        }
        for campaign in &scenario.campaigns {
            self.insert_campaign(campaign)?;
        }
        for record in &scenario.history {
            self.insert_history(record)?;
        }
        Ok(())
    }
}

/// Optional remote collaborators replacing the store-backed ones.
#[derive(Default)]
pub struct Remotes {
    pub qr: Option<Arc<dyn QrVerifier>>,
    pub streak: Option<Arc<dyn StreakHook>>,
}

/// Seed `store` and replay every step. Rejections are outcomes, not errors.
pub async fn replay<S>(
    store: Arc<S>,
    clock: Arc<ManualClock>,
    scenario: &Scenario,
    config: EngineConfig,
    remotes: Remotes,
) -> anyhow::Result<Vec<Outcome>>
where
    S: Seed
        + PoiStore
        + SubscriptionStore
        + HistoryStore
        + CheckInLedger
        + SettlementLedger
        + AnomalyLog
        + QrVerifier
        + 'static,
{
    store
        .seed(scenario, config.free_period_days)
        .context("seeding store")?;

    let counters = Arc::new(MemoryCounterStore::new(clock.clone()));
    let mut collab = Collaborators::from_store(store, counters, clock.clone());
    if let Some(qr) = remotes.qr {
        collab = collab.with_qr(qr);
    }
    if let Some(streak) = remotes.streak {
        collab = collab.with_streak(streak);
    }
    let service = Arc::new(CheckInService::new(collab, config));
    let boundary = IdempotentCheckIn::new(service, Arc::new(MemoryCache::new(clock.clone())));

    let mut outcomes = Vec::with_capacity(scenario.steps.len());
    for (i, step) in scenario.steps.iter().enumerate() {
        let advance = Duration::try_seconds(step.advance_secs)
            .filter(|d| clock.now().checked_add_signed(*d).is_some())
            .with_context(|| format!("step {}: advance_secs out of range", i + 1))?;
        clock.advance(advance);
        let result = match boundary.submit(&step.request).await {
            Ok(resp) => Ok(resp),
            Err(e) if e.rejection().is_some() || e.code() == "INVALID_INPUT" => Err(e.to_body()),
            Err(e) => return Err(e).with_context(|| format!("step {} failed", i + 1)),
        };
        outcomes.push(Outcome {
            step: i + 1,
            at: clock.now(),
            user_id: step.request.user_id.clone(),
            poi_id: step.request.poi_id.clone(),
            result,
        });
    }
    info!(steps = outcomes.len(), "scenario replayed");
    Ok(outcomes)
}

/// Replay against a fresh in-memory store.
pub async fn replay_in_memory(
    scenario: &Scenario,
    config: EngineConfig,
    remotes: Remotes,
) -> anyhow::Result<Vec<Outcome>> {
    let clock = Arc::new(ManualClock::new(scenario.start));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    replay(store, clock, scenario, config, remotes).await
}

#[cfg(feature = "duckdb")]
pub async fn replay_duckdb(
    path: &Path,
    scenario: &Scenario,
    config: EngineConfig,
    remotes: Remotes,
) -> anyhow::Result<Vec<Outcome>> {
    let clock = Arc::new(ManualClock::new(scenario.start));
    let store = Arc::new(
        zzik_store::DuckStore::open_persistent(path, clock.clone())
            .with_context(|| format!("opening {}", path.display()))?,
    );
    replay(store, clock, scenario, config, remotes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "start": "2025-03-14T12:00:00Z",
        "pois": [
            { "id": "poi-1", "name": "City Hall", "lat": 37.5665, "lng": 126.978 }
        ],
        "subscriptions": [
            { "user_id": "vip", "tier": "PREMIUM", "status": "ACTIVE",
              "check_ins_this_month": 0, "check_in_limit": null }
        ],
        "qr_codes": [
            { "token": "qr-1", "poi_id": "poi-1", "merchant_id": "m1" }
        ],
        "steps": [
            { "request": { "user_id": "vip", "poi_id": "poi-1",
                           "location": { "lat": 37.5665, "lng": 126.978, "accuracy": 5 },
                           "idempotency_key": "a" } },
            { "advance_secs": 30,
              "request": { "user_id": "vip", "poi_id": "poi-1",
                           "location": { "lat": 37.5665, "lng": 126.978, "accuracy": 5 },
                           "idempotency_key": "a" } },
            { "advance_secs": 60,
              "request": { "user_id": "free", "poi_id": "poi-1",
                           "location": { "lat": 37.60, "lng": 126.978, "accuracy": 5 } } },
            { "advance_secs": 60,
              "request": { "user_id": "free", "poi_id": "poi-1",
                           "location": { "lat": 37.60, "lng": 126.978, "accuracy": 5 },
                           "qr_token": "qr-1" } }
        ]
    }"#;

    #[tokio::test]
    async fn replays_scripted_requests() {
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        let outcomes = replay_in_memory(&scenario, EngineConfig::default(), Remotes::default())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 4);

        let first = outcomes[0].result.as_ref().unwrap();
        assert_eq!(first.tokens_earned, 100);
        let replayed = outcomes[1].result.as_ref().unwrap();
        assert_eq!(replayed.check_in_id, first.check_in_id);

        let too_far = outcomes[2].result.as_ref().unwrap_err();
        assert_eq!(too_far.code, "too_far");

        let via_qr = outcomes[3].result.as_ref().unwrap();
        assert_eq!(via_qr.method, zzik_core::CheckInMethod::QrCode);
        assert_eq!(outcomes[3].at, scenario.start + Duration::seconds(150));
    }

    #[tokio::test]
    async fn out_of_range_advance_is_an_error() {
        let mut scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        scenario.steps[1].advance_secs = i64::MAX;
        let err = replay_in_memory(&scenario, EngineConfig::default(), Remotes::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("step 2"));
    }

    #[test]
    fn scenario_file_errors_carry_path() {
        let err = Scenario::from_file(Path::new("/nonexistent/scenario.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/scenario.json"));
    }

    #[cfg(feature = "duckdb")]
    #[tokio::test]
    async fn replays_against_duckdb() {
        let dir = tempfile::tempdir().unwrap();
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        let outcomes = replay_duckdb(
            &dir.path().join("zzik.duckdb"),
            &scenario,
            EngineConfig::default(),
            Remotes::default(),
        )
        .await
        .unwrap();
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[3].result.is_ok());
    }
}
