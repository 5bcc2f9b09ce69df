//! Behavioural anomaly detection over a user's recent check-in history.
//!
//! Where the fraud scorer judges one request, this looks at the rolling
//! window of prior check-ins for patterns no single request shows.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use zzik_core::geo::{centroid, distance_meters};
use zzik_core::{Clock, EngineConfig, GeoPoint, HistoryEntry, before_hours};
use zzik_store::{AnomalyLog, AnomalyReport, HistoryStore, StoreError};

pub const IMPOSSIBLE_TRAVEL_SPEED: &str = "impossible_travel_speed";
pub const RAPID_SEQUENTIAL_CHECKINS: &str = "rapid_sequential_checkins";
pub const DUPLICATE_POI_TOO_SOON: &str = "duplicate_poi_too_soon";
pub const EXCESSIVE_HOURLY_CHECKINS: &str = "excessive_hourly_checkins";
pub const REPEATED_HIGH_FRAUD_SCORES: &str = "repeated_high_fraud_scores";
pub const GEOGRAPHIC_CLUSTERING_ANOMALY: &str = "geographic_clustering_anomaly";

/// Score at which a result is reported as suspicious.
pub const SUSPICIOUS_THRESHOLD: f64 = 0.6;

const SPEED_LIMIT_KMH: f64 = 100.0;
const AUTO_BLOCK_SPEED_KMH: f64 = 200.0;
const HOURLY_CHECKIN_LIMIT: usize = 10;
const HIGH_FRAUD_SCORE: f64 = 0.7;
const HIGH_FRAUD_REPEATS: usize = 3;
const CLUSTER_MIN_SAMPLE: usize = 5;
const CLUSTER_MIN_COUNT: usize = 10;
const CLUSTER_RADIUS_M: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyInput<'a> {
    pub user_id: &'a str,
    pub location: GeoPoint,
    pub poi_id: &'a str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub suspicious: bool,
    pub anomalies: Vec<String>,
    pub score: f64,
    pub auto_block: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyTypeCount {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyStats {
    pub total_anomalies: usize,
    pub auto_blocks: usize,
    pub top_anomaly_types: Vec<AnomalyTypeCount>,
    pub affected_users: usize,
}

/// Pure evaluation of the history checks. `history` is newest first.
pub fn evaluate(input: &AnomalyInput<'_>, history: &[HistoryEntry]) -> AnomalyResult {
    let mut anomalies = Vec::new();
    let mut score = 0.0;
    let mut auto_block = false;

    if let Some(last) = history.first() {
        let elapsed = input.timestamp - last.checked_at;
        let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
        let km = distance_meters(last.location, input.location) / 1_000.0;

        if hours > 0.0 && hours < 1.0 {
            let speed_kmh = km / hours;
            if speed_kmh > SPEED_LIMIT_KMH {
                anomalies.push(IMPOSSIBLE_TRAVEL_SPEED.to_string());
                score += 0.4;
                warn!(
                    user_id = input.user_id,
                    speed_kmh = speed_kmh.round(),
                    distance_km = km.round(),
                    "impossible travel speed detected"
                );
                if speed_kmh > AUTO_BLOCK_SPEED_KMH {
                    auto_block = true;
                }
            }
        }

        if elapsed < Duration::minutes(5) && km > 1.0 {
            anomalies.push(RAPID_SEQUENTIAL_CHECKINS.to_string());
            score += 0.3;
            warn!(
                user_id = input.user_id,
                minutes = elapsed.num_minutes(),
                distance_km = km.round(),
                "rapid check-ins detected"
            );
        }

        if last.poi_id == input.poi_id && hours < 1.0 {
            anomalies.push(DUPLICATE_POI_TOO_SOON.to_string());
            score += 0.2;
            warn!(
                user_id = input.user_id,
                poi_id = input.poi_id,
                minutes = elapsed.num_minutes(),
                "duplicate POI check-in too soon"
            );
        }
    }

    let last_hour = history
        .iter()
        .filter(|h| input.timestamp - h.checked_at < Duration::hours(1))
        .count();
    if last_hour >= HOURLY_CHECKIN_LIMIT {
        anomalies.push(EXCESSIVE_HOURLY_CHECKINS.to_string());
        score += 0.4;
        auto_block = true;
        warn!(
            user_id = input.user_id,
            check_ins_last_hour = last_hour,
            "excessive check-ins detected"
        );
    }

    let high_scores = history
        .iter()
        .filter(|h| h.fraud_score.is_some_and(|s| s > HIGH_FRAUD_SCORE))
        .count();
    if high_scores >= HIGH_FRAUD_REPEATS {
        anomalies.push(REPEATED_HIGH_FRAUD_SCORES.to_string());
        score += 0.3;
        warn!(
            user_id = input.user_id,
            high_fraud_scores = high_scores,
            "repeated high fraud scores"
        );
    }

    if history.len() >= CLUSTER_MIN_SAMPLE {
        let points: Vec<GeoPoint> = history.iter().map(|h| h.location).collect();
        if let Some(center) = centroid(&points) {
            let spread = points
                .iter()
                .map(|p| distance_meters(*p, center))
                .fold(0.0, f64::max);
            if spread < CLUSTER_RADIUS_M && history.len() >= CLUSTER_MIN_COUNT {
                anomalies.push(GEOGRAPHIC_CLUSTERING_ANOMALY.to_string());
                score += 0.25;
                warn!(
                    user_id = input.user_id,
                    max_distance_m = spread.round(),
                    check_ins = history.len(),
                    "geographic clustering detected"
                );
            }
        }
    }

    let score = f64::min(score, 1.0);
    AnomalyResult {
        suspicious: score >= SUSPICIOUS_THRESHOLD,
        anomalies,
        score,
        auto_block,
    }
}

/// History-backed anomaly detector with auto-block escalation.
#[derive(Clone)]
pub struct AnomalyDetector {
    history: Arc<dyn HistoryStore>,
    log: Arc<dyn AnomalyLog>,
    clock: Arc<dyn Clock>,
    window_hours: i64,
    limit: usize,
    auto_block_threshold: usize,
}

impl AnomalyDetector {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        log: Arc<dyn AnomalyLog>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            history,
            log,
            clock,
            window_hours: config.history_window_hours,
            limit: config.history_limit,
            auto_block_threshold: config.auto_block_threshold,
        }
    }

    /// Evaluate the user's recent history and log suspicious results.
    pub async fn detect(&self, input: &AnomalyInput<'_>) -> Result<AnomalyResult, StoreError> {
        let since = before_hours(self.clock.now(), self.window_hours);
        let history = self
            .history
            .recent_check_ins(input.user_id, since, self.limit)
            .await?;
        let result = evaluate(input, &history);

        if result.suspicious || result.auto_block {
            warn!(
                user_id = input.user_id,
                score = result.score,
                anomalies = ?result.anomalies,
                auto_block = result.auto_block,
                "suspicious activity detected"
            );
            let report = AnomalyReport {
                user_id: input.user_id.to_string(),
                anomalies: result.anomalies.clone(),
                score: result.score,
                auto_block: result.auto_block,
                recorded_at: input.timestamp,
            };
            // The audit entry is best effort; detection still returns.
            if let Err(e) = self.log.record_anomaly(report).await {
                error!(user_id = input.user_id, error = %e, "failed to record anomaly report");
            }
        }
        Ok(result)
    }

    /// Suspend the user once auto-block events in the last 24h reach the
    /// threshold. Returns whether the account is now suspended.
    pub async fn check_auto_block(&self, user_id: &str) -> Result<bool, StoreError> {
        let since = self.clock.now() - Duration::hours(24);
        let count = self.log.count_auto_blocks(user_id, since).await?;
        if count < self.auto_block_threshold {
            return Ok(false);
        }
        error!(user_id, auto_block_count = count, "auto-blocking user");
        self.log.suspend_user(user_id, "anomaly detection").await?;
        Ok(true)
    }

    /// Aggregate the anomaly log between two instants.
    pub async fn anomaly_stats(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<AnomalyStats, StoreError> {
        let reports = self.log.reports_between(from, to).await?;

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for report in &reports {
            for kind in &report.anomalies {
                *counts.entry(kind.as_str()).or_insert(0) += 1;
            }
        }
        let mut top: Vec<AnomalyTypeCount> = counts
            .into_iter()
            .map(|(kind, count)| AnomalyTypeCount {
                kind: kind.to_string(),
                count,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.kind.cmp(&b.kind)));
        top.truncate(10);

        let users: HashSet<&str> = reports.iter().map(|r| r.user_id.as_str()).collect();
        Ok(AnomalyStats {
            total_anomalies: reports.len(),
            auto_blocks: reports.iter().filter(|r| r.auto_block).count(),
            top_anomaly_types: top,
            affected_users: users.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zzik_core::{CheckInMethod, CheckInRecord, ManualClock, Tier};
    use zzik_store::MemoryStore;

    const HOME: GeoPoint = GeoPoint {
        lat: 37.5665,
        lng: 126.978,
    };

    fn entry(location: GeoPoint, checked_at: DateTime<Utc>, poi_id: &str) -> HistoryEntry {
        HistoryEntry {
            location,
            checked_at,
            poi_id: poi_id.into(),
            fraud_score: Some(0.1),
            cell: None,
        }
    }

    fn input(
        location: GeoPoint,
        poi_id: &'static str,
        timestamp: DateTime<Utc>,
    ) -> AnomalyInput<'static> {
        AnomalyInput {
            user_id: "u1",
            location,
            poi_id,
            timestamp,
        }
    }

    #[test]
    fn empty_history_is_clean() {
        let result = evaluate(&input(HOME, "p1", Utc::now()), &[]);
        assert_eq!(result, AnomalyResult::default());
    }

    #[test]
    fn ten_check_ins_in_an_hour_auto_block() {
        let now = Utc::now();
        // Spread out so only the frequency check fires.
        let history: Vec<HistoryEntry> = (0..10)
            .map(|i| {
                let at = now - Duration::minutes(50 - i * 5);
                let loc = GeoPoint {
                    lat: HOME.lat + 0.01 * i as f64,
                    lng: HOME.lng,
                };
                entry(loc, at, &format!("poi-{i}"))
            })
            .rev()
            .collect();
        let here = GeoPoint {
            lat: HOME.lat + 0.09,
            lng: HOME.lng,
        };
        let result = evaluate(&input(here, "poi-new", now), &history);
        assert!(result.anomalies.contains(&EXCESSIVE_HOURLY_CHECKINS.to_string()));
        assert!(result.auto_block);
    }

    #[test]
    fn speed_and_rapid_checks() {
        let now = Utc::now();
        // ~11 km in 3 minutes: ~220 km/h.
        let history = vec![entry(HOME, now - Duration::minutes(3), "p1")];
        let far = GeoPoint {
            lat: HOME.lat + 0.1,
            lng: HOME.lng,
        };
        let result = evaluate(&input(far, "p2", now), &history);
        assert_eq!(
            result.anomalies,
            vec![IMPOSSIBLE_TRAVEL_SPEED.to_string(), RAPID_SEQUENTIAL_CHECKINS.to_string()]
        );
        assert!(result.auto_block);
        assert!((result.score - 0.7).abs() < 1e-9);
        assert!(result.suspicious);
    }

    #[test]
    fn moderate_speed_does_not_auto_block() {
        let now = Utc::now();
        let history = vec![entry(HOME, now - Duration::minutes(30), "p1")];
        // ~66 km in 30 min: ~133 km/h.
        let there = GeoPoint {
            lat: HOME.lat + 0.6,
            lng: HOME.lng,
        };
        let result = evaluate(&input(there, "p2", now), &history);
        assert_eq!(result.anomalies, vec![IMPOSSIBLE_TRAVEL_SPEED.to_string()]);
        assert!(!result.auto_block);
        assert!(!result.suspicious);
    }

    #[test]
    fn duplicate_poi_within_hour() {
        let now = Utc::now();
        let history = vec![entry(HOME, now - Duration::minutes(20), "p1")];
        let result = evaluate(&input(HOME, "p1", now), &history);
        assert_eq!(result.anomalies, vec![DUPLICATE_POI_TOO_SOON.to_string()]);
        assert!((result.score - 0.2).abs() < 1e-9);
    }

    #[test]
    fn repeated_high_scores_and_clustering() {
        let now = Utc::now();
        let history: Vec<HistoryEntry> = (0..10)
            .map(|i| {
                let mut e = entry(HOME, now - Duration::hours(2 + i), &format!("p{i}"));
                if i < 3 {
                    e.fraud_score = Some(0.8);
                }
                e
            })
            .collect();
        let result = evaluate(&input(HOME, "p-new", now), &history);
        assert!(result.anomalies.contains(&REPEATED_HIGH_FRAUD_SCORES.to_string()));
        assert!(result.anomalies.contains(&GEOGRAPHIC_CLUSTERING_ANOMALY.to_string()));
        assert!((result.score - 0.55).abs() < 1e-9);
        assert!(!result.suspicious);
        assert!(!result.auto_block);
    }

    #[test]
    fn clustering_needs_ten_records() {
        let now = Utc::now();
        let history: Vec<HistoryEntry> = (0..6)
            .map(|i| entry(HOME, now - Duration::hours(2 + i), &format!("p{i}")))
            .collect();
        let result = evaluate(&input(HOME, "p-new", now), &history);
        assert!(result.anomalies.is_empty());
    }

    fn record(id: usize, at: DateTime<Utc>, lat: f64) -> CheckInRecord {
        CheckInRecord {
            id: format!("c{id}"),
            user_id: "u1".into(),
            poi_id: format!("p{id}"),
            location: GeoPoint { lat, lng: HOME.lng },
            accuracy_m: 10.0,
            distance_m: 0,
            fraud_score: 0.0,
            verified: true,
            tokens_earned: 0,
            method: CheckInMethod::Gps,
            tier: Tier::Free,
            cell: None,
            qr_token: None,
            campaign_id: None,
            points_earned: None,
            device_info: None,
            ip_address: None,
            checked_at: at,
        }
    }

    fn detector() -> (Arc<ManualClock>, Arc<MemoryStore>, AnomalyDetector) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let detector = AnomalyDetector::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            &EngineConfig::default(),
        );
        (clock, store, detector)
    }

    #[tokio::test]
    async fn detect_logs_and_escalates() {
        let (clock, store, detector) = detector();
        let now = clock.now();
        for i in 0..10 {
            let at = now - Duration::minutes(55 - i as i64 * 5);
            store.insert_history(record(i, at, HOME.lat + 0.01 * i as f64));
        }
        let here = GeoPoint {
            lat: HOME.lat + 0.09,
            lng: HOME.lng,
        };

        for _ in 0..2 {
            let result = detector.detect(&input(here, "p-new", now)).await.unwrap();
            assert!(result.auto_block);
            assert!(!detector.check_auto_block("u1").await.unwrap());
        }
        detector.detect(&input(here, "p-new", now)).await.unwrap();
        assert!(detector.check_auto_block("u1").await.unwrap());
        assert_eq!(
            store.user("u1").unwrap().suspended.as_deref(),
            Some("anomaly detection")
        );

        let stats = detector
            .anomaly_stats(now - Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(stats.total_anomalies, 3);
        assert_eq!(stats.auto_blocks, 3);
        assert_eq!(stats.affected_users, 1);
        assert_eq!(stats.top_anomaly_types[0].kind, EXCESSIVE_HOURLY_CHECKINS);
        assert_eq!(stats.top_anomaly_types[0].count, 3);
    }

    #[tokio::test]
    async fn history_outside_window_is_ignored() {
        let (clock, store, detector) = detector();
        let now = clock.now();
        store.insert_history(record(0, now - Duration::hours(25), HOME.lat));
        let result = detector.detect(&input(HOME, "p0", now)).await.unwrap();
        assert!(result.anomalies.is_empty());
    }
}
