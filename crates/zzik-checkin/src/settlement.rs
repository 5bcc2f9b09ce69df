//! CPCV settlement: splits a campaign's per-check-in payout between the user,
//! the platform, and the network pool.

use std::sync::Arc;

use tracing::info;
use zzik_core::{Campaign, Distribution};
use zzik_store::{SettlementLedger, SettlementSplit, StoreError};

const BASIS_POINTS: i64 = 10_000;

fn to_bps(fraction: f64) -> i64 {
    (fraction * BASIS_POINTS as f64).round() as i64
}

/// Split `amount` by `dist`. User and platform shares are floored; the
/// network share takes the remainder so the parts always sum to `amount`.
///
/// Fractions are rounded to basis points first, so `700 * 0.7` is 490 rather
/// than a float-floored 489.
pub fn split_cpcv(amount: i64, dist: &Distribution) -> SettlementSplit {
    let user_reward = amount * to_bps(dist.user) / BASIS_POINTS;
    let platform_fee = amount * to_bps(dist.platform) / BASIS_POINTS;
    SettlementSplit {
        user_reward,
        platform_fee,
        network_fee: amount - user_reward - platform_fee,
    }
}

fn campaign_split(campaign: &Campaign) -> SettlementSplit {
    split_cpcv(campaign.cpcv_amount, &campaign.distribution)
}

#[derive(Clone)]
pub struct SettlementService {
    ledger: Arc<dyn SettlementLedger>,
}

impl SettlementService {
    pub fn new(ledger: Arc<dyn SettlementLedger>) -> Self {
        Self { ledger }
    }

    /// Settle one check-in. `None` when it is not campaign-funded or the
    /// campaign cannot pay.
    pub async fn settle(&self, check_in_id: &str) -> Result<Option<SettlementSplit>, StoreError> {
        let split = self
            .ledger
            .settle_check_in(check_in_id, &campaign_split)
            .await?;
        if let Some(s) = &split {
            info!(
                check_in_id,
                user_reward = s.user_reward,
                platform_fee = s.platform_fee,
                network_fee = s.network_fee,
                "check-in settled"
            );
        }
        Ok(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use zzik_core::{CheckInMethod, CheckInRecord, GeoPoint, ManualClock, Tier};
    use zzik_store::MemoryStore;
    use zzik_store::records::{CreditKind, SponsorWallet};

    #[test]
    fn default_distribution_of_700() {
        let split = split_cpcv(700, &Distribution::default());
        assert_eq!(split.user_reward, 490);
        assert_eq!(split.platform_fee, 175);
        assert_eq!(split.network_fee, 35);
        assert_eq!(split.total(), 700);
    }

    #[test]
    fn remainder_goes_to_network() {
        let dist = Distribution {
            user: 0.333,
            platform: 0.333,
            network: 0.334,
        };
        let split = split_cpcv(1_001, &dist);
        assert_eq!(split.user_reward, 333);
        assert_eq!(split.platform_fee, 333);
        assert_eq!(split.network_fee, 335);
        for amount in [0, 1, 7, 99, 700, 12_345] {
            assert_eq!(split_cpcv(amount, &dist).total(), amount);
        }
    }

    fn check_in(id: &str, campaign_id: &str) -> CheckInRecord {
        CheckInRecord {
            id: id.into(),
            user_id: "u1".into(),
            poi_id: "p1".into(),
            location: GeoPoint {
                lat: 37.5,
                lng: 127.0,
            },
            accuracy_m: 10.0,
            distance_m: 2,
            fraud_score: 0.0,
            verified: true,
            tokens_earned: 0,
            method: CheckInMethod::Gps,
            tier: Tier::Free,
            cell: None,
            qr_token: None,
            campaign_id: Some(campaign_id.into()),
            points_earned: None,
            device_info: None,
            ip_address: None,
            checked_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn concurrent_settlements_serialize_on_the_wallet() {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(Utc::now()))));
        store.insert_wallet(SponsorWallet {
            id: "w1".into(),
            balance: 100_000,
        });
        store.insert_campaign(Campaign {
            id: "camp".into(),
            sponsor_wallet_id: Some("w1".into()),
            cpcv_amount: 700,
            distribution: Distribution::default(),
            budget_total: Some(7_000),
            budget_spent: 0,
            total_check_ins: 0,
        });
        for i in 0..15 {
            store.insert_history(check_in(&format!("c{i}"), "camp"));
        }

        let service = SettlementService::new(store.clone());
        let ids: Vec<String> = (0..15).map(|i| format!("c{i}")).collect();
        let results =
            futures::future::join_all(ids.iter().map(|id| service.settle(id))).await;

        let settled = results
            .iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();
        assert_eq!(settled, 10);
        assert_eq!(store.wallet("w1").unwrap().balance, 100_000 - 7_000);
        let campaign = store.campaign("camp").unwrap();
        assert_eq!(campaign.budget_spent, 7_000);
        assert_eq!(campaign.total_check_ins, 10);
        let spends = store
            .credit_transactions()
            .iter()
            .filter(|t| t.kind == CreditKind::Spend)
            .count();
        assert_eq!(spends, 10);
    }

    #[tokio::test]
    async fn unknown_campaign_is_not_settled() {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(Utc::now()))));
        store.insert_history(check_in("c1", "missing"));
        let service = SettlementService::new(store);
        assert_eq!(service.settle("c1").await.unwrap(), None);
    }
}
