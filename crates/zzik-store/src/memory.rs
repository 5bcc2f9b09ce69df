//! In-memory store implementing every persistence seam.
//!
//! All state sits behind one mutex, so each trait call is a serialized
//! transaction: commits and settlements validate first and then apply, and a
//! failed precondition leaves nothing behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use zzik_core::{Campaign, CheckInRecord, Clock, HistoryEntry, Poi, Subscription};

use crate::records::{
    CreditKind, CreditTransaction, QrCode, SponsorWallet, StoredSubscription, TokenBalance,
    TokenTransaction, UserAccount,
};
use crate::repo::{
    AnomalyLog, AnomalyReport, CheckInCommit, CheckInLedger, HistoryStore, PoiStore, QrPayload,
    QrValidation, QrVerifier, SettlementLedger, SettlementSplit, SplitFn, SubscriptionChange,
    SubscriptionStore,
};
use crate::StoreError;

#[derive(Debug, Default)]
struct State {
    pois: HashMap<String, Poi>,
    poi_visits: HashMap<String, u64>,
    subscriptions: HashMap<String, StoredSubscription>,
    users: HashMap<String, UserAccount>,
    check_ins: Vec<CheckInRecord>,
    qr_codes: HashMap<String, QrCode>,
    token_balances: HashMap<String, TokenBalance>,
    token_transactions: Vec<TokenTransaction>,
    campaigns: HashMap<String, Campaign>,
    wallets: HashMap<String, SponsorWallet>,
    credit_transactions: Vec<CreditTransaction>,
    settlements: HashMap<String, SettlementSplit>,
    anomaly_reports: Vec<AnomalyReport>,
}

/// Process-local store for tests, simulations, and single-node deployments.
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {e}")))
    }

    // Seed helpers never fail on a healthy store; a poisoned mutex is recovered.
    fn seed(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Seeding ──

    pub fn insert_poi(&self, poi: Poi) {
        self.seed().pois.insert(poi.id.clone(), poi);
    }

    pub fn put_subscription(&self, user_id: &str, subscription: Subscription, period_days: i64) {
        let now = self.clock.now();
        self.seed().subscriptions.insert(
            user_id.to_string(),
            StoredSubscription::new(subscription, now, period_days),
        );
    }

    pub fn insert_qr_code(&self, qr: QrCode) {
        self.seed().qr_codes.insert(qr.token.clone(), qr);
    }

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.seed().campaigns.insert(campaign.id.clone(), campaign);
    }

    pub fn insert_wallet(&self, wallet: SponsorWallet) {
        self.seed().wallets.insert(wallet.id.clone(), wallet);
    }

    /// Insert a historical check-in without any of the commit side effects.
    pub fn insert_history(&self, record: CheckInRecord) {
        self.seed().check_ins.push(record);
    }

    // ── Inspection ──

    pub fn user(&self, user_id: &str) -> Option<UserAccount> {
        self.seed().users.get(user_id).cloned()
    }

    pub fn stored_subscription(&self, user_id: &str) -> Option<StoredSubscription> {
        self.seed().subscriptions.get(user_id).cloned()
    }

    pub fn check_in(&self, id: &str) -> Option<CheckInRecord> {
        self.seed().check_ins.iter().find(|c| c.id == id).cloned()
    }

    pub fn check_in_total(&self) -> usize {
        self.seed().check_ins.len()
    }

    pub fn poi_visits(&self, poi_id: &str) -> u64 {
        self.seed().poi_visits.get(poi_id).copied().unwrap_or(0)
    }

    pub fn qr_code(&self, token: &str) -> Option<QrCode> {
        self.seed().qr_codes.get(token).cloned()
    }

    pub fn token_balance(&self, user_id: &str) -> Option<TokenBalance> {
        self.seed().token_balances.get(user_id).cloned()
    }

    pub fn token_transactions(&self) -> Vec<TokenTransaction> {
        self.seed().token_transactions.clone()
    }

    pub fn campaign(&self, id: &str) -> Option<Campaign> {
        self.seed().campaigns.get(id).cloned()
    }

    pub fn wallet(&self, id: &str) -> Option<SponsorWallet> {
        self.seed().wallets.get(id).cloned()
    }

    pub fn credit_transactions(&self) -> Vec<CreditTransaction> {
        self.seed().credit_transactions.clone()
    }
}

#[async_trait]
impl PoiStore for MemoryStore {
    async fn find_poi(&self, poi_id: &str) -> Result<Option<Poi>, StoreError> {
        Ok(self.lock()?.pois.get(poi_id).cloned())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get_subscription(&self, user_id: &str) -> Result<Option<Subscription>, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        Ok(state.subscriptions.get_mut(user_id).map(|s| {
            if s.roll_over(now) {
                info!(user_id, period_end = %s.period_end, "subscription period rolled over");
            }
            s.subscription.clone()
        }))
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn recent_check_ins(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let state = self.lock()?;
        let mut rows: Vec<&CheckInRecord> = state
            .check_ins
            .iter()
            .filter(|c| c.user_id == user_id && c.checked_at >= since)
            .collect();
        rows.sort_by(|a, b| b.checked_at.cmp(&a.checked_at));
        Ok(rows.into_iter().take(limit).map(HistoryEntry::from).collect())
    }

    async fn last_check_in(&self, user_id: &str) -> Result<Option<HistoryEntry>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .check_ins
            .iter()
            .filter(|c| c.user_id == user_id)
            .max_by_key(|c| c.checked_at)
            .map(HistoryEntry::from))
    }

    async fn count_check_ins(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let state = self.lock()?;
        let count = state
            .check_ins
            .iter()
            .filter(|c| c.user_id == user_id && since.is_none_or(|s| c.checked_at >= s))
            .count();
        Ok(count as u64)
    }

    async fn list_check_ins(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckInRecord>, StoreError> {
        let state = self.lock()?;
        let mut rows: Vec<CheckInRecord> = state
            .check_ins
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.checked_at.cmp(&a.checked_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[async_trait]
impl CheckInLedger for MemoryStore {
    async fn commit_check_in(&self, commit: CheckInCommit) -> Result<CheckInRecord, StoreError> {
        let mut state = self.lock()?;
        let record = commit.record;

        // Preconditions first: nothing is written unless all of them hold.
        if state.check_ins.iter().any(|c| c.id == record.id) {
            return Err(StoreError::Conflict(format!(
                "check-in {} already exists",
                record.id
            )));
        }
        if !state.pois.contains_key(&record.poi_id) {
            return Err(StoreError::not_found("poi", &record.poi_id));
        }
        if commit.subscription == SubscriptionChange::Increment
            && !state.subscriptions.contains_key(&record.user_id)
        {
            return Err(StoreError::not_found("subscription", &record.user_id));
        }
        if let Some(token) = &record.qr_token {
            match state.qr_codes.get(token) {
                None => return Err(StoreError::not_found("qr_code", token)),
                Some(qr) if qr.used => {
                    return Err(StoreError::Conflict(format!("qr code already used: {token}")));
                }
                Some(_) => {}
            }
        }

        let now = record.checked_at;
        match commit.subscription {
            SubscriptionChange::Increment => {
                if let Some(sub) = state.subscriptions.get_mut(&record.user_id) {
                    sub.roll_over(now);
                    sub.subscription.check_ins_this_month += 1;
                }
            }
            SubscriptionChange::CreateFree { limit, period_days } => {
                let mut subscription = Subscription::implicit_free(limit);
                subscription.check_ins_this_month = 1;
                state.subscriptions.insert(
                    record.user_id.clone(),
                    StoredSubscription::new(subscription, now, period_days),
                );
            }
        }

        let user = state.users.entry(record.user_id.clone()).or_default();
        user.total_check_ins += 1;
        user.points += i64::try_from(record.tokens_earned).unwrap_or(i64::MAX);
        user.last_check_in_at = Some(now);

        *state.poi_visits.entry(record.poi_id.clone()).or_insert(0) += 1;

        if let Some(award) = &commit.token_award {
            let balance = state
                .token_balances
                .entry(record.user_id.clone())
                .or_default();
            balance.balance += award.amount;
            balance.total_earned += award.amount;
            balance.last_earned_at = Some(now);
            state.token_transactions.push(TokenTransaction {
                user_id: record.user_id.clone(),
                kind: "EARN_CHECKIN".into(),
                amount: i64::try_from(award.amount).unwrap_or(i64::MAX),
                check_in_id: Some(record.id.clone()),
                description: award.description.clone(),
                expires_at: Some(award.expires_at),
            });
        }

        if let Some(qr) = record
            .qr_token
            .as_ref()
            .and_then(|token| state.qr_codes.get_mut(token))
        {
            qr.used = true;
            qr.used_by = Some(record.user_id.clone());
            qr.used_at = Some(now);
            qr.scans_total += 1;
            info!(
                user_id = %record.user_id,
                poi_id = %record.poi_id,
                check_in_id = %record.id,
                "qr code marked as used"
            );
        }

        state.check_ins.push(record.clone());
        Ok(record)
    }
}

#[async_trait]
impl SettlementLedger for MemoryStore {
    async fn settle_check_in(
        &self,
        check_in_id: &str,
        split: SplitFn<'_>,
    ) -> Result<Option<SettlementSplit>, StoreError> {
        let mut state = self.lock()?;

        if let Some(done) = state.settlements.get(check_in_id) {
            return Ok(Some(*done));
        }
        let check_in = state
            .check_ins
            .iter()
            .find(|c| c.id == check_in_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("check_in", check_in_id))?;

        let Some(campaign) = check_in
            .campaign_id
            .as_ref()
            .and_then(|id| state.campaigns.get(id))
            .cloned()
        else {
            return Ok(None);
        };
        let Some(wallet_id) = campaign
            .sponsor_wallet_id
            .clone()
            .filter(|id| state.wallets.contains_key(id))
        else {
            return Ok(None);
        };
        if !campaign.can_fund(campaign.cpcv_amount) {
            warn!(campaign_id = %campaign.id, "campaign budget exhausted, skipping settlement");
            return Ok(None);
        }

        let shares = split(&campaign);
        let cpcv = campaign.cpcv_amount;

        if let Some(wallet) = state.wallets.get_mut(&wallet_id) {
            wallet.balance -= cpcv;
        }
        state
            .users
            .entry(check_in.user_id.clone())
            .or_default()
            .points += shares.user_reward;
        for (kind, amount) in [
            (CreditKind::Spend, -cpcv),
            (CreditKind::PlatformFee, -shares.platform_fee),
            (CreditKind::NetworkPool, -shares.network_fee),
        ] {
            state.credit_transactions.push(CreditTransaction {
                wallet_id: wallet_id.clone(),
                kind,
                amount,
                campaign_id: campaign.id.clone(),
                check_in_id: check_in_id.to_string(),
            });
        }
        if let Some(record) = state.check_ins.iter_mut().find(|c| c.id == check_in_id) {
            record.points_earned = Some(shares.user_reward);
        }
        if let Some(c) = state.campaigns.get_mut(&campaign.id) {
            c.budget_spent += cpcv;
            c.total_check_ins += 1;
        }
        state.settlements.insert(check_in_id.to_string(), shares);
        Ok(Some(shares))
    }
}

#[async_trait]
impl AnomalyLog for MemoryStore {
    async fn record_anomaly(&self, report: AnomalyReport) -> Result<(), StoreError> {
        self.lock()?.anomaly_reports.push(report);
        Ok(())
    }

    async fn count_auto_blocks(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        Ok(self
            .lock()?
            .anomaly_reports
            .iter()
            .filter(|r| r.user_id == user_id && r.auto_block && r.recorded_at >= since)
            .count())
    }

    async fn reports_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AnomalyReport>, StoreError> {
        Ok(self
            .lock()?
            .anomaly_reports
            .iter()
            .filter(|r| r.recorded_at >= from && r.recorded_at <= to)
            .cloned()
            .collect())
    }

    async fn suspend_user(&self, user_id: &str, reason: &str) -> Result<(), StoreError> {
        self.lock()?
            .users
            .entry(user_id.to_string())
            .or_default()
            .suspended = Some(reason.to_string());
        Ok(())
    }
}

#[async_trait]
impl QrVerifier for MemoryStore {
    async fn validate(&self, token: &str, _user_id: &str) -> Result<QrValidation, StoreError> {
        let now = self.clock.now();
        let state = self.lock()?;
        let Some(qr) = state.qr_codes.get(token) else {
            return Ok(QrValidation::invalid("QR code not found"));
        };
        if qr.used {
            return Ok(QrValidation::invalid("QR code already used"));
        }
        if qr.expires_at.is_some_and(|at| at <= now) {
            return Ok(QrValidation::invalid("QR code expired"));
        }
        Ok(QrValidation::ok(QrPayload {
            poi_id: qr.poi_id.clone(),
            merchant_id: qr.merchant_id.clone(),
        }))
    }

    async fn mark_used(&self, token: &str, user_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let qr = state
            .qr_codes
            .get_mut(token)
            .ok_or_else(|| StoreError::not_found("qr_code", token))?;
        if qr.used {
            return Err(StoreError::Conflict(format!("qr code already used: {token}")));
        }
        qr.used = true;
        qr.used_by = Some(user_id.to_string());
        qr.used_at = Some(now);
        qr.scans_total += 1;
        Ok(())
    }
}
