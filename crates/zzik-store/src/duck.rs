//! DuckDB-backed durable store.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::types::Type;
use duckdb::{Connection, OptionalExt, Row, Transaction, params};
use tracing::{info, warn};
use zzik_core::{
    Campaign, CheckInMethod, CheckInRecord, Clock, Distribution, GeoPoint, HistoryEntry, Poi,
    Subscription, SubscriptionStatus, Tier,
};

use crate::StoreError;
use crate::records::{CreditKind, QrCode, SponsorWallet, next_period, period_end};
use crate::repo::{
    AnomalyLog, AnomalyReport, CheckInCommit, CheckInLedger, HistoryStore, PoiStore, QrPayload,
    QrValidation, QrVerifier, SettlementLedger, SettlementSplit, SplitFn, SubscriptionChange,
    SubscriptionStore,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pois (
    id VARCHAR NOT NULL,
    name VARCHAR NOT NULL,
    lat DOUBLE NOT NULL,
    lng DOUBLE NOT NULL,
    cell VARCHAR,
    campaign_id VARCHAR,
    visit_count BIGINT NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS subscriptions (
    user_id VARCHAR NOT NULL,
    tier VARCHAR NOT NULL,
    status VARCHAR NOT NULL,
    check_ins_this_month INTEGER NOT NULL,
    check_in_limit INTEGER,
    period_start BIGINT NOT NULL,
    period_end BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS users (
    id VARCHAR NOT NULL,
    total_check_ins BIGINT NOT NULL DEFAULT 0,
    points BIGINT NOT NULL DEFAULT 0,
    last_check_in_at BIGINT,
    suspended VARCHAR
);
CREATE TABLE IF NOT EXISTS check_ins (
    id VARCHAR PRIMARY KEY,
    user_id VARCHAR NOT NULL,
    poi_id VARCHAR NOT NULL,
    lat DOUBLE NOT NULL,
    lng DOUBLE NOT NULL,
    accuracy_m DOUBLE NOT NULL,
    distance_m INTEGER NOT NULL,
    fraud_score DOUBLE NOT NULL,
    verified BOOLEAN NOT NULL,
    tokens_earned BIGINT NOT NULL,
    method VARCHAR NOT NULL,
    tier VARCHAR NOT NULL,
    cell VARCHAR,
    qr_token VARCHAR,
    campaign_id VARCHAR,
    points_earned BIGINT,
    device_info VARCHAR,
    ip_address VARCHAR,
    checked_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS qr_codes (
    token VARCHAR NOT NULL,
    poi_id VARCHAR NOT NULL,
    merchant_id VARCHAR NOT NULL,
    expires_at BIGINT,
    used BOOLEAN NOT NULL DEFAULT false,
    used_by VARCHAR,
    used_at BIGINT,
    scans_total BIGINT NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS token_balances (
    user_id VARCHAR NOT NULL,
    balance BIGINT NOT NULL,
    total_earned BIGINT NOT NULL,
    last_earned_at BIGINT
);
CREATE TABLE IF NOT EXISTS token_transactions (
    user_id VARCHAR NOT NULL,
    kind VARCHAR NOT NULL,
    amount BIGINT NOT NULL,
    check_in_id VARCHAR,
    description VARCHAR NOT NULL,
    expires_at BIGINT
);
CREATE TABLE IF NOT EXISTS campaigns (
    id VARCHAR NOT NULL,
    sponsor_wallet_id VARCHAR,
    cpcv_amount BIGINT NOT NULL,
    dist_user DOUBLE NOT NULL,
    dist_platform DOUBLE NOT NULL,
    dist_network DOUBLE NOT NULL,
    budget_total BIGINT,
    budget_spent BIGINT NOT NULL DEFAULT 0,
    total_check_ins BIGINT NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS sponsor_wallets (
    id VARCHAR NOT NULL,
    balance BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS credit_transactions (
    wallet_id VARCHAR NOT NULL,
    kind VARCHAR NOT NULL,
    amount BIGINT NOT NULL,
    campaign_id VARCHAR NOT NULL,
    check_in_id VARCHAR NOT NULL
);
CREATE TABLE IF NOT EXISTS settlements (
    check_in_id VARCHAR PRIMARY KEY,
    user_reward BIGINT NOT NULL,
    platform_fee BIGINT NOT NULL,
    network_fee BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS anomaly_reports (
    user_id VARCHAR NOT NULL,
    anomalies VARCHAR NOT NULL,
    score DOUBLE NOT NULL,
    auto_block BOOLEAN NOT NULL,
    recorded_at BIGINT NOT NULL
);
";

const CHECK_IN_COLUMNS: &str = "id, user_id, poi_id, lat, lng, accuracy_m, distance_m, \
     fraud_score, verified, tokens_earned, method, tier, cell, qr_token, campaign_id, \
     points_earned, device_info, ip_address, checked_at";

/// Durable store over a single DuckDB connection.
///
/// Every trait call holds the connection mutex for its whole duration, and
/// the two write units ([`CheckInLedger`] and [`SettlementLedger`]) run inside
/// one DuckDB transaction. DuckDB transactions are snapshot-isolated with
/// optimistic conflict detection; combined with the connection lock this gives
/// serializable behaviour for settlement.
///
/// Timestamps are stored as epoch milliseconds in `BIGINT` columns.
pub struct DuckStore {
    clock: Arc<dyn Clock>,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for DuckStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckStore").finish_non_exhaustive()
    }
}

impl DuckStore {
    /// Open an in-memory database with the schema applied.
    pub fn open(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    /// Open or create a persistent database at the given path.
    pub fn open_persistent(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let store = Self::init(Connection::open(path)?, clock)?;
        info!(path = %path.display(), "opened persistent store");
        Ok(store)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            clock,
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {e}")))
    }

    // ── Seeding ──

    pub fn insert_poi(&self, poi: &Poi) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO pois (id, name, lat, lng, cell, campaign_id) VALUES (?, ?, ?, ?, ?, ?)",
            params![poi.id, poi.name, poi.lat, poi.lng, poi.cell, poi.campaign_id],
        )?;
        Ok(())
    }

    pub fn put_subscription(
        &self,
        user_id: &str,
        subscription: &Subscription,
        period_days: i64,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM subscriptions WHERE user_id = ?", params![user_id])?;
        insert_subscription(&tx, user_id, subscription, now, period_days)?;
        tx.commit()?;
        Ok(())
    }

    pub fn insert_qr_code(&self, qr: &QrCode) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO qr_codes (token, poi_id, merchant_id, expires_at, used, used_by, used_at, scans_total)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                qr.token,
                qr.poi_id,
                qr.merchant_id,
                qr.expires_at.map(millis),
                qr.used,
                qr.used_by,
                qr.used_at.map(millis),
                to_i64(qr.scans_total),
            ],
        )?;
        Ok(())
    }

    pub fn insert_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO campaigns (id, sponsor_wallet_id, cpcv_amount, dist_user, dist_platform,
                 dist_network, budget_total, budget_spent, total_check_ins)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                campaign.id,
                campaign.sponsor_wallet_id,
                campaign.cpcv_amount,
                campaign.distribution.user,
                campaign.distribution.platform,
                campaign.distribution.network,
                campaign.budget_total,
                campaign.budget_spent,
                to_i64(campaign.total_check_ins),
            ],
        )?;
        Ok(())
    }

    pub fn insert_wallet(&self, wallet: &SponsorWallet) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO sponsor_wallets (id, balance) VALUES (?, ?)",
            params![wallet.id, wallet.balance],
        )?;
        Ok(())
    }

    /// Insert a historical check-in without any of the commit side effects.
    pub fn insert_history(&self, record: &CheckInRecord) -> Result<(), StoreError> {
        insert_check_in(&*self.lock()?, record)
    }

    // ── Inspection ──

    pub fn check_in(&self, id: &str) -> Result<Option<CheckInRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {CHECK_IN_COLUMNS} FROM check_ins WHERE id = ?");
        Ok(conn.query_row(&sql, params![id], read_check_in).optional()?)
    }

    pub fn poi_visits(&self, poi_id: &str) -> Result<u64, StoreError> {
        let visits: Option<i64> = self
            .lock()?
            .query_row(
                "SELECT visit_count FROM pois WHERE id = ?",
                params![poi_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(visits.map(to_u64).unwrap_or(0))
    }

    pub fn wallet_balance(&self, wallet_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .lock()?
            .query_row(
                "SELECT balance FROM sponsor_wallets WHERE id = ?",
                params![wallet_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn token_balance(&self, user_id: &str) -> Result<Option<u64>, StoreError> {
        let balance: Option<i64> = self
            .lock()?
            .query_row(
                "SELECT balance FROM token_balances WHERE user_id = ?",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.map(to_u64))
    }

    pub fn user_points(&self, user_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .lock()?
            .query_row(
                "SELECT points FROM users WHERE id = ?",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn suspension(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let reason: Option<Option<String>> = self
            .lock()?
            .query_row(
                "SELECT suspended FROM users WHERE id = ?",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(reason.flatten())
    }

    pub fn check_in_total(&self) -> Result<usize, StoreError> {
        let count: i64 =
            self.lock()?
                .query_row("SELECT count(*)::BIGINT FROM check_ins", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

// ── Row helpers ──

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn bad_column(idx: usize, msg: String) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn read_check_in(row: &Row<'_>) -> duckdb::Result<CheckInRecord> {
    let method: String = row.get(10)?;
    let tier: String = row.get(11)?;
    let device_info: Option<String> = row.get(16)?;
    let device_info = device_info
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| bad_column(16, e.to_string()))?;
    Ok(CheckInRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        poi_id: row.get(2)?,
        location: GeoPoint {
            lat: row.get(3)?,
            lng: row.get(4)?,
        },
        accuracy_m: row.get(5)?,
        distance_m: u32::try_from(row.get::<_, i32>(6)?).unwrap_or(0),
        fraud_score: row.get(7)?,
        verified: row.get(8)?,
        tokens_earned: to_u64(row.get(9)?),
        method: CheckInMethod::parse(&method)
            .ok_or_else(|| bad_column(10, format!("unknown method {method}")))?,
        tier: Tier::parse(&tier).ok_or_else(|| bad_column(11, format!("unknown tier {tier}")))?,
        cell: row.get(12)?,
        qr_token: row.get(13)?,
        campaign_id: row.get(14)?,
        points_earned: row.get(15)?,
        device_info,
        ip_address: row.get(17)?,
        checked_at: from_millis(row.get(18)?),
    })
}

fn insert_check_in(conn: &Connection, record: &CheckInRecord) -> Result<(), StoreError> {
    let device_info = record
        .device_info
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let sql = format!(
        "INSERT INTO check_ins ({CHECK_IN_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    conn.execute(
        &sql,
        params![
            record.id,
            record.user_id,
            record.poi_id,
            record.location.lat,
            record.location.lng,
            record.accuracy_m,
            i32::try_from(record.distance_m).unwrap_or(i32::MAX),
            record.fraud_score,
            record.verified,
            to_i64(record.tokens_earned),
            record.method.as_str(),
            record.tier.as_str(),
            record.cell,
            record.qr_token,
            record.campaign_id,
            record.points_earned,
            device_info,
            record.ip_address,
            millis(record.checked_at),
        ],
    )?;
    Ok(())
}

fn insert_subscription(
    conn: &Connection,
    user_id: &str,
    subscription: &Subscription,
    start: DateTime<Utc>,
    period_days: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO subscriptions (user_id, tier, status, check_ins_this_month, check_in_limit,
             period_start, period_end)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            user_id,
            subscription.tier.as_str(),
            subscription.status.as_str(),
            i32::try_from(subscription.check_ins_this_month).unwrap_or(i32::MAX),
            subscription
                .check_in_limit
                .map(|limit| i32::try_from(limit).unwrap_or(i32::MAX)),
            millis(start),
            millis(period_end(start, period_days)),
        ],
    )?;
    Ok(())
}

/// Start the next usage period for `user_id` if the current one has ended.
fn roll_subscription(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let period: Option<(i64, i64)> = conn
        .query_row(
            "SELECT period_start, period_end FROM subscriptions WHERE user_id = ?",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((start, end)) = period else {
        return Ok(());
    };
    if let Some((start, end)) = next_period(from_millis(start), from_millis(end), now) {
        conn.execute(
            "UPDATE subscriptions SET check_ins_this_month = 0, period_start = ?, period_end = ?
             WHERE user_id = ?",
            params![millis(start), millis(end), user_id],
        )?;
        info!(user_id, period_end = %end, "subscription period rolled over");
    }
    Ok(())
}

fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, StoreError> {
    let found: Option<i64> = conn.query_row(sql, params![id], |row| row.get(0)).optional()?;
    Ok(found.is_some())
}

fn ensure_user(tx: &Transaction<'_>, user_id: &str) -> Result<(), StoreError> {
    if !exists(tx, "SELECT 1 FROM users WHERE id = ?", user_id)? {
        tx.execute("INSERT INTO users (id) VALUES (?)", params![user_id])?;
    }
    Ok(())
}

fn read_campaign(row: &Row<'_>) -> duckdb::Result<Campaign> {
    Ok(Campaign {
        id: row.get(0)?,
        sponsor_wallet_id: row.get(1)?,
        cpcv_amount: row.get(2)?,
        distribution: Distribution {
            user: row.get(3)?,
            platform: row.get(4)?,
            network: row.get(5)?,
        },
        budget_total: row.get(6)?,
        budget_spent: row.get(7)?,
        total_check_ins: to_u64(row.get(8)?),
    })
}

#[async_trait]
impl PoiStore for DuckStore {
    async fn find_poi(&self, poi_id: &str) -> Result<Option<Poi>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, lat, lng, cell, campaign_id FROM pois WHERE id = ?",
                params![poi_id],
                |row| {
                    Ok(Poi {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        lat: row.get(2)?,
                        lng: row.get(3)?,
                        cell: row.get(4)?,
                        campaign_id: row.get(5)?,
                    })
                },
            )
            .optional()?)
    }
}

#[async_trait]
impl SubscriptionStore for DuckStore {
    async fn get_subscription(&self, user_id: &str) -> Result<Option<Subscription>, StoreError> {
        let now = self.clock.now();
        let conn = self.lock()?;
        roll_subscription(&conn, user_id, now)?;
        Ok(conn
            .query_row(
                "SELECT tier, status, check_ins_this_month, check_in_limit
                 FROM subscriptions WHERE user_id = ?",
                params![user_id],
                |row| {
                    let tier: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    Ok(Subscription {
                        tier: Tier::parse(&tier)
                            .ok_or_else(|| bad_column(0, format!("unknown tier {tier}")))?,
                        status: SubscriptionStatus::parse(&status)
                            .ok_or_else(|| bad_column(1, format!("unknown status {status}")))?,
                        check_ins_this_month: u32::try_from(row.get::<_, i32>(2)?).unwrap_or(0),
                        check_in_limit: row
                            .get::<_, Option<i32>>(3)?
                            .map(|limit| u32::try_from(limit).unwrap_or(0)),
                    })
                },
            )
            .optional()?)
    }
}

#[async_trait]
impl HistoryStore for DuckStore {
    async fn recent_check_ins(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {CHECK_IN_COLUMNS} FROM check_ins
             WHERE user_id = ? AND checked_at >= ?
             ORDER BY checked_at DESC LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, millis(since)], read_check_in)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(HistoryEntry::from(&row?));
        }
        Ok(out)
    }

    async fn last_check_in(&self, user_id: &str) -> Result<Option<HistoryEntry>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {CHECK_IN_COLUMNS} FROM check_ins WHERE user_id = ?
             ORDER BY checked_at DESC LIMIT 1"
        );
        let record = conn
            .query_row(&sql, params![user_id], read_check_in)
            .optional()?;
        Ok(record.as_ref().map(HistoryEntry::from))
    }

    async fn count_check_ins(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let since = since.map(millis).unwrap_or(i64::MIN);
        let count: i64 = conn.query_row(
            "SELECT count(*)::BIGINT FROM check_ins WHERE user_id = ? AND checked_at >= ?",
            params![user_id, since],
            |row| row.get(0),
        )?;
        Ok(to_u64(count))
    }

    async fn list_check_ins(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckInRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {CHECK_IN_COLUMNS} FROM check_ins WHERE user_id = ?
             ORDER BY checked_at DESC LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], read_check_in)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl CheckInLedger for DuckStore {
    async fn commit_check_in(&self, commit: CheckInCommit) -> Result<CheckInRecord, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let record = commit.record;
        let now = record.checked_at;

        if exists(&tx, "SELECT 1 FROM check_ins WHERE id = ?", &record.id)? {
            return Err(StoreError::Conflict(format!(
                "check-in {} already exists",
                record.id
            )));
        }
        if !exists(&tx, "SELECT 1 FROM pois WHERE id = ?", &record.poi_id)? {
            return Err(StoreError::not_found("poi", &record.poi_id));
        }

        if let Some(token) = &record.qr_token {
            // Conditional update; zero rows means the token was consumed concurrently.
            let updated = tx.execute(
                "UPDATE qr_codes SET used = true, used_by = ?, used_at = ?, scans_total = scans_total + 1
                 WHERE token = ? AND NOT used",
                params![record.user_id, millis(now), token],
            )?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "qr code already used or missing: {token}"
                )));
            }
        }

        insert_check_in(&tx, &record)?;

        match commit.subscription {
            SubscriptionChange::Increment => {
                roll_subscription(&tx, &record.user_id, now)?;
                let updated = tx.execute(
                    "UPDATE subscriptions SET check_ins_this_month = check_ins_this_month + 1
                     WHERE user_id = ?",
                    params![record.user_id],
                )?;
                if updated == 0 {
                    return Err(StoreError::not_found("subscription", &record.user_id));
                }
            }
            SubscriptionChange::CreateFree { limit, period_days } => {
                let mut subscription = Subscription::implicit_free(limit);
                subscription.check_ins_this_month = 1;
                insert_subscription(&tx, &record.user_id, &subscription, now, period_days)?;
            }
        }

        ensure_user(&tx, &record.user_id)?;
        tx.execute(
            "UPDATE users SET total_check_ins = total_check_ins + 1, points = points + ?,
                 last_check_in_at = ? WHERE id = ?",
            params![to_i64(record.tokens_earned), millis(now), record.user_id],
        )?;
        tx.execute(
            "UPDATE pois SET visit_count = visit_count + 1 WHERE id = ?",
            params![record.poi_id],
        )?;

        if let Some(award) = &commit.token_award {
            let amount = to_i64(award.amount);
            if exists(
                &tx,
                "SELECT 1 FROM token_balances WHERE user_id = ?",
                &record.user_id,
            )? {
                tx.execute(
                    "UPDATE token_balances SET balance = balance + ?, total_earned = total_earned + ?,
                         last_earned_at = ? WHERE user_id = ?",
                    params![amount, amount, millis(now), record.user_id],
                )?;
            } else {
                tx.execute(
                    "INSERT INTO token_balances (user_id, balance, total_earned, last_earned_at)
                     VALUES (?, ?, ?, ?)",
                    params![record.user_id, amount, amount, millis(now)],
                )?;
            }
            tx.execute(
                "INSERT INTO token_transactions (user_id, kind, amount, check_in_id, description, expires_at)
                 VALUES (?, 'EARN_CHECKIN', ?, ?, ?, ?)",
                params![
                    record.user_id,
                    amount,
                    record.id,
                    award.description,
                    millis(award.expires_at),
                ],
            )?;
        }

        tx.commit()?;
        if record.qr_token.is_some() {
            info!(
                user_id = %record.user_id,
                poi_id = %record.poi_id,
                check_in_id = %record.id,
                "qr code marked as used"
            );
        }
        Ok(record)
    }
}

#[async_trait]
impl SettlementLedger for DuckStore {
    async fn settle_check_in(
        &self,
        check_in_id: &str,
        split: SplitFn<'_>,
    ) -> Result<Option<SettlementSplit>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let done = tx
            .query_row(
                "SELECT user_reward, platform_fee, network_fee FROM settlements WHERE check_in_id = ?",
                params![check_in_id],
                |row| {
                    Ok(SettlementSplit {
                        user_reward: row.get(0)?,
                        platform_fee: row.get(1)?,
                        network_fee: row.get(2)?,
                    })
                },
            )
            .optional()?;
        if done.is_some() {
            return Ok(done);
        }

        let found: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT user_id, campaign_id FROM check_ins WHERE id = ?",
                params![check_in_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (user_id, campaign_id) =
            found.ok_or_else(|| StoreError::not_found("check_in", check_in_id))?;
        let Some(campaign_id) = campaign_id else {
            return Ok(None);
        };
        let Some(campaign) = tx
            .query_row(
                "SELECT id, sponsor_wallet_id, cpcv_amount, dist_user, dist_platform, dist_network,
                     budget_total, budget_spent, total_check_ins
                 FROM campaigns WHERE id = ?",
                params![campaign_id],
                read_campaign,
            )
            .optional()?
        else {
            return Ok(None);
        };
        let Some(wallet_id) = campaign.sponsor_wallet_id.clone() else {
            return Ok(None);
        };
        if !exists(&tx, "SELECT 1 FROM sponsor_wallets WHERE id = ?", &wallet_id)? {
            return Ok(None);
        }
        if !campaign.can_fund(campaign.cpcv_amount) {
            warn!(campaign_id = %campaign.id, "campaign budget exhausted, skipping settlement");
            return Ok(None);
        }

        let shares = split(&campaign);
        let cpcv = campaign.cpcv_amount;

        tx.execute(
            "UPDATE sponsor_wallets SET balance = balance - ? WHERE id = ?",
            params![cpcv, wallet_id],
        )?;
        ensure_user(&tx, &user_id)?;
        tx.execute(
            "UPDATE users SET points = points + ? WHERE id = ?",
            params![shares.user_reward, user_id],
        )?;
        for (kind, amount) in [
            (CreditKind::Spend, -cpcv),
            (CreditKind::PlatformFee, -shares.platform_fee),
            (CreditKind::NetworkPool, -shares.network_fee),
        ] {
            tx.execute(
                "INSERT INTO credit_transactions (wallet_id, kind, amount, campaign_id, check_in_id)
                 VALUES (?, ?, ?, ?, ?)",
                params![wallet_id, kind.as_str(), amount, campaign.id, check_in_id],
            )?;
        }
        tx.execute(
            "UPDATE check_ins SET points_earned = ? WHERE id = ?",
            params![shares.user_reward, check_in_id],
        )?;
        tx.execute(
            "UPDATE campaigns SET budget_spent = budget_spent + ?, total_check_ins = total_check_ins + 1
             WHERE id = ?",
            params![cpcv, campaign.id],
        )?;
        tx.execute(
            "INSERT INTO settlements (check_in_id, user_reward, platform_fee, network_fee)
             VALUES (?, ?, ?, ?)",
            params![
                check_in_id,
                shares.user_reward,
                shares.platform_fee,
                shares.network_fee
            ],
        )?;
        tx.commit()?;
        Ok(Some(shares))
    }
}

#[async_trait]
impl AnomalyLog for DuckStore {
    async fn record_anomaly(&self, report: AnomalyReport) -> Result<(), StoreError> {
        let anomalies = serde_json::to_string(&report.anomalies)?;
        self.lock()?.execute(
            "INSERT INTO anomaly_reports (user_id, anomalies, score, auto_block, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                report.user_id,
                anomalies,
                report.score,
                report.auto_block,
                millis(report.recorded_at)
            ],
        )?;
        Ok(())
    }

    async fn count_auto_blocks(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let count: i64 = self.lock()?.query_row(
            "SELECT count(*)::BIGINT FROM anomaly_reports
             WHERE user_id = ? AND auto_block AND recorded_at >= ?",
            params![user_id, millis(since)],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn reports_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AnomalyReport>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, anomalies, score, auto_block, recorded_at FROM anomaly_reports
             WHERE recorded_at >= ? AND recorded_at <= ? ORDER BY recorded_at",
        )?;
        let rows = stmt.query_map(params![millis(from), millis(to)], |row| {
            let raw: String = row.get(1)?;
            Ok(AnomalyReport {
                user_id: row.get(0)?,
                anomalies: serde_json::from_str(&raw).map_err(|e| bad_column(1, e.to_string()))?,
                score: row.get(2)?,
                auto_block: row.get(3)?,
                recorded_at: from_millis(row.get(4)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn suspend_user(&self, user_id: &str, reason: &str) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        ensure_user(&tx, user_id)?;
        tx.execute(
            "UPDATE users SET suspended = ? WHERE id = ?",
            params![reason, user_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl QrVerifier for DuckStore {
    async fn validate(&self, token: &str, _user_id: &str) -> Result<QrValidation, StoreError> {
        let now = self.clock.now();
        let row: Option<(String, String, Option<i64>, bool)> = self
            .lock()?
            .query_row(
                "SELECT poi_id, merchant_id, expires_at, used FROM qr_codes WHERE token = ?",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((poi_id, merchant_id, expires_at, used)) = row else {
            return Ok(QrValidation::invalid("QR code not found"));
        };
        if used {
            return Ok(QrValidation::invalid("QR code already used"));
        }
        if expires_at.is_some_and(|at| at <= millis(now)) {
            return Ok(QrValidation::invalid("QR code expired"));
        }
        Ok(QrValidation::ok(QrPayload {
            poi_id,
            merchant_id,
        }))
    }

    async fn mark_used(&self, token: &str, user_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let updated = self.lock()?.execute(
            "UPDATE qr_codes SET used = true, used_by = ?, used_at = ?, scans_total = scans_total + 1
             WHERE token = ? AND NOT used",
            params![user_id, millis(now), token],
        )?;
        if updated == 0 {
            return Err(StoreError::Conflict(format!(
                "qr code already used or missing: {token}"
            )));
        }
        Ok(())
    }
}
