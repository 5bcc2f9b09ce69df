//! Shared domain types for check-ins, POIs, subscriptions, and campaigns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// A bare latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Build a point, rejecting out-of-range or non-finite values.
    pub fn new(lat: f64, lng: f64) -> Result<Self, CoreError> {
        let point = Self { lat, lng };
        point.validate()?;
        Ok(point)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let lat_ok = self.lat.is_finite() && (-90.0..=90.0).contains(&self.lat);
        let lng_ok = self.lng.is_finite() && (-180.0..=180.0).contains(&self.lng);
        if lat_ok && lng_ok {
            Ok(())
        } else {
            Err(CoreError::InvalidCoordinate {
                lat: self.lat,
                lng: self.lng,
            })
        }
    }
}

/// A device-reported position with its GPS accuracy radius and capture time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
    pub timestamp: DateTime<Utc>,
}

impl Coordinate {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }

    /// Range-check lat/lng and require a finite, non-negative accuracy.
    ///
    /// Out-of-range input is a hard input error, never a fraud signal.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.point().validate()?;
        if !self.accuracy_m.is_finite() || self.accuracy_m < 0.0 {
            return Err(CoreError::InvalidAccuracy(self.accuracy_m));
        }
        Ok(())
    }
}

/// A point of interest eligible for check-ins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    /// Pre-computed spatial cell at the proximity resolution, if stored.
    #[serde(default)]
    pub cell: Option<String>,
    /// Campaign funding check-ins at this POI, if any.
    #[serde(default)]
    pub campaign_id: Option<String>,
}

impl Poi {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckInMethod {
    Gps,
    QrCode,
    Hybrid,
}

impl CheckInMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gps => "GPS",
            Self::QrCode => "QR_CODE",
            Self::Hybrid => "HYBRID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GPS" => Some(Self::Gps),
            "QR_CODE" => Some(Self::QrCode),
            "HYBRID" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Premium => "PREMIUM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FREE" => Some(Self::Free),
            "PREMIUM" => Some(Self::Premium),
            _ => None,
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Trialing => "TRIALING",
            Self::PastDue => "PAST_DUE",
            Self::Canceled => "CANCELED",
            Self::Incomplete => "INCOMPLETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "TRIALING" => Some(Self::Trialing),
            "PAST_DUE" => Some(Self::PastDue),
            "CANCELED" => Some(Self::Canceled),
            "INCOMPLETE" => Some(Self::Incomplete),
            _ => None,
        }
    }

    /// Whether a paid subscription in this state may check in.
    pub fn allows_check_in(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

/// Subscription snapshot as seen by the check-in flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub check_ins_this_month: u32,
    /// Monthly check-in allowance. `None` means unlimited.
    pub check_in_limit: Option<u32>,
}

impl Subscription {
    /// The implicit subscription of a user with no stored record.
    pub fn implicit_free(limit: u32) -> Self {
        Self {
            tier: Tier::Free,
            status: SubscriptionStatus::Active,
            check_ins_this_month: 0,
            check_in_limit: Some(limit),
        }
    }

    /// Check-ins left this month after `extra` more are used. `None` = unlimited.
    pub fn remaining_after(&self, extra: u32) -> Option<u32> {
        self.check_in_limit
            .map(|limit| limit.saturating_sub(self.check_ins_this_month + extra))
    }
}

/// The durable record of one accepted check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInRecord {
    pub id: String,
    pub user_id: String,
    pub poi_id: String,
    pub location: GeoPoint,
    pub accuracy_m: f64,
    /// Distance to the POI, rounded to whole metres.
    pub distance_m: u32,
    pub fraud_score: f64,
    pub verified: bool,
    pub tokens_earned: u64,
    pub method: CheckInMethod,
    pub tier: Tier,
    pub cell: Option<String>,
    pub qr_token: Option<String>,
    pub campaign_id: Option<String>,
    /// Points credited by settlement; `None` until settled.
    pub points_earned: Option<i64>,
    /// Opaque client device payload, stored but never interpreted.
    pub device_info: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// The slice of a past check-in the fraud and anomaly layers read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub location: GeoPoint,
    pub checked_at: DateTime<Utc>,
    pub poi_id: String,
    pub fraud_score: Option<f64>,
    pub cell: Option<String>,
}

impl From<&CheckInRecord> for HistoryEntry {
    fn from(record: &CheckInRecord) -> Self {
        Self {
            location: record.location,
            checked_at: record.checked_at,
            poi_id: record.poi_id.clone(),
            fraud_score: Some(record.fraud_score),
            cell: record.cell.clone(),
        }
    }
}

/// Fractions of a CPCV budget paid to each pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub user: f64,
    pub platform: f64,
    pub network: f64,
}

impl Default for Distribution {
    fn default() -> Self {
        Self {
            user: 0.7,
            platform: 0.25,
            network: 0.05,
        }
    }
}

/// A sponsor campaign paying a fixed amount per verified check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub sponsor_wallet_id: Option<String>,
    pub cpcv_amount: i64,
    #[serde(default)]
    pub distribution: Distribution,
    /// Total budget. `None` means uncapped.
    #[serde(default)]
    pub budget_total: Option<i64>,
    #[serde(default)]
    pub budget_spent: i64,
    #[serde(default)]
    pub total_check_ins: u64,
}

impl Campaign {
    pub fn can_fund(&self, amount: i64) -> bool {
        self.budget_total
            .is_none_or(|total| self.budget_spent + amount <= total)
    }
}
