use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use zzik_core::{CoreError, SubscriptionStatus};
use zzik_store::StoreError;

/// An expected business outcome that ends a check-in attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("rate limit {limit:?} exceeded until {reset_at}")]
    RateLimitExceeded {
        limit: String,
        reset_at: DateTime<Utc>,
    },

    #[error("monthly check-in limit reached ({used}/{limit})")]
    TierLimitReached { limit: u32, used: u32 },

    #[error("subscription is {}", .status.as_str())]
    SubscriptionInactive { status: SubscriptionStatus },

    #[error("account suspended")]
    AccountSuspended { anomalies: Vec<String> },

    #[error("poi not found: {poi_id}")]
    PoiNotFound { poi_id: String },

    #[error("invalid qr code: {reason}")]
    InvalidQrCode { reason: String },

    #[error("qr code belongs to another poi")]
    QrPoiMismatch,

    #[error("too far from poi: {distance_m}m > {required_m}m")]
    TooFar { distance_m: u32, required_m: u32 },

    #[error("fraud score {score:.2} over threshold")]
    Fraud { score: f64 },
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::TierLimitReached { .. } => "tier_limit_reached",
            Self::SubscriptionInactive { .. } => "subscription_inactive",
            Self::AccountSuspended { .. } => "account_suspended",
            Self::PoiNotFound { .. } => "poi_not_found",
            Self::InvalidQrCode { .. } => "invalid_qr_code",
            Self::QrPoiMismatch => "qr_poi_mismatch",
            Self::TooFar { .. } => "too_far",
            Self::Fraud { .. } => "fraud",
        }
    }

    /// Client-facing message.
    pub fn message(&self) -> String {
        match self {
            Self::RateLimitExceeded { reset_at, .. } => format!(
                "Too many check-in attempts. Please try again after {}",
                reset_at.format("%H:%M:%S UTC")
            ),
            Self::TierLimitReached { .. } => {
                "Monthly check-in limit reached. Upgrade to continue.".into()
            }
            Self::SubscriptionInactive { status } => match status {
                SubscriptionStatus::PastDue => "Payment required to continue".into(),
                _ => "Subscription canceled".into(),
            },
            Self::AccountSuspended { .. } => {
                "Account temporarily suspended due to suspicious activity".into()
            }
            Self::PoiNotFound { .. } => "Location not found".into(),
            Self::InvalidQrCode { reason } => reason.clone(),
            Self::QrPoiMismatch => "QR code is for a different location".into(),
            Self::TooFar { distance_m, required_m } => {
                format!("You are {distance_m}m away. Move within {required_m}m to check in.")
            }
            Self::Fraud { .. } => "Location verification failed. Try using QR code instead.".into(),
        }
    }

    /// Structured details for client UX. Never carries internal flag weights.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::RateLimitExceeded { limit, reset_at } => {
                Some(json!({ "limit": limit, "reset_at": reset_at }))
            }
            Self::TierLimitReached { limit, used } => Some(json!({
                "tier": "FREE",
                "limit": limit,
                "used": used,
                "upgrade_required": true,
            })),
            Self::SubscriptionInactive { status } => Some(json!({ "status": status })),
            Self::AccountSuspended { anomalies } => Some(json!({
                "anomalies": anomalies,
                "contact_support": true,
            })),
            Self::InvalidQrCode { .. } => Some(json!({ "qr_code_error": true })),
            Self::TooFar {
                distance_m,
                required_m,
            } => Some(json!({ "distance": distance_m, "required": required_m })),
            Self::Fraud { score } => Some(json!({ "fraud": score })),
            Self::PoiNotFound { .. } | Self::QrPoiMismatch => None,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::RateLimitExceeded { .. } => 429,
            Self::AccountSuspended { .. } => 403,
            _ => 400,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckInError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("check-in rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<CoreError> for CheckInError {
    fn from(e: CoreError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

/// Wire shape of a failed check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl CheckInError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Rejected(r) => r.code(),
            Self::Store(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::Rejected(r) => r.http_status(),
            Self::Store(_) => 500,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }

    /// Client body. Store faults are reduced to a generic message.
    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::InvalidInput(msg) => ErrorBody {
                code: self.code().into(),
                message: msg.clone(),
                details: None,
            },
            Self::Rejected(r) => ErrorBody {
                code: r.code().into(),
                message: r.message(),
                details: r.details(),
            },
            Self::Store(_) => ErrorBody {
                code: self.code().into(),
                message: "Internal server error".into(),
                details: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_fault_does_not_leak() {
        let err = CheckInError::from(StoreError::Unavailable("db at 10.0.0.5 refused".into()));
        let body = err.to_body();
        assert_eq!(body.code, "INTERNAL_ERROR");
        assert_eq!(body.message, "Internal server error");
        assert!(body.details.is_none());
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn rejection_body_has_code_and_details() {
        let err = CheckInError::from(Rejection::TooFar {
            distance_m: 120,
            required_m: 50,
        });
        let body = err.to_body();
        assert_eq!(body.code, "too_far");
        assert_eq!(body.details.unwrap()["distance"], 120);
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn status_codes() {
        let limited = Rejection::RateLimitExceeded {
            limit: "hourly".into(),
            reset_at: Utc::now(),
        };
        assert_eq!(limited.http_status(), 429);
        let suspended = Rejection::AccountSuspended { anomalies: vec![] };
        assert_eq!(suspended.http_status(), 403);
        assert_eq!(Rejection::QrPoiMismatch.http_status(), 400);
    }

    #[test]
    fn invalid_coordinate_is_input_error() {
        let err = CheckInError::from(CoreError::InvalidCoordinate {
            lat: 95.0,
            lng: 0.0,
        });
        assert_eq!(err.code(), "INVALID_INPUT");
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn body_roundtrips_as_json() {
        let body = CheckInError::from(Rejection::QrPoiMismatch).to_body();
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("details"));
        let back: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back, body);
    }
}
