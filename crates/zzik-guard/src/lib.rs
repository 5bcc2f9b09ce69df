//! Check-in guards: per-request fraud scoring, history-based anomaly
//! detection, and per-user rate limits.

pub mod anomaly;
pub mod rate_limit;
pub mod scorer;

pub use anomaly::{AnomalyDetector, AnomalyInput, AnomalyResult, AnomalyStats, AnomalyTypeCount};
pub use rate_limit::{Action, LimitExceeded, RateLimitDecision, RateLimiter};
pub use scorer::{
    Assessment, FlagKind, FraudDetails, FraudFlag, FraudInput, FraudResult, Severity, Verdict,
    assess, detect_fraud,
};
