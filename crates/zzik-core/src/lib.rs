pub mod cell;
pub mod clock;
pub mod config;
mod error;
pub mod geo;
pub mod types;

pub use cell::{CellId, DEFAULT_RESOLUTION, UNRELATED_CELLS};
pub use clock::{Clock, ManualClock, SystemClock, after_secs, before_hours};
pub use config::{EngineConfig, MAX_WINDOW_SECS, NamedLimit, RateLimitConfig};
pub use error::CoreError;
pub use geo::distance_meters;
pub use types::{
    Campaign, CheckInMethod, CheckInRecord, Coordinate, Distribution, GeoPoint, HistoryEntry, Poi,
    Subscription, SubscriptionStatus, Tier,
};
