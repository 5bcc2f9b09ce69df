//! Storage layer: persistence seams, in-memory stores, shared counters and
//! cache, and the DuckDB-backed durable store.

mod cache;
mod counter;
mod error;
mod memory;
pub mod records;
pub mod repo;

pub use cache::{KvCache, MemoryCache};
pub use counter::{CounterHit, CounterStore, MemoryCounterStore};
pub use error::{CacheError, CounterError, StoreError};
pub use memory::MemoryStore;
pub use repo::{
    AnomalyLog, AnomalyReport, CheckInCommit, CheckInLedger, HistoryStore, NoopStreak, PoiStore,
    QrPayload, QrValidation, QrVerifier, SettlementLedger, SettlementSplit, SplitFn, StreakEvent,
    StreakHook, StreakOutcome, SubscriptionChange, SubscriptionStore, TokenAward,
};

#[cfg(feature = "duckdb")]
mod duck;
#[cfg(feature = "duckdb")]
pub use duck::DuckStore;
