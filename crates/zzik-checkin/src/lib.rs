//! Check-in orchestration for zzik: the request state machine, its
//! idempotent front door, CPCV settlement, and the client error taxonomy.

mod error;
pub mod idempotency;
pub mod orchestrator;
pub mod settlement;

pub use error::{CheckInError, ErrorBody, Rejection};
pub use idempotency::IdempotentCheckIn;
pub use orchestrator::{
    CheckInRequest, CheckInResponse, CheckInService, CheckInStats, Collaborators, LocationInput,
    QrMarking,
};
pub use settlement::{SettlementService, split_cpcv};
