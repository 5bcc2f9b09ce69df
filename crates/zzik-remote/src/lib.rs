//! Remote collaborators: the QR validation and streak services behind the
//! store traits they stand in for.

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{QrClient, RemoteError, StreakClient};
