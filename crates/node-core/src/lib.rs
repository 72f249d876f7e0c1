//! Shared domain types and node identity for the gridnode platform.

pub mod identity;
pub mod types;

pub use identity::{verify_hex, NodeIdentity};
pub use types::{Reservation, ReservationResult, ReservationType, ResourceUnits, ResultState};
