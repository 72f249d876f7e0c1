use gridnode_core::types::{ReservationType, ResourceUnits};
use thiserror::Error;

/// Failure classes the chain records into Error-state results (or surfaces
/// directly, for decommission of an id the node never saw).
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid reservation payload: {0}")]
    Validation(String),

    #[error("capacity exceeded: requested [{requested}], available [{available}]")]
    CapacityExceeded {
        requested: ResourceUnits,
        available: ResourceUnits,
    },

    #[error("unknown reservation type '{}'", .0.as_str())]
    UnknownType(ReservationType),

    #[error("unknown reservation '{0}'")]
    UnknownReservation(String),
}
