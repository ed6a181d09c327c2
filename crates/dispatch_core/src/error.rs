//! Errors surfaced to callers of the engine.
//!
//! Staleness and exhaustion are deliberately split: a stale response is an
//! [`EngineError`] (nothing was mutated, the responder is told so), while
//! "no drivers" is a normal [`crate::dispatch::DispatchOutcome`] so callers
//! can fall back to peer matching.

use std::fmt;

use h3o::error::InvalidLatLng;

use crate::events::{DriverId, RideId, RiderId};
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    /// The ride store refused a transition; any in-memory mark taken for the
    /// transition has already been rolled back.
    Store(StoreError),
    /// An offer response referencing an offer that no longer exists or was
    /// made to a different driver.
    StaleOffer { ride_id: RideId, driver_id: DriverId },
    /// An invite response referencing an invite that no longer matches.
    StaleInvite {
        responder_id: RiderId,
        from_rider_id: RiderId,
    },
    /// A companion invite from a rider who is not in the looking pool.
    NotLooking { rider_id: RiderId },
    /// Coordinates failed boundary validation.
    InvalidLocation(InvalidLatLng),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Store(err) => write!(f, "ride store: {err}"),
            EngineError::StaleOffer { ride_id, driver_id } => {
                write!(f, "no outstanding offer for ride {ride_id} held by {driver_id}")
            }
            EngineError::StaleInvite {
                responder_id,
                from_rider_id,
            } => write!(
                f,
                "no pending invite from {from_rider_id} on {responder_id}"
            ),
            EngineError::NotLooking { rider_id } => {
                write!(f, "rider {rider_id} is not in the looking pool")
            }
            EngineError::InvalidLocation(err) => write!(f, "invalid location: {err}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Store(err)
    }
}

impl From<InvalidLatLng> for EngineError {
    fn from(err: InvalidLatLng) -> Self {
        EngineError::InvalidLocation(err)
    }
}
