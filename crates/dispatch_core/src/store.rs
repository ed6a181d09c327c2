//! Ride record store seam.
//!
//! The store is the source of truth for terminal ride states; the engine is
//! the sole writer of the assignment transitions but treats its own pools
//! as rebuildable caches. Production deployments implement [`RideStore`]
//! over their document store; [`InMemoryRideStore`] backs tests and local
//! runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{DriverId, GeoLocation, RideId, RiderId};

/// Assignment state of a ride, as recorded by the dispatch protocol.
/// `Accepted` is terminal here; the remaining lifecycle (arrived, started,
/// completed) is owned outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Offered {
        driver_id: DriverId,
    },
    Accepted {
        driver_id: DriverId,
        accepted_at: DateTime<Utc>,
    },
    NoDrivers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRecord {
    pub ride_id: RideId,
    pub rider_id: RiderId,
    pub pickup: GeoLocation,
    pub destination: GeoLocation,
    pub status: RideStatus,
}

impl RideRecord {
    pub fn new(
        ride_id: RideId,
        rider_id: RiderId,
        pickup: GeoLocation,
        destination: GeoLocation,
    ) -> Self {
        Self {
            ride_id,
            rider_id,
            pickup,
            destination,
            status: RideStatus::Pending,
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    NotFound(RideId),
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(ride_id) => write!(f, "ride {ride_id} not found"),
            StoreError::Backend(msg) => write!(f, "backend: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub trait RideStore: Send + Sync {
    fn create_ride(&self, record: RideRecord) -> Result<(), StoreError>;
    fn get_ride(&self, ride_id: &str) -> Result<RideRecord, StoreError>;
    fn set_offered(&self, ride_id: &str, driver_id: &str) -> Result<(), StoreError>;
    fn set_accepted(
        &self,
        ride_id: &str,
        driver_id: &str,
        accepted_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    fn set_no_drivers(&self, ride_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRideStore {
    rides: Mutex<HashMap<RideId, RideRecord>>,
}

impl InMemoryRideStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_ride<T>(
        &self,
        ride_id: &str,
        mutate: impl FnOnce(&mut RideRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut rides = self.rides.lock().unwrap_or_else(PoisonError::into_inner);
        match rides.get_mut(ride_id) {
            Some(record) => Ok(mutate(record)),
            None => Err(StoreError::NotFound(ride_id.to_string())),
        }
    }
}

impl RideStore for InMemoryRideStore {
    fn create_ride(&self, record: RideRecord) -> Result<(), StoreError> {
        let mut rides = self.rides.lock().unwrap_or_else(PoisonError::into_inner);
        rides.insert(record.ride_id.clone(), record);
        Ok(())
    }

    fn get_ride(&self, ride_id: &str) -> Result<RideRecord, StoreError> {
        let rides = self.rides.lock().unwrap_or_else(PoisonError::into_inner);
        rides
            .get(ride_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(ride_id.to_string()))
    }

    fn set_offered(&self, ride_id: &str, driver_id: &str) -> Result<(), StoreError> {
        self.with_ride(ride_id, |record| {
            record.status = RideStatus::Offered {
                driver_id: driver_id.to_string(),
            };
        })
    }

    fn set_accepted(
        &self,
        ride_id: &str,
        driver_id: &str,
        accepted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_ride(ride_id, |record| {
            record.status = RideStatus::Accepted {
                driver_id: driver_id.to_string(),
                accepted_at,
            };
        })
    }

    fn set_no_drivers(&self, ride_id: &str) -> Result<(), StoreError> {
        self.with_ride(ride_id, |record| {
            record.status = RideStatus::NoDrivers;
        })
    }
}
