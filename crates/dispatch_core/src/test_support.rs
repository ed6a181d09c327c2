//! Shared test scaffolding: fake connections, coordinate helpers, and a
//! ride store that fails on demand.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use h3o::LatLng;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::events::OutboundEvent;
use crate::presence::ConnectionHandle;
use crate::store::{InMemoryRideStore, RideRecord, RideStore, StoreError};

/// A point in the San Francisco Bay Area used as the pickup origin across
/// test files.
pub fn test_origin() -> LatLng {
    LatLng::new(37.7749, -122.4194).expect("test origin should be a valid coordinate")
}

/// Coordinate `km` kilometers due north of `origin`, for placing drivers at
/// known distances. One degree of latitude is ~111.2 km everywhere.
pub fn offset_north_km(origin: LatLng, km: f64) -> LatLng {
    LatLng::new(origin.lat() + km / 111.2, origin.lng())
        .expect("offset should stay within valid latitudes")
}

/// A fake connection: the handle the engine sees and the receiver a test
/// observes delivered events on.
pub fn connection() -> (ConnectionHandle, UnboundedReceiver<OutboundEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConnectionHandle::new(tx), rx)
}

/// Wraps [`InMemoryRideStore`] and fails selected transitions, for
/// exercising the rollback paths.
#[derive(Debug, Default)]
pub struct FailingRideStore {
    inner: InMemoryRideStore,
    fail_set_offered: AtomicBool,
    fail_set_accepted: AtomicBool,
}

impl FailingRideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_set_offered(&self, fail: bool) {
        self.fail_set_offered.store(fail, Ordering::SeqCst);
    }

    pub fn fail_set_accepted(&self, fail: bool) {
        self.fail_set_accepted.store(fail, Ordering::SeqCst);
    }
}

impl RideStore for FailingRideStore {
    fn create_ride(&self, record: RideRecord) -> Result<(), StoreError> {
        self.inner.create_ride(record)
    }

    fn get_ride(&self, ride_id: &str) -> Result<RideRecord, StoreError> {
        self.inner.get_ride(ride_id)
    }

    fn set_offered(&self, ride_id: &str, driver_id: &str) -> Result<(), StoreError> {
        if self.fail_set_offered.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected set_offered failure".to_string()));
        }
        self.inner.set_offered(ride_id, driver_id)
    }

    fn set_accepted(
        &self,
        ride_id: &str,
        driver_id: &str,
        accepted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.fail_set_accepted.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected set_accepted failure".to_string()));
        }
        self.inner.set_accepted(ride_id, driver_id, accepted_at)
    }

    fn set_no_drivers(&self, ride_id: &str) -> Result<(), StoreError> {
        self.inner.set_no_drivers(ride_id)
    }
}
