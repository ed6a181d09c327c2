//! Online driver registry and candidate search.
//!
//! Entries are an ephemeral presence cache: rebuilt from `driver_online`
//! announcements on reconnect, never persisted. Candidate selection is a
//! snapshot scan; claiming a candidate re-checks availability under the
//! pool lock, so a driver that transitioned between scan and claim is
//! skipped rather than double-booked.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use h3o::LatLng;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::events::DriverId;
use crate::presence::ConnectionHandle;
use crate::spatial::distance_km;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Offered,
    OnRide,
}

#[derive(Debug, Clone)]
pub struct DriverEntry {
    pub driver_id: DriverId,
    pub handle: ConnectionHandle,
    pub location: LatLng,
    pub availability: Availability,
}

/// A driver eligible for an offer, with the distance used to rank it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub driver_id: DriverId,
    pub handle: ConnectionHandle,
    pub distance_km: f64,
}

/// The candidate's availability changed between the scan and the claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimError;

#[derive(Debug, Clone, Default)]
pub struct DriverPool {
    inner: Arc<Mutex<HashMap<DriverId, DriverEntry>>>,
}

impl DriverPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the driver's entry with availability
    /// `Available`. A repeated announcement is an idempotent re-registration.
    pub async fn set_online(&self, driver_id: DriverId, handle: ConnectionHandle, location: LatLng) {
        let mut inner = self.inner.lock().await;
        inner.insert(
            driver_id.clone(),
            DriverEntry {
                driver_id,
                handle,
                location,
                availability: Availability::Available,
            },
        );
    }

    pub async fn set_offline(&self, driver_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner.remove(driver_id).is_some()
    }

    /// Removes the entry only when it still belongs to the given connection;
    /// a stale teardown must not evict a re-registered driver.
    pub async fn remove_conn(&self, driver_id: &str, conn_id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        if inner
            .get(driver_id)
            .is_some_and(|entry| entry.handle.conn_id() == conn_id)
        {
            inner.remove(driver_id);
            return true;
        }
        false
    }

    /// No-op when the driver is not online.
    pub async fn update_location(&self, driver_id: &str, location: LatLng) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.get_mut(driver_id) {
            entry.location = location;
        }
    }

    /// Available drivers within `radius_km` of `origin`, excluding
    /// `exclude`, ascending by distance with ties broken by driver id.
    pub async fn find_nearby(
        &self,
        origin: LatLng,
        radius_km: f64,
        exclude: &HashSet<DriverId>,
    ) -> Vec<Candidate> {
        let inner = self.inner.lock().await;
        let mut candidates: Vec<Candidate> = inner
            .values()
            .filter(|entry| entry.availability == Availability::Available)
            .filter(|entry| !exclude.contains(&entry.driver_id))
            .filter_map(|entry| {
                let distance = distance_km(origin, entry.location);
                (distance <= radius_km).then(|| Candidate {
                    driver_id: entry.driver_id.clone(),
                    handle: entry.handle.clone(),
                    distance_km: distance,
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.distance_km
                .partial_cmp(&b.distance_km)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });
        candidates
    }

    /// Claims the driver for an offer. Fails unless the entry is currently
    /// `Available`; while claimed, the driver is invisible to every other
    /// ride's candidate search.
    pub async fn mark_offered(&self, driver_id: &str) -> Result<(), ClaimError> {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(driver_id) {
            Some(entry) if entry.availability == Availability::Available => {
                entry.availability = Availability::Offered;
                Ok(())
            }
            _ => Err(ClaimError),
        }
    }

    /// Idempotent no-op when the driver is absent.
    pub async fn mark_available(&self, driver_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.get_mut(driver_id) {
            entry.availability = Availability::Available;
        }
    }

    /// Idempotent no-op when the driver is absent.
    pub async fn mark_on_ride(&self, driver_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.get_mut(driver_id) {
            entry.availability = Availability::OnRide;
        }
    }

    pub async fn availability(&self, driver_id: &str) -> Option<Availability> {
        let inner = self.inner.lock().await;
        inner.get(driver_id).map(|entry| entry.availability)
    }

    pub async fn online_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.len()
    }
}
