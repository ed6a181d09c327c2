//! Sequential offer protocol: one outstanding offer per ride, re-dispatched
//! on rejection, timeout, or withdrawal until a driver accepts or the
//! candidates run out.
//!
//! The pending-offer registry is the single source of truth for offer
//! liveness. Responses and the timeout race to remove the registry entry
//! under its lock; whichever side removes it wins, and the loser observes
//! staleness instead of double-resolving the offer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use h3o::LatLng;
use log::{debug, info, warn};
use tokio::sync::{oneshot, Mutex};

use crate::config::EngineConfig;
use crate::directory::{UserDirectory, UserProfile};
use crate::driver_pool::{Candidate, DriverPool};
use crate::error::EngineError;
use crate::events::{Decision, DriverId, OutboundEvent, RideId};
use crate::notify::Notifier;
use crate::store::RideStore;

/// Terminal outcome of a dispatch run. Exhaustion is an outcome rather than
/// an error so callers can fall back to peer matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Assigned { driver_id: DriverId },
    NoDrivers,
}

/// Resolution of a single outstanding offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferReply {
    Accepted,
    Rejected,
    /// The offered driver dropped out of the pool (disconnect or explicit
    /// offline) before answering.
    Withdrawn,
}

#[derive(Debug)]
struct PendingOffer {
    driver_id: DriverId,
    reply_tx: oneshot::Sender<OfferReply>,
}

#[derive(Clone)]
pub struct Dispatcher {
    config: EngineConfig,
    drivers: DriverPool,
    store: Arc<dyn RideStore>,
    directory: Arc<dyn UserDirectory>,
    notifier: Notifier,
    pending: Arc<Mutex<HashMap<RideId, PendingOffer>>>,
}

impl Dispatcher {
    pub fn new(
        config: EngineConfig,
        drivers: DriverPool,
        store: Arc<dyn RideStore>,
        directory: Arc<dyn UserDirectory>,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            drivers,
            store,
            directory,
            notifier,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs the offer loop for a ride until a driver accepts, the
    /// candidates are exhausted, or the attempt bound trips.
    ///
    /// `exclude` seeds the exclusion set; each rejecting, timing-out, or
    /// unreachable driver is added to it and never re-offered this ride.
    pub async fn dispatch_ride(
        &self,
        ride_id: &str,
        mut exclude: HashSet<DriverId>,
    ) -> Result<DispatchOutcome, EngineError> {
        let ride = self.store.get_ride(ride_id)?;
        let pickup = ride.pickup.to_coord()?;

        for attempt in 1..=self.config.max_offer_attempts {
            let Some(candidate) = self.claim_candidate(pickup, &exclude).await else {
                info!(
                    "ride {ride_id}: no available drivers within {:.1} km",
                    self.config.default_radius_km
                );
                return self.finish_unassignable(ride_id, &ride.rider_id).await;
            };
            let driver_id = candidate.driver_id.clone();
            debug!(
                "ride {ride_id}: offering to {driver_id} at {:.2} km (attempt {attempt})",
                candidate.distance_km
            );

            if let Err(err) = self.store.set_offered(ride_id, &driver_id) {
                self.drivers.mark_available(&driver_id).await;
                return Err(err.into());
            }

            let offer = OutboundEvent::RideOffer {
                ride_id: ride_id.to_string(),
                pickup: ride.pickup,
                destination: ride.destination,
            };
            if !self.notifier.send_via(&candidate.handle, offer) {
                warn!("ride {ride_id}: offer to {driver_id} undeliverable, trying next candidate");
                self.drivers.mark_available(&driver_id).await;
                exclude.insert(driver_id);
                continue;
            }

            match self.await_reply(ride_id, &driver_id).await {
                OfferReply::Accepted => {
                    if let Err(err) = self.store.set_accepted(ride_id, &driver_id, Utc::now()) {
                        self.drivers.mark_available(&driver_id).await;
                        return Err(err.into());
                    }
                    self.drivers.mark_on_ride(&driver_id).await;
                    info!("ride {ride_id}: accepted by {driver_id}");
                    let driver = self
                        .directory
                        .profile(&driver_id)
                        .unwrap_or_else(|| UserProfile::unlisted(&driver_id));
                    self.notifier
                        .notify(
                            &ride.rider_id,
                            OutboundEvent::RideAssigned {
                                ride_id: ride_id.to_string(),
                                driver,
                            },
                        )
                        .await;
                    return Ok(DispatchOutcome::Assigned { driver_id });
                }
                OfferReply::Rejected => {
                    debug!("ride {ride_id}: {driver_id} passed");
                    self.drivers.mark_available(&driver_id).await;
                    exclude.insert(driver_id);
                }
                OfferReply::Withdrawn => {
                    debug!("ride {ride_id}: {driver_id} left mid-offer");
                    // The entry is already gone from the pool; excluding the
                    // id guards against an immediate re-registration.
                    exclude.insert(driver_id);
                }
            }
        }

        warn!(
            "ride {ride_id}: giving up after {} offer attempts",
            self.config.max_offer_attempts
        );
        self.finish_unassignable(ride_id, &ride.rider_id).await
    }

    /// Resolves an `offer_response` against the pending registry. Responses
    /// for unknown rides, already-resolved offers, or a different driver
    /// mutate nothing and come back stale.
    pub async fn resolve_response(
        &self,
        ride_id: &str,
        driver_id: &str,
        decision: Decision,
    ) -> Result<(), EngineError> {
        let stale = || EngineError::StaleOffer {
            ride_id: ride_id.to_string(),
            driver_id: driver_id.to_string(),
        };

        let mut pending = self.pending.lock().await;
        if !pending
            .get(ride_id)
            .is_some_and(|offer| offer.driver_id == driver_id)
        {
            return Err(stale());
        }
        let Some(offer) = pending.remove(ride_id) else {
            return Err(stale());
        };
        let reply = match decision {
            Decision::Accept => OfferReply::Accepted,
            Decision::Reject => OfferReply::Rejected,
        };
        // Sent under the registry lock so the timeout race observes the
        // removal and the reply together.
        offer.reply_tx.send(reply).map_err(|_| stale())
    }

    /// Resolves any in-flight offer held by the departing driver as a
    /// withdrawal so its ride immediately re-enters the candidate loop.
    pub async fn withdraw_driver(&self, driver_id: &str) {
        let mut pending = self.pending.lock().await;
        let ride_ids: Vec<RideId> = pending
            .iter()
            .filter(|(_, offer)| offer.driver_id == driver_id)
            .map(|(ride_id, _)| ride_id.clone())
            .collect();
        for ride_id in ride_ids {
            if let Some(offer) = pending.remove(&ride_id) {
                warn!("ride {ride_id}: offered driver {driver_id} disconnected, withdrawing offer");
                let _ = offer.reply_tx.send(OfferReply::Withdrawn);
            }
        }
    }

    /// Whether a ride currently has an outstanding offer.
    pub async fn has_pending_offer(&self, ride_id: &str) -> bool {
        let pending = self.pending.lock().await;
        pending.contains_key(ride_id)
    }

    /// Walks the candidate snapshot claiming the nearest available driver.
    /// Selection is optimistic; the claim re-checks availability under the
    /// pool lock and falls through to the next candidate on conflict.
    async fn claim_candidate(
        &self,
        pickup: LatLng,
        exclude: &HashSet<DriverId>,
    ) -> Option<Candidate> {
        let candidates = self
            .drivers
            .find_nearby(pickup, self.config.default_radius_km, exclude)
            .await;
        for candidate in candidates {
            if self.drivers.mark_offered(&candidate.driver_id).await.is_ok() {
                return Some(candidate);
            }
        }
        None
    }

    async fn finish_unassignable(
        &self,
        ride_id: &str,
        rider_id: &str,
    ) -> Result<DispatchOutcome, EngineError> {
        self.store.set_no_drivers(ride_id)?;
        self.notifier
            .notify(
                rider_id,
                OutboundEvent::RideUnassignable {
                    ride_id: ride_id.to_string(),
                },
            )
            .await;
        Ok(DispatchOutcome::NoDrivers)
    }

    /// Parks the offer in the pending registry and waits for a response or
    /// the timeout, whichever removes the registry entry first.
    async fn await_reply(&self, ride_id: &str, driver_id: &str) -> OfferReply {
        let (reply_tx, mut reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                ride_id.to_string(),
                PendingOffer {
                    driver_id: driver_id.to_string(),
                    reply_tx,
                },
            );
        }

        tokio::select! {
            reply = &mut reply_rx => reply.unwrap_or(OfferReply::Withdrawn),
            _ = tokio::time::sleep(self.config.offer_timeout) => {
                let mut pending = self.pending.lock().await;
                if pending.remove(ride_id).is_some() {
                    debug!("ride {ride_id}: offer to {driver_id} timed out");
                    // Timeout is handled exactly like an explicit rejection.
                    OfferReply::Rejected
                } else {
                    // A response won the race just before the timer; its
                    // reply was sent under the registry lock, so it is
                    // already waiting in the channel.
                    drop(pending);
                    reply_rx.try_recv().unwrap_or(OfferReply::Withdrawn)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::directory::StaticDirectory;
    use crate::events::GeoLocation;
    use crate::notify::NoopPushGateway;
    use crate::presence::{ConnectionHandle, PresenceRegistry};
    use crate::store::{RideRecord, RideStatus};
    use crate::test_support::{connection, offset_north_km, test_origin, FailingRideStore};

    struct Fixture {
        dispatcher: Dispatcher,
        drivers: DriverPool,
        presence: PresenceRegistry,
        store: Arc<FailingRideStore>,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let presence = PresenceRegistry::new();
        let drivers = DriverPool::new();
        let store = Arc::new(FailingRideStore::new());
        let notifier = Notifier::new(presence.clone(), Arc::new(NoopPushGateway));
        let dispatcher = Dispatcher::new(
            config,
            drivers.clone(),
            store.clone(),
            Arc::new(StaticDirectory::new()),
            notifier,
        );
        Fixture {
            dispatcher,
            drivers,
            presence,
            store,
        }
    }

    fn ride_at_origin(ride_id: &str) -> RideRecord {
        RideRecord::new(
            ride_id.to_string(),
            "rider-1".to_string(),
            GeoLocation::from(test_origin()),
            GeoLocation::from(offset_north_km(test_origin(), 12.0)),
        )
    }

    async fn online_driver(
        fx: &Fixture,
        driver_id: &str,
        km_north: f64,
    ) -> (ConnectionHandle, UnboundedReceiver<crate::events::OutboundEvent>) {
        let (handle, rx) = connection();
        fx.drivers
            .set_online(
                driver_id.to_string(),
                handle.clone(),
                offset_north_km(test_origin(), km_north),
            )
            .await;
        (handle, rx)
    }

    async fn expect_offer(
        rx: &mut UnboundedReceiver<crate::events::OutboundEvent>,
        ride_id: &str,
    ) {
        match rx.recv().await {
            Some(OutboundEvent::RideOffer { ride_id: got, .. }) => assert_eq!(got, ride_id),
            other => panic!("expected ride_offer, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reject_timeout_accept_chain_assigns_the_furthest_driver() {
        let fx = fixture(EngineConfig::default());
        fx.store.create_ride(ride_at_origin("r-1")).expect("create ride");

        let (rider_handle, mut rider_rx) = connection();
        fx.presence.register("rider-1".to_string(), rider_handle).await;

        let (_h2, mut rx2) = online_driver(&fx, "d-2km", 2.0).await;
        let (_h5, mut rx5) = online_driver(&fx, "d-5km", 5.0).await;
        let (_h8, mut rx8) = online_driver(&fx, "d-8km", 8.0).await;

        let dispatcher = fx.dispatcher.clone();
        let run = tokio::spawn(async move { dispatcher.dispatch_ride("r-1", HashSet::new()).await });

        // Nearest first; it passes.
        expect_offer(&mut rx2, "r-1").await;
        fx.dispatcher
            .resolve_response("r-1", "d-2km", Decision::Reject)
            .await
            .expect("live offer");

        // Next by distance; never answers, the paused clock runs out the
        // 30 s offer window.
        expect_offer(&mut rx5, "r-1").await;

        // Furthest; accepts.
        expect_offer(&mut rx8, "r-1").await;
        fx.dispatcher
            .resolve_response("r-1", "d-8km", Decision::Accept)
            .await
            .expect("live offer");

        let outcome = run.await.expect("dispatch task").expect("dispatch result");
        assert_eq!(
            outcome,
            DispatchOutcome::Assigned {
                driver_id: "d-8km".to_string()
            }
        );

        let ride = fx.store.get_ride("r-1").expect("ride");
        assert!(matches!(
            ride.status,
            RideStatus::Accepted { ref driver_id, .. } if driver_id == "d-8km"
        ));
        assert_eq!(
            fx.drivers.availability("d-2km").await,
            Some(crate::driver_pool::Availability::Available)
        );
        assert_eq!(
            fx.drivers.availability("d-5km").await,
            Some(crate::driver_pool::Availability::Available)
        );
        assert_eq!(
            fx.drivers.availability("d-8km").await,
            Some(crate::driver_pool::Availability::OnRide)
        );

        match rider_rx.recv().await {
            Some(OutboundEvent::RideAssigned { ride_id, driver }) => {
                assert_eq!(ride_id, "r-1");
                assert_eq!(driver.user_id, "d-8km");
            }
            other => panic!("expected ride_assigned, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_candidates_terminates_without_offers() {
        let fx = fixture(EngineConfig::default());
        fx.store.create_ride(ride_at_origin("r-1")).expect("create ride");

        let (rider_handle, mut rider_rx) = connection();
        fx.presence.register("rider-1".to_string(), rider_handle).await;

        // One driver online but out of radius.
        let (_h, mut far_rx) = online_driver(&fx, "d-far", 40.0).await;

        let outcome = fx
            .dispatcher
            .dispatch_ride("r-1", HashSet::new())
            .await
            .expect("dispatch result");
        assert_eq!(outcome, DispatchOutcome::NoDrivers);
        assert_eq!(
            fx.store.get_ride("r-1").expect("ride").status,
            RideStatus::NoDrivers
        );
        assert!(matches!(
            rider_rx.recv().await,
            Some(OutboundEvent::RideUnassignable { .. })
        ));
        assert!(far_rx.try_recv().is_err(), "no offer should have been sent");
    }

    #[tokio::test(start_paused = true)]
    async fn excluded_driver_is_never_offered_the_same_ride_again() {
        let fx = fixture(EngineConfig::default());
        fx.store.create_ride(ride_at_origin("r-1")).expect("create ride");

        let (_h1, mut rx1) = online_driver(&fx, "d-1", 1.0).await;

        let dispatcher = fx.dispatcher.clone();
        let run = tokio::spawn(async move { dispatcher.dispatch_ride("r-1", HashSet::new()).await });

        expect_offer(&mut rx1, "r-1").await;
        fx.dispatcher
            .resolve_response("r-1", "d-1", Decision::Reject)
            .await
            .expect("live offer");

        // d-1 is available again but excluded for this ride, so the run
        // ends with no drivers rather than a repeat offer.
        let outcome = run.await.expect("dispatch task").expect("dispatch result");
        assert_eq!(outcome, DispatchOutcome::NoDrivers);
        assert!(rx1.try_recv().is_err(), "d-1 must not be re-offered");
        assert_eq!(
            fx.drivers.availability("d-1").await,
            Some(crate::driver_pool::Availability::Available)
        );

        // A different ride may offer to d-1 again.
        fx.store.create_ride(ride_at_origin("r-2")).expect("create ride");
        let dispatcher = fx.dispatcher.clone();
        let run = tokio::spawn(async move { dispatcher.dispatch_ride("r-2", HashSet::new()).await });
        expect_offer(&mut rx1, "r-2").await;
        fx.dispatcher
            .resolve_response("r-2", "d-1", Decision::Accept)
            .await
            .expect("live offer");
        run.await.expect("dispatch task").expect("dispatch result");
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_stale() {
        let fx = fixture(EngineConfig::default());
        fx.store.create_ride(ride_at_origin("r-1")).expect("create ride");

        let (_h1, mut rx1) = online_driver(&fx, "d-1", 1.0).await;

        let dispatcher = fx.dispatcher.clone();
        let run = tokio::spawn(async move { dispatcher.dispatch_ride("r-1", HashSet::new()).await });

        expect_offer(&mut rx1, "r-1").await;
        // Let the offer window lapse; the loop then exhausts candidates.
        let outcome = run.await.expect("dispatch task").expect("dispatch result");
        assert_eq!(outcome, DispatchOutcome::NoDrivers);

        let err = fx
            .dispatcher
            .resolve_response("r-1", "d-1", Decision::Accept)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StaleOffer { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn response_from_the_wrong_driver_is_stale() {
        let fx = fixture(EngineConfig::default());
        fx.store.create_ride(ride_at_origin("r-1")).expect("create ride");

        let (_h1, mut rx1) = online_driver(&fx, "d-1", 1.0).await;
        let (_h2, _rx2) = online_driver(&fx, "d-2", 2.0).await;

        let dispatcher = fx.dispatcher.clone();
        let run = tokio::spawn(async move { dispatcher.dispatch_ride("r-1", HashSet::new()).await });

        expect_offer(&mut rx1, "r-1").await;
        let err = fx
            .dispatcher
            .resolve_response("r-1", "d-2", Decision::Accept)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StaleOffer { .. }));

        // The real candidate can still answer.
        fx.dispatcher
            .resolve_response("r-1", "d-1", Decision::Accept)
            .await
            .expect("live offer");
        let outcome = run.await.expect("dispatch task").expect("dispatch result");
        assert_eq!(
            outcome,
            DispatchOutcome::Assigned {
                driver_id: "d-1".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn withdrawal_moves_the_offer_to_the_next_candidate() {
        let fx = fixture(EngineConfig::default());
        fx.store.create_ride(ride_at_origin("r-1")).expect("create ride");

        let (_h1, mut rx1) = online_driver(&fx, "d-1", 1.0).await;
        let (_h2, mut rx2) = online_driver(&fx, "d-2", 2.0).await;

        let dispatcher = fx.dispatcher.clone();
        let run = tokio::spawn(async move { dispatcher.dispatch_ride("r-1", HashSet::new()).await });

        expect_offer(&mut rx1, "r-1").await;
        // The offered driver drops off the pool mid-offer.
        fx.drivers.set_offline("d-1").await;
        fx.dispatcher.withdraw_driver("d-1").await;

        // Its late answer is stale, and the next candidate already holds
        // the offer.
        let err = fx
            .dispatcher
            .resolve_response("r-1", "d-1", Decision::Accept)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StaleOffer { .. }));

        expect_offer(&mut rx2, "r-1").await;
        fx.dispatcher
            .resolve_response("r-1", "d-2", Decision::Accept)
            .await
            .expect("live offer");
        let outcome = run.await.expect("dispatch task").expect("dispatch result");
        assert_eq!(
            outcome,
            DispatchOutcome::Assigned {
                driver_id: "d-2".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn undeliverable_offer_falls_through_to_the_next_candidate() {
        let fx = fixture(EngineConfig::default());
        fx.store.create_ride(ride_at_origin("r-1")).expect("create ride");

        // Nearest driver's connection is already gone.
        let (dead_handle, dead_rx) = connection();
        drop(dead_rx);
        fx.drivers
            .set_online(
                "d-dead".to_string(),
                dead_handle,
                offset_north_km(test_origin(), 1.0),
            )
            .await;
        let (_h2, mut rx2) = online_driver(&fx, "d-2", 2.0).await;

        let dispatcher = fx.dispatcher.clone();
        let run = tokio::spawn(async move { dispatcher.dispatch_ride("r-1", HashSet::new()).await });

        expect_offer(&mut rx2, "r-1").await;
        fx.dispatcher
            .resolve_response("r-1", "d-2", Decision::Accept)
            .await
            .expect("live offer");
        let outcome = run.await.expect("dispatch task").expect("dispatch result");
        assert_eq!(
            outcome,
            DispatchOutcome::Assigned {
                driver_id: "d-2".to_string()
            }
        );
        // The unreachable driver was released back to available.
        assert_eq!(
            fx.drivers.availability("d-dead").await,
            Some(crate::driver_pool::Availability::Available)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_reverts_the_claimed_driver() {
        let fx = fixture(EngineConfig::default());
        fx.store.create_ride(ride_at_origin("r-1")).expect("create ride");
        fx.store.fail_set_offered(true);

        let (_h1, _rx1) = online_driver(&fx, "d-1", 1.0).await;

        let err = fx
            .dispatcher
            .dispatch_ride("r-1", HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
        assert_eq!(
            fx.drivers.availability("d-1").await,
            Some(crate::driver_pool::Availability::Available)
        );
        assert!(!fx.dispatcher.has_pending_offer("r-1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_persistence_failure_reverts_the_driver_and_surfaces() {
        let fx = fixture(EngineConfig::default());
        fx.store.create_ride(ride_at_origin("r-1")).expect("create ride");
        fx.store.fail_set_accepted(true);

        let (_h1, mut rx1) = online_driver(&fx, "d-1", 1.0).await;

        let dispatcher = fx.dispatcher.clone();
        let run = tokio::spawn(async move { dispatcher.dispatch_ride("r-1", HashSet::new()).await });

        expect_offer(&mut rx1, "r-1").await;
        fx.dispatcher
            .resolve_response("r-1", "d-1", Decision::Accept)
            .await
            .expect("live offer");

        let err = run.await.expect("dispatch task").unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
        assert_eq!(
            fx.drivers.availability("d-1").await,
            Some(crate::driver_pool::Availability::Available)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_bound_caps_churning_candidate_pools() {
        let fx = fixture(EngineConfig::default().with_max_offer_attempts(2));
        fx.store.create_ride(ride_at_origin("r-1")).expect("create ride");

        let (_h1, mut rx1) = online_driver(&fx, "d-1", 1.0).await;
        let (_h2, mut rx2) = online_driver(&fx, "d-2", 2.0).await;
        let (_h3, _rx3) = online_driver(&fx, "d-3", 3.0).await;

        let dispatcher = fx.dispatcher.clone();
        let run = tokio::spawn(async move { dispatcher.dispatch_ride("r-1", HashSet::new()).await });

        expect_offer(&mut rx1, "r-1").await;
        fx.dispatcher
            .resolve_response("r-1", "d-1", Decision::Reject)
            .await
            .expect("live offer");
        expect_offer(&mut rx2, "r-1").await;
        fx.dispatcher
            .resolve_response("r-1", "d-2", Decision::Reject)
            .await
            .expect("live offer");

        // Third candidate exists, but the bound trips first.
        let outcome = run.await.expect("dispatch task").expect("dispatch result");
        assert_eq!(outcome, DispatchOutcome::NoDrivers);
        assert_eq!(
            fx.store.get_ride("r-1").expect("ride").status,
            RideStatus::NoDrivers
        );
    }
}
