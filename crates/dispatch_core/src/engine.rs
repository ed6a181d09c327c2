//! Wires the registries, pools, and protocols into one service and exposes
//! the transport-facing entry points: `handle_event` for the closed inbound
//! event set and `dispatch_ride` for ride assignment.
//!
//! Every inbound event arrives over some connection; `handle_event` takes
//! that connection's handle so registrations bind to it and teardown can be
//! checked against it. Failures are scoped to a single ride or invite and
//! never poison unrelated pool entries.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::directory::{CachedDirectory, UserDirectory};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::driver_pool::DriverPool;
use crate::error::EngineError;
use crate::events::{DriverId, InboundEvent};
use crate::looking_pool::LookingPool;
use crate::notify::{Notifier, PushGateway};
use crate::peer_match::PeerMatcher;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::store::RideStore;

#[derive(Clone)]
pub struct Engine {
    presence: PresenceRegistry,
    drivers: DriverPool,
    dispatcher: Dispatcher,
    peer: PeerMatcher,
    store: Arc<dyn RideStore>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RideStore>,
        directory: Arc<dyn UserDirectory>,
        push: Arc<dyn PushGateway>,
    ) -> Self {
        let presence = PresenceRegistry::new();
        let drivers = DriverPool::new();
        let looking = LookingPool::new();
        let notifier = Notifier::new(presence.clone(), push);
        let directory: Arc<dyn UserDirectory> = Arc::new(CachedDirectory::new(directory));
        let dispatcher = Dispatcher::new(
            config,
            drivers.clone(),
            store.clone(),
            directory,
            notifier.clone(),
        );
        let peer = PeerMatcher::new(looking, notifier);
        Self {
            presence,
            drivers,
            dispatcher,
            peer,
            store,
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn drivers(&self) -> &DriverPool {
        &self.drivers
    }

    pub fn peer_matcher(&self) -> &PeerMatcher {
        &self.peer
    }

    pub fn store(&self) -> &Arc<dyn RideStore> {
        &self.store
    }

    /// Starts the offer loop for a pending ride.
    pub async fn dispatch_ride(&self, ride_id: &str) -> Result<DispatchOutcome, EngineError> {
        self.dispatcher.dispatch_ride(ride_id, HashSet::new()).await
    }

    /// Same, with drivers to skip from the outset (re-dispatch after an
    /// external cancellation, for instance).
    pub async fn dispatch_ride_excluding(
        &self,
        ride_id: &str,
        exclude: HashSet<DriverId>,
    ) -> Result<DispatchOutcome, EngineError> {
        self.dispatcher.dispatch_ride(ride_id, exclude).await
    }

    /// Applies one inbound event from the given connection.
    pub async fn handle_event(
        &self,
        event: InboundEvent,
        conn: &ConnectionHandle,
    ) -> Result<(), EngineError> {
        match event {
            InboundEvent::Connect { user_id } => {
                info!("user {user_id} connected");
                self.presence.register(user_id, conn.clone()).await;
                Ok(())
            }
            InboundEvent::DriverOnline {
                driver_id,
                location,
            } => {
                let coord = location.to_coord()?;
                info!("driver {driver_id} online");
                self.drivers
                    .set_online(driver_id, conn.clone(), coord)
                    .await;
                Ok(())
            }
            InboundEvent::DriverLocation {
                driver_id,
                location,
            } => {
                let coord = location.to_coord()?;
                self.drivers.update_location(&driver_id, coord).await;
                Ok(())
            }
            InboundEvent::DriverOffline { driver_id } => {
                info!("driver {driver_id} offline");
                self.drivers.set_offline(&driver_id).await;
                self.dispatcher.withdraw_driver(&driver_id).await;
                Ok(())
            }
            InboundEvent::RiderLooking {
                rider_id,
                location,
                destination,
            } => {
                let location = location.to_coord()?;
                let destination = destination.to_coord()?;
                self.peer
                    .start_looking(rider_id, conn.clone(), location, destination)
                    .await;
                Ok(())
            }
            InboundEvent::RiderStopLooking { rider_id } => {
                self.peer.stop_looking(&rider_id).await;
                Ok(())
            }
            InboundEvent::OfferResponse {
                ride_id,
                driver_id,
                decision,
                extra: _,
            } => {
                self.dispatcher
                    .resolve_response(&ride_id, &driver_id, decision)
                    .await
            }
            InboundEvent::Invite {
                from_rider_id,
                to_rider_id,
                details,
            } => self.peer.invite(from_rider_id, to_rider_id, details).await,
            InboundEvent::InviteResponse {
                responder_id,
                from_rider_id,
                decision,
                details,
            } => {
                self.peer
                    .respond(responder_id, from_rider_id, decision, details)
                    .await
            }
            InboundEvent::Disconnect { user_id } => {
                self.disconnect(&user_id, conn.conn_id()).await;
                Ok(())
            }
        }
    }

    /// Tears down everything the departing connection owned. Runs safely
    /// alongside in-flight dispatches: an offered driver's ride is resolved
    /// as withdrawn and re-enters the candidate loop. Entries re-registered
    /// by a newer connection are left alone.
    pub async fn disconnect(&self, user_id: &str, conn_id: Uuid) {
        debug!("connection {conn_id} for {user_id} closing");
        self.presence.unregister(user_id, conn_id).await;
        if self.drivers.remove_conn(user_id, conn_id).await {
            self.dispatcher.withdraw_driver(user_id).await;
        }
        self.peer.handle_disconnect(user_id, conn_id).await;
    }
}
