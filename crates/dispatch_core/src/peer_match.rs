//! Rider-to-rider companion matching: a two-phase invite/respond handshake
//! over the looking pool.
//!
//! An accepted handshake mints a session id both riders receive; the
//! session bootstraps their direct channel and both entries leave the pool
//! in the same step, so later invites aimed at either rider report the
//! target unavailable.

use h3o::LatLng;
use log::{debug, info};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{Decision, OutboundEvent, RiderId, SessionId};
use crate::looking_pool::{InviteError, LookingEntry, LookingPool};
use crate::notify::Notifier;
use crate::presence::ConnectionHandle;

#[derive(Clone)]
pub struct PeerMatcher {
    looking: LookingPool,
    notifier: Notifier,
}

impl PeerMatcher {
    pub fn new(looking: LookingPool, notifier: Notifier) -> Self {
        Self { looking, notifier }
    }

    pub fn pool(&self) -> &LookingPool {
        &self.looking
    }

    pub async fn start_looking(
        &self,
        rider_id: RiderId,
        handle: ConnectionHandle,
        location: LatLng,
        destination: LatLng,
    ) {
        debug!("rider {rider_id} is looking for a companion");
        self.looking
            .start_looking(rider_id, handle, location, destination)
            .await;
    }

    /// Removes the rider from the pool and fails any invite they still have
    /// outstanding.
    pub async fn stop_looking(&self, rider_id: &str) {
        if self.looking.remove(rider_id).await.is_some() {
            debug!("rider {rider_id} stopped looking");
            self.fail_outstanding_invites(rider_id).await;
        }
    }

    /// Connection teardown: same as [`stop_looking`](Self::stop_looking)
    /// but only when the pool entry still belongs to the closed connection.
    pub async fn handle_disconnect(&self, rider_id: &str, conn_id: Uuid) {
        if self.looking.remove_conn(rider_id, conn_id).await.is_some() {
            self.fail_outstanding_invites(rider_id).await;
        }
    }

    /// Phase one: records the invite on the target and notifies them. A
    /// missing target is reported back to the sender, not treated as an
    /// error.
    pub async fn invite(
        &self,
        from_rider_id: RiderId,
        to_rider_id: RiderId,
        details: Value,
    ) -> Result<(), EngineError> {
        match self
            .looking
            .record_invite(&from_rider_id, &to_rider_id, details.clone())
            .await
        {
            Ok(target_handle) => {
                debug!("invite: {from_rider_id} -> {to_rider_id}");
                self.notifier.send_via(
                    &target_handle,
                    OutboundEvent::InviteReceived {
                        from_rider_id,
                        details,
                    },
                );
                Ok(())
            }
            Err(InviteError::TargetNotLooking) => {
                debug!("invite: {from_rider_id} -> {to_rider_id}, target unavailable");
                self.notifier
                    .notify(
                        &from_rider_id,
                        OutboundEvent::InviteTargetUnavailable {
                            rider_id: to_rider_id,
                        },
                    )
                    .await;
                Ok(())
            }
            Err(InviteError::SenderNotLooking) => Err(EngineError::NotLooking {
                rider_id: from_rider_id,
            }),
        }
    }

    /// Phase two: resolves the invite. Accepting removes both riders from
    /// the pool and hands each the session id and the other's details;
    /// declining leaves both in the pool.
    pub async fn respond(
        &self,
        responder_id: RiderId,
        from_rider_id: RiderId,
        decision: Decision,
        responder_details: Option<Value>,
    ) -> Result<(), EngineError> {
        let stale = || EngineError::StaleInvite {
            responder_id: responder_id.clone(),
            from_rider_id: from_rider_id.clone(),
        };

        match decision {
            Decision::Accept => {
                let pair = self
                    .looking
                    .accept_pair(&responder_id, &from_rider_id)
                    .await
                    .map_err(|_| stale())?;
                let session_id: SessionId = Uuid::new_v4().to_string();
                info!("peer match {session_id}: {responder_id} accepted {from_rider_id}");

                self.notifier.send_via(
                    &pair.inviter_handle,
                    OutboundEvent::InviteAccepted {
                        peer_id: responder_id,
                        details: responder_details,
                        session_id: session_id.clone(),
                    },
                );
                self.notifier.send_via(
                    &pair.responder_handle,
                    OutboundEvent::InviteAccepted {
                        peer_id: from_rider_id,
                        details: Some(pair.invite_details),
                        session_id,
                    },
                );
                Ok(())
            }
            Decision::Reject => {
                let inviter_handle = self
                    .looking
                    .decline(&responder_id, &from_rider_id)
                    .await
                    .map_err(|_| stale())?;
                debug!("invite: {responder_id} declined {from_rider_id}");
                if let Some(handle) = inviter_handle {
                    self.notifier.send_via(
                        &handle,
                        OutboundEvent::InviteDeclined {
                            responder_id,
                        },
                    );
                }
                Ok(())
            }
        }
    }

    async fn fail_outstanding_invites(&self, rider_id: &str) {
        let affected: Vec<LookingEntry> = self.looking.clear_invites_from(rider_id).await;
        for entry in affected {
            self.notifier.send_via(
                &entry.handle,
                OutboundEvent::InviteTargetUnavailable {
                    rider_id: rider_id.to_string(),
                },
            );
        }
    }
}
