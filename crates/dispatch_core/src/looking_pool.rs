//! Riders currently seeking a companion match.
//!
//! The pool owns the invite bookkeeping invariants: at most one pending
//! incoming invite per rider (last invite wins, no queueing) and at most
//! one outstanding sent invite per rider. Compound handshake steps run
//! under the single pool lock so no caller ever observes a half-updated
//! pair of entries.

use std::collections::HashMap;
use std::sync::Arc;

use h3o::LatLng;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::events::RiderId;
use crate::presence::ConnectionHandle;

#[derive(Debug, Clone)]
pub struct PendingInvite {
    pub from_rider_id: RiderId,
    pub details: Value,
}

#[derive(Debug, Clone)]
pub struct LookingEntry {
    pub rider_id: RiderId,
    pub handle: ConnectionHandle,
    pub location: LatLng,
    pub destination: LatLng,
    pub pending_invite: Option<PendingInvite>,
    pub sent_invite_to: Option<RiderId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteError {
    SenderNotLooking,
    TargetNotLooking,
}

/// The response references an invite that no longer matches: the pending
/// invite is absent, names a different inviter, or the inviter left the
/// pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeMismatch;

/// Both halves of an accepted handshake, removed from the pool together.
#[derive(Debug, Clone)]
pub struct AcceptedPair {
    pub responder_handle: ConnectionHandle,
    pub inviter_handle: ConnectionHandle,
    /// The inviter's details as recorded on the original invite.
    pub invite_details: Value,
}

#[derive(Debug, Clone, Default)]
pub struct LookingPool {
    inner: Arc<Mutex<HashMap<RiderId, LookingEntry>>>,
}

impl LookingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the rider's entry. A re-announcement starts
    /// from a clean slate: any previously recorded invite state is dropped.
    pub async fn start_looking(
        &self,
        rider_id: RiderId,
        handle: ConnectionHandle,
        location: LatLng,
        destination: LatLng,
    ) {
        let mut inner = self.inner.lock().await;
        inner.insert(
            rider_id.clone(),
            LookingEntry {
                rider_id,
                handle,
                location,
                destination,
                pending_invite: None,
                sent_invite_to: None,
            },
        );
    }

    pub async fn remove(&self, rider_id: &str) -> Option<LookingEntry> {
        let mut inner = self.inner.lock().await;
        inner.remove(rider_id)
    }

    /// Removes the rider's entry only when it belongs to the given
    /// connection.
    pub async fn remove_conn(&self, rider_id: &str, conn_id: Uuid) -> Option<LookingEntry> {
        let mut inner = self.inner.lock().await;
        if inner
            .get(rider_id)
            .is_some_and(|entry| entry.handle.conn_id() == conn_id)
        {
            return inner.remove(rider_id);
        }
        None
    }

    pub async fn get(&self, rider_id: &str) -> Option<LookingEntry> {
        let inner = self.inner.lock().await;
        inner.get(rider_id).cloned()
    }

    pub async fn is_looking(&self, rider_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.contains_key(rider_id)
    }

    pub async fn looking_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.len()
    }

    /// Records an invite on the target (last invite wins) and retracts the
    /// sender's previous outstanding invite, if any. Returns the target's
    /// handle for notification.
    pub async fn record_invite(
        &self,
        from_rider_id: &str,
        to_rider_id: &str,
        details: Value,
    ) -> Result<ConnectionHandle, InviteError> {
        let mut inner = self.inner.lock().await;
        if !inner.contains_key(from_rider_id) {
            return Err(InviteError::SenderNotLooking);
        }
        if !inner.contains_key(to_rider_id) {
            return Err(InviteError::TargetNotLooking);
        }

        // Retract the sender's previous invite unless it targeted the same
        // rider (in which case it is about to be overwritten anyway).
        let previous_target = inner
            .get(from_rider_id)
            .and_then(|entry| entry.sent_invite_to.clone())
            .filter(|target| target != to_rider_id);
        if let Some(previous_target) = previous_target {
            if let Some(entry) = inner.get_mut(&previous_target) {
                if entry
                    .pending_invite
                    .as_ref()
                    .is_some_and(|invite| invite.from_rider_id == from_rider_id)
                {
                    entry.pending_invite = None;
                }
            }
        }

        if let Some(sender) = inner.get_mut(from_rider_id) {
            sender.sent_invite_to = Some(to_rider_id.to_string());
        }
        let target = inner
            .get_mut(to_rider_id)
            .expect("target presence checked above");
        target.pending_invite = Some(PendingInvite {
            from_rider_id: from_rider_id.to_string(),
            details,
        });
        Ok(target.handle.clone())
    }

    /// Completes an accepted handshake: validates the responder's pending
    /// invite against the claimed inviter and removes both entries in one
    /// step. No further invite can reference either rider afterwards.
    pub async fn accept_pair(
        &self,
        responder_id: &str,
        inviter_id: &str,
    ) -> Result<AcceptedPair, HandshakeMismatch> {
        let mut inner = self.inner.lock().await;
        let matches = inner.get(responder_id).is_some_and(|entry| {
            entry
                .pending_invite
                .as_ref()
                .is_some_and(|invite| invite.from_rider_id == inviter_id)
        });
        if !matches || !inner.contains_key(inviter_id) {
            return Err(HandshakeMismatch);
        }

        let responder = inner.remove(responder_id).expect("matched above");
        let inviter = inner.remove(inviter_id).expect("checked above");
        let invite = responder.pending_invite.expect("matched above");
        Ok(AcceptedPair {
            responder_handle: responder.handle,
            inviter_handle: inviter.handle,
            invite_details: invite.details,
        })
    }

    /// Clears a declined invite. Both riders stay in the pool; the
    /// inviter's handle is returned for notification when still present.
    pub async fn decline(
        &self,
        responder_id: &str,
        inviter_id: &str,
    ) -> Result<Option<ConnectionHandle>, HandshakeMismatch> {
        let mut inner = self.inner.lock().await;
        let matches = inner.get(responder_id).is_some_and(|entry| {
            entry
                .pending_invite
                .as_ref()
                .is_some_and(|invite| invite.from_rider_id == inviter_id)
        });
        if !matches {
            return Err(HandshakeMismatch);
        }

        if let Some(responder) = inner.get_mut(responder_id) {
            responder.pending_invite = None;
        }
        let inviter_handle = inner.get_mut(inviter_id).map(|inviter| {
            if inviter.sent_invite_to.as_deref() == Some(responder_id) {
                inviter.sent_invite_to = None;
            }
            inviter.handle.clone()
        });
        Ok(inviter_handle)
    }

    /// Clears every pending invite sent by the departed rider, returning
    /// the affected entries so their riders can be told the request failed.
    pub async fn clear_invites_from(&self, rider_id: &str) -> Vec<LookingEntry> {
        let mut inner = self.inner.lock().await;
        let mut affected = Vec::new();
        for entry in inner.values_mut() {
            if entry
                .pending_invite
                .as_ref()
                .is_some_and(|invite| invite.from_rider_id == rider_id)
            {
                entry.pending_invite = None;
                affected.push(entry.clone());
            }
        }
        affected
    }
}
