//! The engine's wire vocabulary: a closed set of inbound commands and a
//! closed set of outbound notifications, tagged by event name so a transport
//! can match them exhaustively.

use h3o::LatLng;
use h3o::error::InvalidLatLng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::directory::UserProfile;

pub type UserId = String;
pub type DriverId = String;
pub type RiderId = String;
pub type RideId = String;
pub type SessionId = String;

/// Coordinates as they travel on the wire, decimal degrees.
///
/// Converted to [`LatLng`] at the boundary so out-of-range or non-finite
/// input is rejected before it reaches a pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lng: f64,
}

impl GeoLocation {
    pub fn to_coord(self) -> Result<LatLng, InvalidLatLng> {
        LatLng::new(self.lat, self.lng)
    }
}

impl From<LatLng> for GeoLocation {
    fn from(coord: LatLng) -> Self {
        Self {
            lat: coord.lat(),
            lng: coord.lng(),
        }
    }
}

/// Accept or reject, as answered by a driver to an offer or a rider to an
/// invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
}

/// Commands the engine consumes from connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Connect {
        user_id: UserId,
    },
    DriverOnline {
        driver_id: DriverId,
        location: GeoLocation,
    },
    DriverLocation {
        driver_id: DriverId,
        location: GeoLocation,
    },
    DriverOffline {
        driver_id: DriverId,
    },
    RiderLooking {
        rider_id: RiderId,
        location: GeoLocation,
        destination: GeoLocation,
    },
    RiderStopLooking {
        rider_id: RiderId,
    },
    OfferResponse {
        ride_id: RideId,
        driver_id: DriverId,
        decision: Decision,
        /// Opaque driver-supplied payload (ETA note, cancellation reason);
        /// forwarded, never interpreted.
        #[serde(default)]
        extra: Option<Value>,
    },
    Invite {
        from_rider_id: RiderId,
        to_rider_id: RiderId,
        details: Value,
    },
    InviteResponse {
        responder_id: RiderId,
        from_rider_id: RiderId,
        decision: Decision,
        #[serde(default)]
        details: Option<Value>,
    },
    Disconnect {
        user_id: UserId,
    },
}

/// Notifications the engine delivers to a specific connected user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// To a candidate driver: a ride is on offer.
    RideOffer {
        ride_id: RideId,
        pickup: GeoLocation,
        destination: GeoLocation,
    },
    /// To the rider: a driver accepted.
    RideAssigned {
        ride_id: RideId,
        driver: UserProfile,
    },
    /// To the rider: every candidate was exhausted.
    RideUnassignable {
        ride_id: RideId,
    },
    InviteReceived {
        from_rider_id: RiderId,
        details: Value,
    },
    /// To both halves of a completed handshake, carrying the same session id.
    InviteAccepted {
        peer_id: RiderId,
        #[serde(default)]
        details: Option<Value>,
        session_id: SessionId,
    },
    InviteDeclined {
        responder_id: RiderId,
    },
    /// To a rider whose counterpart is not (or no longer) in the looking
    /// pool.
    InviteTargetUnavailable {
        rider_id: RiderId,
    },
}

impl OutboundEvent {
    /// Event name as it appears in the wire tag; used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::RideOffer { .. } => "ride_offer",
            OutboundEvent::RideAssigned { .. } => "ride_assigned",
            OutboundEvent::RideUnassignable { .. } => "ride_unassignable",
            OutboundEvent::InviteReceived { .. } => "invite_received",
            OutboundEvent::InviteAccepted { .. } => "invite_accepted",
            OutboundEvent::InviteDeclined { .. } => "invite_declined",
            OutboundEvent::InviteTargetUnavailable { .. } => "invite_target_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_events_parse_from_tagged_json() {
        let event: InboundEvent = serde_json::from_value(json!({
            "type": "driver_online",
            "driver_id": "d-1",
            "location": { "lat": 37.77, "lng": -122.41 },
        }))
        .expect("valid driver_online frame");
        assert_eq!(
            event,
            InboundEvent::DriverOnline {
                driver_id: "d-1".to_string(),
                location: GeoLocation {
                    lat: 37.77,
                    lng: -122.41
                },
            }
        );
    }

    #[test]
    fn offer_response_extra_defaults_to_none() {
        let event: InboundEvent = serde_json::from_value(json!({
            "type": "offer_response",
            "ride_id": "r-1",
            "driver_id": "d-1",
            "decision": "accept",
        }))
        .expect("valid offer_response frame");
        let InboundEvent::OfferResponse {
            decision, extra, ..
        } = event
        else {
            panic!("expected offer_response");
        };
        assert_eq!(decision, Decision::Accept);
        assert!(extra.is_none());
    }

    #[test]
    fn outbound_events_serialize_with_snake_case_tags() {
        let event = OutboundEvent::InviteTargetUnavailable {
            rider_id: "r-9".to_string(),
        };
        let json = serde_json::to_value(&event).expect("serializable event");
        assert_eq!(json["type"], "invite_target_unavailable");
        assert_eq!(json["rider_id"], "r-9");
        assert_eq!(event.kind(), "invite_target_unavailable");
    }

    #[test]
    fn out_of_range_location_is_rejected_at_the_boundary() {
        let bad = GeoLocation {
            lat: 123.0,
            lng: 0.0,
        };
        assert!(bad.to_coord().is_err());

        let good = GeoLocation {
            lat: 51.5074,
            lng: -0.1278,
        };
        let coord = good.to_coord().expect("valid coordinates");
        assert!((GeoLocation::from(coord).lat - 51.5074).abs() < 1e-9);
    }
}
