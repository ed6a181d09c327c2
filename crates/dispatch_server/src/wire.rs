//! Server-only wire frames layered next to the engine's event enums.
//!
//! Engine events pass through unchanged; these frames cover what the
//! transport owns: ride requests (which mint the ride record before
//! dispatch starts) and error reporting back to the client.

use serde::{Deserialize, Serialize};

use dispatch_core::events::{GeoLocation, RideId, RiderId};

/// Client frames that are not engine events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Rider asks for a ride; the server creates the record and starts the
    /// offer loop.
    RequestRide {
        rider_id: RiderId,
        pickup: GeoLocation,
        destination: GeoLocation,
    },
}

/// Server frames that are not engine events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Acknowledges a `request_ride` with the minted ride id.
    RideRequested { ride_id: RideId },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_ride_parses_from_tagged_json() {
        let frame: ControlFrame = serde_json::from_value(json!({
            "type": "request_ride",
            "rider_id": "rider-1",
            "pickup": { "lat": 37.77, "lng": -122.41 },
            "destination": { "lat": 37.80, "lng": -122.44 },
        }))
        .expect("valid request_ride frame");
        assert!(matches!(
            frame,
            ControlFrame::RequestRide { ref rider_id, .. } if rider_id == "rider-1"
        ));
    }

    #[test]
    fn server_frames_serialize_with_snake_case_tags() {
        let json = serde_json::to_value(ServerFrame::RideRequested {
            ride_id: "r-1".to_string(),
        })
        .expect("serializable frame");
        assert_eq!(json["type"], "ride_requested");

        let json = serde_json::to_value(ServerFrame::Error {
            message: "bad frame".to_string(),
        })
        .expect("serializable frame");
        assert_eq!(json["type"], "error");
    }
}
