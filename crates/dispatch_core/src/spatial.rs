//! Great-circle distance between validated coordinates.
//!
//! The pools store positions as [`h3o::LatLng`], which rejects out-of-range
//! latitudes/longitudes at construction, so distance math never has to
//! re-validate its inputs.

use h3o::LatLng;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two coordinates, in kilometers.
pub fn distance_km(a: LatLng, b: LatLng) -> f64 {
    let (lat1, lon1) = (a.lat().to_radians(), a.lng().to_radians());
    let (lat2, lon2) = (b.lat().to_radians(), b.lng().to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_between_identical_points_is_zero() {
        let p = LatLng::new(37.7749, -122.4194).expect("valid lat/lng");
        assert_eq!(distance_km(p, p), 0.0);
    }

    #[test]
    fn distance_sf_to_la_is_about_559_km() {
        let sf = LatLng::new(37.7749, -122.4194).expect("valid lat/lng");
        let la = LatLng::new(34.0522, -118.2437).expect("valid lat/lng");
        let d = distance_km(sf, la);
        assert!((550.0..570.0).contains(&d), "got {d} km");
    }

    #[test]
    fn distance_is_symmetric() {
        let a = LatLng::new(52.5200, 13.4050).expect("valid lat/lng");
        let b = LatLng::new(48.8566, 2.3522).expect("valid lat/lng");
        assert!((distance_km(a, b) - distance_km(b, a)).abs() < 1e-9);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let a = LatLng::new(10.0, 20.0).expect("valid lat/lng");
        let b = LatLng::new(11.0, 20.0).expect("valid lat/lng");
        let d = distance_km(a, b);
        assert!((110.0..113.0).contains(&d), "got {d} km");
    }
}
