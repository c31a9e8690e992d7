//! Great-circle distance between catalogue coordinates.

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance in kilometres between two latitude/longitude pairs.
pub(crate) fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2) + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_york_to_london() {
        let km = haversine_km(40.7128, -74.0060, 51.5074, -0.1278);
        assert!((km - 5570.0).abs() < 30.0, "got {km}");
    }

    #[test]
    fn zero_distance_for_same_point() {
        assert!(haversine_km(48.2082, 16.3738, 48.2082, 16.3738) < 1e-9);
    }

    #[test]
    fn symmetry() {
        let a = haversine_km(59.3293, 18.0686, 35.6762, 139.6503);
        let b = haversine_km(35.6762, 139.6503, 59.3293, 18.0686);
        assert!((a - b).abs() < 1e-9);
    }
}
