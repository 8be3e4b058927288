//! Unit conventions and epicentral geometry.
//!
//! Every distance or depth that feeds an engine parameter is computed in
//! kilometers. Station elevations live in meters in the catalog and are
//! converted here, at one place, never ad hoc at call sites.

const EARTH_RADIUS_KM: f64 = 6371.0; // mean radius

pub fn m_to_km(meters: f64) -> f64 {
    meters / 1000.0
}

pub fn km_to_m(kilometers: f64) -> f64 {
    kilometers * 1000.0
}

/// Great-circle distance between two geographic points in kilometers.
///
/// Haversine on a spherical Earth; sub-percent accuracy is plenty for the
/// station-separation and neighborhood parameters derived from it.
pub fn epicentral_distance_km(
    lat1_deg: f64,
    lon1_deg: f64,
    lat2_deg: f64,
    lon2_deg: f64,
) -> f64 {
    let lat1 = lat1_deg.to_radians();
    let lat2 = lat2_deg.to_radians();
    let dlat = (lat2_deg - lat1_deg).to_radians();
    let dlon = (lon2_deg - lon1_deg).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();
    EARTH_RADIUS_KM * c
}

/// Hypocentral separation in kilometers between two hypocenters given in
/// degrees and depth-kilometers.
pub fn hypocentral_distance_km(
    lat1_deg: f64,
    lon1_deg: f64,
    depth1_km: f64,
    lat2_deg: f64,
    lon2_deg: f64,
    depth2_km: f64,
) -> f64 {
    let horizontal = epicentral_distance_km(lat1_deg, lon1_deg, lat2_deg, lon2_deg);
    let vertical = depth2_km - depth1_km;
    (horizontal * horizontal + vertical * vertical).sqrt()
}
