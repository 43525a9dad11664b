//! Geometry helpers: polyline decoding, spherical distance, unit
//! conversions. All pure functions.
//!
//! Coordinate order is a perennial source of grief: decoded route points
//! are `(lat, lon)` pairs, but the geospatial store and [`geo_types::Point`]
//! use `(x, y)` = `(lon, lat)`. Conversions between the two happen here and
//! nowhere else.

use geo_types::Point;
use std::fmt::Write as _;

/// Meters per statute mile.
pub const METERS_PER_MILE: f64 = 1609.344;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Decode a precision-6 encoded polyline into `(lat, lon)` pairs.
///
/// This is the varint format OSRM returns for `geometries=polyline6`:
/// zig-zag-signed deltas, 5 bits per byte, offset by 63.
pub fn decode_polyline6(encoded: &str) -> Vec<(f64, f64)> {
    let inv = 1.0 / 1e6;
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::new();
    let mut previous = [0i64, 0i64];
    let mut i = 0;

    'outer: while i < bytes.len() {
        let mut ll = [0i64, 0i64];
        for j in 0..2 {
            let mut shift = 0;
            let mut byte = 0x20;
            while byte >= 0x20 {
                if i >= bytes.len() {
                    // Truncated input; drop the partial coordinate.
                    break 'outer;
                }
                byte = i64::from(bytes[i]) - 63;
                i += 1;
                ll[j] |= (byte & 0x1f) << shift;
                shift += 5;
            }
            ll[j] = previous[j] + ((ll[j] >> 1) ^ -(ll[j] & 1));
            previous[j] = ll[j];
        }
        decoded.push((ll[0] as f64 * inv, ll[1] as f64 * inv));
    }

    decoded
}

/// Build a WKT `LINESTRING` from `(lat, lon)` route points.
///
/// WKT (like the store) wants `lon lat` order.
pub fn linestring_wkt(points: &[(f64, f64)]) -> String {
    let mut wkt = String::with_capacity(points.len() * 24 + 12);
    wkt.push_str("LINESTRING(");
    for (i, (lat, lon)) in points.iter().enumerate() {
        if i > 0 {
            wkt.push(',');
        }
        write!(wkt, "{} {}", lon, lat).expect("writing to a String cannot fail");
    }
    wkt.push(')');
    wkt
}

/// Great-circle (haversine) distance in meters between two `(lat, lon)`
/// points.
pub fn haversine_distance(coord1: (f64, f64), coord2: (f64, f64)) -> f64 {
    let (lat1, lon1) = (coord1.0.to_radians(), coord1.1.to_radians());
    let (lat2, lon2) = (coord2.0.to_radians(), coord2.1.to_radians());

    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

pub fn meters_to_miles(meters: f64) -> f64 {
    meters / METERS_PER_MILE
}

pub fn miles_to_meters(miles: f64) -> f64 {
    miles * METERS_PER_MILE
}

/// Bounding box `[min_lon, min_lat, max_lon, max_lat]` of decoded route
/// points. Returns all zeros for an empty input.
pub fn bbox(points: &[(f64, f64)]) -> [f64; 4] {
    if points.is_empty() {
        return [0.0; 4];
    }
    let mut out = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
    for &(lat, lon) in points {
        out[0] = out[0].min(lon);
        out[1] = out[1].min(lat);
        out[2] = out[2].max(lon);
        out[3] = out[3].max(lat);
    }
    out
}

/// Is this point inside WGS84 bounds?
pub fn in_wgs84_bounds(point: &Point<f64>) -> bool {
    (-180.0..=180.0).contains(&point.x()) && (-90.0..=90.0).contains(&point.y())
}
