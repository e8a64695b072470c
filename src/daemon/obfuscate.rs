use crate::daemon::records::{Geometry, LocationProperties, LocationRecord};
use crate::util::config::{AppConfig, CoordinateOrder};
use chrono::{DateTime, Utc};
use serde_json::Map;

const LCG_MULTIPLIER: u64 = 9301;
const LCG_INCREMENT: u64 = 49297;
const LCG_MODULUS: u64 = 233280;

/// Mean meters per degree of latitude; close enough at the radii we
/// perturb by.
const METERS_PER_DEGREE: f64 = 111_300.0;

#[derive(Debug, Clone)]
pub struct ObfuscateConfig {
    pub radius_m: f64,
    pub grid_step: Option<f64>,
    pub order: CoordinateOrder,
}

impl Default for ObfuscateConfig {
    fn default() -> Self {
        Self {
            radius_m: 555.0,
            grid_step: Some(0.05),
            order: CoordinateOrder::LonLat,
        }
    }
}

impl ObfuscateConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            radius_m: config.radius_m,
            grid_step: config.snap_step(),
            order: config.coordinate_order,
        }
    }
}

/// Privacy transform. Trusted observers get the record back verbatim;
/// everyone else gets a copy stripped to the battery fields and a
/// coordinate pair displaced by up to `radius_m`, with the displacement
/// fully determined by the record's id and timestamp so repeated
/// requests for the same record are bit-identical.
pub fn obfuscate(geo: &LocationRecord, is_private: bool, config: &ObfuscateConfig) -> LocationRecord {
    if is_private {
        return geo.clone();
    }

    let [lon, lat] = geo.geometry.coordinates;
    let rand1 = lcg_unit(id_seed(geo.id.as_deref()));
    let rand2 = lcg_unit(timestamp_seed(geo.properties.timestamp));
    let (mut new_lat, mut new_lon) = displace(lat, lon, config.radius_m, rand1, rand2);
    if let Some(step) = config.grid_step {
        new_lat = snap(new_lat, step);
        new_lon = snap(new_lon, step);
    }
    let coordinates = match config.order {
        CoordinateOrder::LonLat => [new_lon, new_lat],
        CoordinateOrder::LatLon => [new_lat, new_lon],
    };

    LocationRecord {
        id: None,
        kind: geo.kind.clone(),
        properties: LocationProperties {
            timestamp: None,
            battery_state: geo.properties.battery_state.clone(),
            battery_level: geo.properties.battery_level.clone(),
            extra: Map::new(),
        },
        geometry: Geometry {
            kind: geo.geometry.kind.clone(),
            coordinates,
        },
    }
}

/// One step of the fixed linear-congruential recurrence, mapped to [0, 1).
fn lcg_unit(seed: u64) -> f64 {
    let next = seed
        .wrapping_mul(LCG_MULTIPLIER)
        .wrapping_add(LCG_INCREMENT)
        % LCG_MODULUS;
    next as f64 / LCG_MODULUS as f64
}

/// Seed from the record id interpreted as a base-16 integer. Ids that
/// do not fit a u64 (24-hex-digit ObjectIds) or are not hex at all are
/// FNV-1a hashed instead; a missing id seeds 0.
fn id_seed(id: Option<&str>) -> u64 {
    match id {
        None => 0,
        Some(id) => u64::from_str_radix(id, 16).unwrap_or_else(|_| fnv1a(id.as_bytes())),
    }
}

fn timestamp_seed(timestamp: Option<DateTime<Utc>>) -> u64 {
    timestamp
        .map(|ts| ts.timestamp_millis() as u64)
        .unwrap_or(0)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

/// Uniform-in-circle displacement: `rand1` picks the distance (square
/// root keeps the distribution uniform over the disc), `rand2` the
/// bearing. Longitude displacement is widened by 1/cos(lat) so the
/// ground distance stays bounded by the radius away from the equator.
fn displace(lat: f64, lon: f64, radius_m: f64, rand1: f64, rand2: f64) -> (f64, f64) {
    let w = radius_m / METERS_PER_DEGREE * rand1.sqrt();
    let t = 2.0 * std::f64::consts::PI * rand2;
    let d_lat = w * t.sin();
    let d_lon = w * t.cos() / lat.to_radians().cos();
    (lat + d_lat, lon + d_lon)
}

/// Round-half-up to the nearest multiple of `step`.
fn snap(value: f64, step: f64) -> f64 {
    let inv = 1.0 / step;
    (value * inv + 0.5).floor() / inv
}
