//! Geo-fence revalidation.
//!
//! Clients report whether they believe they are inside the office
//! radius, but that hint is advisory.  Every event is re-checked here
//! with the haversine great-circle distance before it is accepted.

use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::models::{AttendanceEvent, GeoPoint};
use crate::rules::AttendanceRules;

/// Mean Earth radius in metres.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points, in metres.
pub fn haversine_distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Reject the event unless it was captured inside the configured fence.
pub fn validate_event_location(event: &AttendanceEvent, rules: &AttendanceRules) -> EngineResult<()> {
    let distance_m = haversine_distance_m(event.location, rules.office_location);
    let inside = distance_m <= rules.geo_fence_radius_meters;

    if let Some(hint) = event.within_radius_hint {
        if hint != inside {
            warn!(
                employee_id = %event.employee_id,
                device_id = %event.device_id,
                hint,
                distance_m,
                "client geo-fence hint disagrees with server check"
            );
        }
    }

    if inside {
        Ok(())
    } else {
        Err(EngineError::GeoFenceViolation {
            employee_id: event.employee_id.clone(),
            date: event.date(),
            distance_m,
            radius_m: rules.geo_fence_radius_meters,
        })
    }
}
