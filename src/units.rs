//! Power unit normalisation and display scaling.

use tracing::warn;

/// Scale a power reading to watts. Unknown or missing units are taken as watts.
pub fn to_watts(value: f64, unit: Option<&str>) -> f64 {
    match unit.map(|u| u.trim().to_lowercase()).as_deref() {
        None | Some("w") | Some("") => value,
        Some("kw") => value * 1_000.0,
        Some("mw") => value * 1_000_000.0,
        Some("gw") => value * 1_000_000_000.0,
        Some(other) => {
            warn!(unit = %other, "unknown power unit, assuming W");
            value
        }
    }
}

/// Pick a display unit for a power value in watts.
pub fn display_power(watts: f64) -> (f64, &'static str) {
    if watts.abs() >= 1_000.0 {
        (watts / 1_000.0, "kW")
    } else {
        (watts, "W")
    }
}
