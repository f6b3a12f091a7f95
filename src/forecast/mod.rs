pub mod consumption;
pub mod grid;
pub mod prices;
pub mod timeline;
pub mod weather;

pub use consumption::*;
pub use grid::*;
pub use prices::*;
pub use timeline::*;
pub use weather::*;

use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};

/// Floor `t` onto a `minutes` grid (UTC-aligned)
pub(crate) fn floor_to(t: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    t.duration_trunc(Duration::minutes(minutes)).unwrap_or(t)
}

/// Fractional local hour of day at a fixed UTC offset
pub(crate) fn local_hour(t: DateTime<Utc>, utc_offset_hours: i32) -> f64 {
    let local = t + Duration::hours(utc_offset_hours as i64);
    local.hour() as f64 + local.minute() as f64 / 60.0
}

/// Gaussian bump used by the synthetic daily profiles
pub(crate) fn bump(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma.max(0.01);
    (-0.5 * z * z).exp()
}
