use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{GridConditions, LoadSource, Provenance, SpikeState};
use crate::error::EngineError;

/// One bucket of the merged forecast (5 or 30 minutes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineInterval {
    pub start: DateTime<Utc>,
    pub duration_minutes: i64,
    /// c/kWh, time-weighted over the bucket
    pub import_price: f64,
    pub export_price: f64,
    pub spike: SpikeState,
    pub provenance: Provenance,
    /// Expected PV generation in the bucket (kWh)
    pub solar_kwh: f64,
    /// Predicted household consumption in the bucket (kWh)
    pub load_kwh: f64,
    pub load_source: LoadSource,
    pub irradiance_w_m2: Option<f64>,
    pub cloud_cover_percent: Option<f64>,
    pub temperature_c: Option<f64>,
    pub grid: Option<GridConditions>,
    /// Weight of this bucket in [0, 1]
    pub confidence: f64,
    /// An optional series could not be filled within its gap limit
    pub degraded: bool,
}

impl TimelineInterval {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::minutes(self.duration_minutes)
    }

    pub fn hours(&self) -> f64 {
        self.duration_minutes as f64 / 60.0
    }

    /// Load not covered by solar (kWh); negative means surplus
    pub fn net_load_kwh(&self) -> f64 {
        self.load_kwh - self.solar_kwh
    }

    pub fn net_load_kw(&self) -> f64 {
        if self.duration_minutes <= 0 {
            return 0.0;
        }
        self.net_load_kwh() / self.hours()
    }

    /// Solar generation in excess of load (kW, never negative)
    pub fn solar_surplus_kw(&self) -> f64 {
        (-self.net_load_kw()).max(0.0)
    }
}

/// Ordered, contiguous forecast from the current bucket to the horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    built_for: DateTime<Utc>,
    vpp_event_active: bool,
    /// A required series ended before the configured horizon
    #[serde(default)]
    truncated: bool,
    intervals: Vec<TimelineInterval>,
}

impl Timeline {
    /// Validate ordering and contiguity before accepting the intervals
    pub fn new(
        built_for: DateTime<Utc>,
        intervals: Vec<TimelineInterval>,
    ) -> Result<Self, EngineError> {
        if intervals.is_empty() {
            return Err(EngineError::MalformedTimeline("no intervals".into()));
        }
        if let Some(bad) = intervals.iter().find(|iv| iv.duration_minutes <= 0) {
            return Err(EngineError::MalformedTimeline(format!(
                "non-positive duration at {}",
                bad.start
            )));
        }
        if let Some((a, b)) = intervals.iter().tuple_windows().find(|(a, b)| a.end() != b.start) {
            return Err(EngineError::MalformedTimeline(format!(
                "interval ending {} is followed by one starting {}",
                a.end(),
                b.start
            )));
        }
        Ok(Self {
            built_for,
            vpp_event_active: false,
            truncated: false,
            intervals,
        })
    }

    /// Attach the VPP flag reported by the price collaborator
    pub fn with_vpp_event(mut self, active: bool) -> Self {
        self.vpp_event_active = active;
        self
    }

    pub fn with_truncation(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn built_for(&self) -> DateTime<Utc> {
        self.built_for
    }

    pub fn vpp_event_active(&self) -> bool {
        self.vpp_event_active
    }

    pub fn intervals(&self) -> &[TimelineInterval] {
        &self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// The bucket being decided right now
    pub fn current(&self) -> &TimelineInterval {
        &self.intervals[0]
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.intervals[self.intervals.len() - 1].end()
    }

    pub fn span(&self) -> Duration {
        self.end() - self.current().start
    }

    /// Buckets starting before `current.start + window`
    pub fn lookahead(&self, window: Duration) -> impl Iterator<Item = &TimelineInterval> {
        let until = self.current().start + window;
        self.intervals.iter().take_while(move |iv| iv.start < until)
    }

    pub fn has_degraded_intervals(&self) -> bool {
        self.intervals.iter().any(|iv| iv.degraded)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Flat-priced bucket used across unit tests
    pub fn bucket(start: DateTime<Utc>, minutes: i64) -> TimelineInterval {
        TimelineInterval {
            start,
            duration_minutes: minutes,
            import_price: 30.0,
            export_price: 8.0,
            spike: SpikeState::None,
            provenance: Provenance::Forecast,
            solar_kwh: 0.0,
            load_kwh: 0.5 * minutes as f64 / 60.0,
            load_source: LoadSource::LearnedProfile,
            irradiance_w_m2: None,
            cloud_cover_percent: None,
            temperature_c: None,
            grid: None,
            confidence: 1.0,
            degraded: false,
        }
    }

    /// `n` contiguous buckets of `minutes` each starting at `start`
    pub fn flat(start: DateTime<Utc>, n: usize, minutes: i64) -> Vec<TimelineInterval> {
        (0..n)
            .map(|i| bucket(start + Duration::minutes(minutes * i as i64), minutes))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 6, 0, 0).unwrap()
    }

    #[test]
    fn test_rejects_gaps_and_overlaps() {
        let mut ivs = flat(t0(), 3, 5);
        ivs[2].start = ivs[2].start + Duration::minutes(1);
        assert!(matches!(Timeline::new(t0(), ivs), Err(EngineError::MalformedTimeline(_))));

        let mut ivs = flat(t0(), 3, 5);
        ivs[1].duration_minutes = 10;
        assert!(Timeline::new(t0(), ivs).is_err());

        assert!(Timeline::new(t0(), vec![]).is_err());
    }

    #[test]
    fn test_lookahead_window() {
        let tl = Timeline::new(t0(), flat(t0(), 12, 30)).unwrap();
        assert_eq!(tl.lookahead(Duration::hours(3)).count(), 6);
        assert_eq!(tl.span(), Duration::hours(6));
    }

    #[test]
    fn test_solar_surplus() {
        let mut iv = bucket(t0(), 5);
        iv.solar_kwh = 3.0 / 12.0;
        iv.load_kwh = 1.0 / 12.0;
        assert!((iv.solar_surplus_kw() - 2.0).abs() < 1e-9);
        assert!((iv.net_load_kw() + 2.0).abs() < 1e-9);
    }
}
