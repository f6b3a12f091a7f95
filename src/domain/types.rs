use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Series bookkeeping
// ============================================================================

/// Input series consumed by the timeline builder, plus battery telemetry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SeriesKind {
    Price,
    Weather,
    Grid,
    Load,
    Telemetry,
}

impl SeriesKind {
    /// Price, load and telemetry must be present for a cycle to proceed;
    /// weather and grid only degrade confidence when missing.
    pub fn is_required(&self) -> bool {
        matches!(self, Self::Price | Self::Load | Self::Telemetry)
    }
}

/// Anything with a start and a duration that can be laid onto the decision grid.
pub trait Sampled {
    fn start(&self) -> DateTime<Utc>;
    fn duration_minutes(&self) -> i64;

    fn end(&self) -> DateTime<Utc> {
        self.start() + Duration::minutes(self.duration_minutes())
    }
}

// ============================================================================
// Prices
// ============================================================================

/// Price spike indicator published with each price interval
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SpikeState {
    #[default]
    None,
    Potential,
    Actual,
}

/// Whether a price was settled or is still a forecast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Actual,
    Forecast,
}

/// One tariff interval (30 min nominal). Prices in c/kWh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceInterval {
    pub start: DateTime<Utc>,
    pub duration_minutes: i64,
    pub import_price: f64,
    pub export_price: f64,
    /// Feeds that publish no spike flag mean no spike
    #[serde(default)]
    pub spike: SpikeState,
    pub provenance: Provenance,
    /// Provider confidence in [0, 1]; settled prices are 1.0.
    pub confidence: f64,
}

impl PriceInterval {
    pub fn forecast(start: DateTime<Utc>, duration_minutes: i64, import: f64, export: f64) -> Self {
        Self {
            start,
            duration_minutes,
            import_price: import,
            export_price: export,
            spike: SpikeState::default(),
            provenance: Provenance::Forecast,
            confidence: 1.0,
        }
    }

    pub fn with_spike(mut self, spike: SpikeState) -> Self {
        self.spike = spike;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn settled(mut self) -> Self {
        self.provenance = Provenance::Actual;
        self.confidence = 1.0;
        self
    }
}

impl Sampled for PriceInterval {
    fn start(&self) -> DateTime<Utc> {
        self.start
    }
    fn duration_minutes(&self) -> i64 {
        self.duration_minutes
    }
}

// ============================================================================
// Weather
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherInterval {
    pub start: DateTime<Utc>,
    pub duration_minutes: i64,
    /// Global horizontal irradiance (W/m²)
    pub irradiance_w_m2: f64,
    pub cloud_cover_percent: f64,
    pub temperature_c: f64,
    /// Expected PV generation over the whole interval (kWh)
    pub solar_kwh: f64,
}

impl Sampled for WeatherInterval {
    fn start(&self) -> DateTime<Utc> {
        self.start
    }
    fn duration_minutes(&self) -> i64 {
        self.duration_minutes
    }
}

// ============================================================================
// Household load
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    LearnedProfile,
    ScheduledOverride,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadForecastInterval {
    pub start: DateTime<Utc>,
    pub duration_minutes: i64,
    /// Predicted consumption over the whole interval (kWh)
    pub consumption_kwh: f64,
    pub source: LoadSource,
}

impl Sampled for LoadForecastInterval {
    fn start(&self) -> DateTime<Utc> {
        self.start
    }
    fn duration_minutes(&self) -> i64 {
        self.duration_minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_interval_end() {
        let start = Utc.with_ymd_and_hms(2026, 1, 10, 6, 0, 0).unwrap();
        let p = PriceInterval::forecast(start, 30, 25.0, 8.0);
        assert_eq!(p.end(), start + Duration::minutes(30));
    }

    #[test]
    fn test_spike_ordering() {
        assert!(SpikeState::Actual > SpikeState::Potential);
        assert!(SpikeState::Potential > SpikeState::None);
        assert_eq!(SpikeState::Potential.to_string(), "potential");
    }

    #[test]
    fn test_missing_spike_flag_means_none() {
        let json = r#"{"start":"2026-01-10T06:00:00Z","duration_minutes":30,
            "import_price":25.0,"export_price":8.0,"provenance":"forecast","confidence":1.0}"#;
        let p: PriceInterval = serde_json::from_str(json).unwrap();
        assert_eq!(p.spike, SpikeState::None);
    }

    #[test]
    fn test_required_series() {
        assert!(SeriesKind::Price.is_required());
        assert!(SeriesKind::Load.is_required());
        assert!(!SeriesKind::Weather.is_required());
        assert!(!SeriesKind::Grid.is_required());
        assert_eq!(SeriesKind::Price.to_string(), "price");
    }

    #[test]
    fn test_confidence_is_clamped() {
        let start = Utc.with_ymd_and_hms(2026, 1, 10, 6, 0, 0).unwrap();
        let p = PriceInterval::forecast(start, 30, 25.0, 8.0).with_confidence(1.7);
        assert_eq!(p.confidence, 1.0);
    }
}
