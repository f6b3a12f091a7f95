//! Weather forecast and PV generation estimate.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{floor_to, local_hour};
use crate::domain::WeatherInterval;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn fetch(&self) -> Result<Vec<WeatherInterval>>;
}

/// Rough PV model: irradiance over the effective array area at a fixed
/// panel efficiency.
#[derive(Debug, Clone, Copy)]
pub struct PvArray {
    pub area_m2: f64,
    pub panel_efficiency: f64,
}

impl Default for PvArray {
    fn default() -> Self {
        // ~6.6 kW residential system
        Self {
            area_m2: 20.0,
            panel_efficiency: 0.15,
        }
    }
}

impl PvArray {
    pub fn output_kw(&self, irradiance_w_m2: f64) -> f64 {
        (irradiance_w_m2 * self.area_m2 / 1000.0 * self.panel_efficiency).max(0.0)
    }
}

/// Clear-sky sine curve between sunrise and sunset, attenuated by a fixed
/// cloud cover. Hourly intervals.
#[derive(Debug, Clone)]
pub struct SimulatedWeatherProvider {
    pub utc_offset_hours: i32,
    pub horizon_hours: i64,
    pub sunrise: f64,
    pub sunset: f64,
    pub peak_irradiance_w_m2: f64,
    pub cloud_cover_percent: f64,
    pub array: PvArray,
}

impl Default for SimulatedWeatherProvider {
    fn default() -> Self {
        Self {
            utc_offset_hours: 10,
            horizon_hours: 48,
            sunrise: 6.0,
            sunset: 19.0,
            peak_irradiance_w_m2: 1000.0,
            cloud_cover_percent: 20.0,
            array: PvArray::default(),
        }
    }
}

impl SimulatedWeatherProvider {
    pub fn new(utc_offset_hours: i32, horizon_hours: i64) -> Self {
        Self {
            utc_offset_hours,
            horizon_hours,
            ..Self::default()
        }
    }

    fn irradiance_at(&self, t: DateTime<Utc>) -> f64 {
        let hh = local_hour(t, self.utc_offset_hours);
        if hh < self.sunrise || hh > self.sunset {
            return 0.0;
        }
        let day_len = (self.sunset - self.sunrise).max(0.01);
        let x = (hh - self.sunrise) / day_len;
        let clear_sky = (std::f64::consts::PI * x).sin().max(0.0) * self.peak_irradiance_w_m2;
        clear_sky * (1.0 - 0.75 * self.cloud_cover_percent / 100.0)
    }

    fn temperature_at(&self, t: DateTime<Utc>) -> f64 {
        let hh = local_hour(t, self.utc_offset_hours);
        // coolest around 05:00, warmest around 15:00
        22.0 + 7.0 * (std::f64::consts::PI * (hh - 9.0) / 12.0).sin()
    }

    pub fn forecast_at(&self, now: DateTime<Utc>) -> Vec<WeatherInterval> {
        let first = floor_to(now, 60);
        (0..=self.horizon_hours)
            .map(|h| {
                let start = first + Duration::hours(h);
                // sample mid-interval so the hour's energy is centred
                let irradiance = self.irradiance_at(start + Duration::minutes(30));
                WeatherInterval {
                    start,
                    duration_minutes: 60,
                    irradiance_w_m2: irradiance,
                    cloud_cover_percent: self.cloud_cover_percent,
                    temperature_c: self.temperature_at(start),
                    solar_kwh: self.array.output_kw(irradiance),
                }
            })
            .collect()
    }
}

#[async_trait]
impl WeatherProvider for SimulatedWeatherProvider {
    async fn fetch(&self) -> Result<Vec<WeatherInterval>> {
        Ok(self.forecast_at(Utc::now()))
    }
}
