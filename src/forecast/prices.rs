use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{bump, floor_to, local_hour};
use crate::domain::{PriceInterval, Provenance, SpikeState};

/// What the retailer API returns in one poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    /// Intervals already settled or in progress
    pub current: Vec<PriceInterval>,
    pub forecast: Vec<PriceInterval>,
    pub vpp_event_active: bool,
    pub fetched_at: DateTime<Utc>,
}

impl PriceSnapshot {
    /// Current and forecast intervals as one ordered series.
    ///
    /// When both lists carry the same start, the settled interval wins.
    pub fn intervals(&self) -> Vec<PriceInterval> {
        let mut by_start: BTreeMap<DateTime<Utc>, PriceInterval> = BTreeMap::new();
        for p in self.current.iter().chain(self.forecast.iter()) {
            match by_start.get(&p.start) {
                Some(existing)
                    if existing.provenance == Provenance::Actual
                        || p.provenance == Provenance::Forecast => {}
                _ => {
                    by_start.insert(p.start, p.clone());
                }
            }
        }
        by_start.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.forecast.is_empty()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn fetch(&self) -> Result<PriceSnapshot>;
}

/// Synthetic NEM-style tariff: cheap overnight, negative around the midday
/// solar soak, expensive evening peak.
#[derive(Debug, Clone)]
pub struct SimulatedPriceProvider {
    pub utc_offset_hours: i32,
    pub horizon_hours: i64,
    /// Network and retail charges added on top of wholesale (c/kWh)
    pub network_cents: f64,
    pub vpp_event_active: bool,
    /// Wholesale price above which an interval is flagged as a potential spike
    pub spike_threshold_cents: f64,
}

impl Default for SimulatedPriceProvider {
    fn default() -> Self {
        Self {
            utc_offset_hours: 10,
            horizon_hours: 48,
            network_cents: 12.0,
            vpp_event_active: false,
            spike_threshold_cents: 100.0,
        }
    }
}

impl SimulatedPriceProvider {
    const INTERVAL_MINUTES: i64 = 30;

    pub fn new(utc_offset_hours: i32, horizon_hours: i64) -> Self {
        Self {
            utc_offset_hours,
            horizon_hours,
            ..Self::default()
        }
    }

    fn wholesale_cents(&self, t: DateTime<Utc>) -> f64 {
        let h = local_hour(t, self.utc_offset_hours);
        let overnight = 6.0;
        let solar_soak = bump(h, 12.5, 1.8) * 14.0;
        let morning = bump(h, 7.5, 1.2) * 12.0;
        let evening = bump(h, 18.5, 1.5) * 38.0;
        overnight + 6.0 + morning + evening - solar_soak
    }

    /// Deterministic snapshot as the retailer would publish it at `now`
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> PriceSnapshot {
        let step = Duration::minutes(Self::INTERVAL_MINUTES);
        let first = floor_to(now, Self::INTERVAL_MINUTES);
        let count = self.horizon_hours * 60 / Self::INTERVAL_MINUTES + 1;

        let mut current = Vec::new();
        let mut forecast = Vec::with_capacity(count as usize);
        for i in 0..count {
            let start = first + step * i as i32;
            let wholesale = self.wholesale_cents(start);
            let spike = if wholesale >= self.spike_threshold_cents {
                SpikeState::Potential
            } else {
                SpikeState::None
            };
            let hours_out = i as f64 * Self::INTERVAL_MINUTES as f64 / 60.0;
            let p = PriceInterval::forecast(
                start,
                Self::INTERVAL_MINUTES,
                wholesale + self.network_cents,
                wholesale,
            )
            .with_spike(spike)
            .with_confidence(1.0 - 0.01 * hours_out);
            if i == 0 {
                current.push(p.settled());
            } else {
                forecast.push(p);
            }
        }

        PriceSnapshot {
            current,
            forecast,
            vpp_event_active: self.vpp_event_active,
            fetched_at: now,
        }
    }
}

#[async_trait]
impl PriceProvider for SimulatedPriceProvider {
    async fn fetch(&self) -> Result<PriceSnapshot> {
        Ok(self.snapshot_at(Utc::now()))
    }
}
