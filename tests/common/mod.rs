//! Hand-driven collaborators for the decision loop tests.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use gridpilot::config::Config;
use gridpilot::controller::{Collaborators, DecisionScheduler, MemorySink};
use gridpilot::domain::{
    Battery, BatteryState, Command, CommandAck, GridState, LoadForecastInterval, LoadSource,
    PriceInterval, SimulatedBattery, SpikeState, WeatherInterval,
};
use gridpilot::forecast::{GridProvider, LoadPredictor, PriceProvider, PriceSnapshot, WeatherProvider};

/// 08:00 UTC, a half-hour boundary
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap()
}

/// Fifty hours of half-hourly prices from `from`; the first is settled at
/// `import` c/kWh, the rest sit at 30c import / 8c export.
pub fn prices_from(from: DateTime<Utc>, import: f64) -> PriceSnapshot {
    PriceSnapshot {
        current: vec![PriceInterval::forecast(from, 30, import, 8.0).settled()],
        forecast: (1..100)
            .map(|i| PriceInterval::forecast(from + Duration::minutes(30 * i), 30, 30.0, 8.0))
            .collect(),
        vpp_event_active: false,
        fetched_at: from,
    }
}

pub fn load_from(from: DateTime<Utc>) -> Vec<LoadForecastInterval> {
    (0..100)
        .map(|i| LoadForecastInterval {
            start: from + Duration::minutes(30 * i),
            duration_minutes: 30,
            consumption_kwh: 0.5,
            source: LoadSource::LearnedProfile,
        })
        .collect()
}

/// Overnight: no sun for the whole horizon
pub fn weather_from(from: DateTime<Utc>) -> Vec<WeatherInterval> {
    (0..51)
        .map(|i| WeatherInterval {
            start: from + Duration::hours(i),
            duration_minutes: 60,
            irradiance_w_m2: 0.0,
            cloud_cover_percent: 10.0,
            temperature_c: 18.0,
            solar_kwh: 0.0,
        })
        .collect()
}

pub fn grid_at(at: DateTime<Utc>) -> GridState {
    GridState {
        region: "NSW1".into(),
        demand_mw: 8000.0,
        generation_mix: BTreeMap::from([("black_coal".to_string(), 60.0), ("solar".to_string(), 40.0)]),
        interconnector_flow_mw: 120.0,
        renewables_percent: 40.0,
        timestamp: at,
    }
}

pub fn pack(soc: f64) -> BatteryState {
    BatteryState {
        soc_percent: soc,
        timestamp: t0(),
        ..Config::default().battery.initial_state(t0())
    }
}

/// Collaborator whose answer the test can swap between cycles
pub struct Fixed<T>(Mutex<Result<T, String>>);

impl<T: Clone> Fixed<T> {
    pub fn ok(value: T) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Ok(value))))
    }

    pub fn set(&self, value: T) {
        *self.0.lock() = Ok(value);
    }

    pub fn fail(&self, reason: &str) {
        *self.0.lock() = Err(reason.to_string());
    }

    fn get(&self) -> Result<T> {
        self.0.lock().clone().map_err(|e| anyhow!(e))
    }
}

#[async_trait]
impl PriceProvider for Fixed<PriceSnapshot> {
    async fn fetch(&self) -> Result<PriceSnapshot> {
        self.get()
    }
}

#[async_trait]
impl WeatherProvider for Fixed<Vec<WeatherInterval>> {
    async fn fetch(&self) -> Result<Vec<WeatherInterval>> {
        self.get()
    }
}

#[async_trait]
impl GridProvider for Fixed<GridState> {
    async fn fetch(&self) -> Result<GridState> {
        self.get()
    }
}

#[async_trait]
impl LoadPredictor for Fixed<Vec<LoadForecastInterval>> {
    async fn predict(&self) -> Result<Vec<LoadForecastInterval>> {
        self.get()
    }
}

/// Price feed that answers only after `delay`
pub struct SlowPrices {
    pub delay: std::time::Duration,
    pub snapshot: PriceSnapshot,
}

#[async_trait]
impl PriceProvider for SlowPrices {
    async fn fetch(&self) -> Result<PriceSnapshot> {
        tokio::time::sleep(self.delay).await;
        Ok(self.snapshot.clone())
    }
}

/// Simulated pack that refuses every non-idle command
pub struct RejectingBattery {
    pub inner: SimulatedBattery,
    pub rejections: AtomicU32,
}

impl RejectingBattery {
    pub fn new(state: BatteryState) -> Self {
        Self {
            inner: SimulatedBattery::new(state),
            rejections: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Battery for RejectingBattery {
    async fn read_state(&self) -> Result<BatteryState> {
        self.inner.read_state().await
    }

    async fn apply(&self, command: Command) -> Result<CommandAck> {
        if command.is_idle() {
            return self.inner.apply(command).await;
        }
        self.rejections.fetch_add(1, Ordering::SeqCst);
        Ok(CommandAck::Rejected {
            reason: "inverter in maintenance".into(),
        })
    }
}

/// Fresh inputs anchored at `t0`, swappable per test
pub struct Rig {
    pub price: Arc<Fixed<PriceSnapshot>>,
    pub weather: Arc<Fixed<Vec<WeatherInterval>>>,
    pub grid: Arc<Fixed<GridState>>,
    pub load: Arc<Fixed<Vec<LoadForecastInterval>>>,
    pub sink: Arc<MemorySink>,
}

impl Rig {
    pub fn new(import_now: f64) -> Self {
        Self {
            price: Fixed::ok(prices_from(t0(), import_now)),
            weather: Fixed::ok(weather_from(t0())),
            grid: Fixed::ok(grid_at(t0())),
            load: Fixed::ok(load_from(t0())),
            sink: Arc::new(MemorySink::new()),
        }
    }

    pub fn vpp_spike(&self) {
        let mut snapshot = prices_from(t0(), 300.0);
        snapshot.current[0] = snapshot.current[0].clone().with_spike(SpikeState::Actual);
        snapshot.vpp_event_active = true;
        self.price.set(snapshot);
    }

    pub fn collaborators(&self, battery: Arc<dyn Battery>) -> Collaborators {
        Collaborators {
            price: self.price.clone(),
            weather: self.weather.clone(),
            grid: self.grid.clone(),
            load: self.load.clone(),
            battery,
            sink: self.sink.clone(),
        }
    }

    pub fn scheduler(&self, battery: Arc<dyn Battery>) -> DecisionScheduler {
        DecisionScheduler::new(&Config::default(), self.collaborators(battery))
    }
}
