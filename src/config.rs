use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::domain::BatteryState;

/// Process-wide configuration, built once and handed to each component
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[validate(nested)]
    pub strategy: StrategyConfig,
    #[validate(nested)]
    pub timeline: TimelineConfig,
    #[validate(nested)]
    pub optimizer: OptimizerConfig,
    #[validate(nested)]
    pub battery: BatteryConfig,
    pub site: SiteConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ControllerConfig {
    #[validate(range(min = 1))]
    pub decision_cycle_interval_secs: u64,
    /// Hard limit spanning gathering through emitting
    #[validate(range(min = 1))]
    pub cycle_deadline_secs: u64,
    pub price_timeout_secs: u64,
    pub weather_timeout_secs: u64,
    pub grid_timeout_secs: u64,
    pub load_timeout_secs: u64,
    pub telemetry_timeout_secs: u64,
    pub command_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub alert_after_consecutive_failures: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            decision_cycle_interval_secs: 300,
            cycle_deadline_secs: 240,
            price_timeout_secs: 30,
            weather_timeout_secs: 20,
            grid_timeout_secs: 20,
            load_timeout_secs: 10,
            telemetry_timeout_secs: 10,
            command_timeout_secs: 10,
            alert_after_consecutive_failures: 3,
        }
    }
}

impl ControllerConfig {
    pub fn decision_cycle_interval(&self) -> Duration {
        Duration::from_secs(self.decision_cycle_interval_secs)
    }
    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
    /// Commands last one decision cycle unless refreshed
    pub fn command_duration_secs(&self) -> u64 {
        self.decision_cycle_interval_secs
    }
}

/// Classifier thresholds. Prices in c/kWh, energy in kWh.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StrategyConfig {
    /// Grid Charge when import price <= this (inclusive)
    pub charge_threshold_price: f64,
    /// Energy above reserve required to shield a potential spike
    #[validate(range(min = 0.0))]
    pub spike_residual_margin_kwh: f64,
    /// Tolerance below the lookahead export maximum that still counts as a peak
    #[validate(range(min = 0.0))]
    pub peak_sell_margin: f64,
    #[validate(range(min = 5))]
    pub peak_sell_lookahead_minutes: i64,
    /// Export must pay more than this before Peak Sell applies
    pub peak_sell_min_price: f64,
    #[validate(range(min = 0.0))]
    pub degradation_cost_per_kwh: f64,
    /// Site-level reserve floor; raised over the BMS value, never lowered
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_reserve_soc: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            charge_threshold_price: 0.0,
            spike_residual_margin_kwh: 1.0,
            peak_sell_margin: 2.0,
            peak_sell_lookahead_minutes: 180,
            peak_sell_min_price: 0.0,
            degradation_cost_per_kwh: 1.0,
            min_reserve_soc: 20.0,
        }
    }
}

impl StrategyConfig {
    /// The more conservative of the configured rate and the pack's own
    pub fn effective_degradation_cost(&self, battery: &BatteryState) -> f64 {
        self.degradation_cost_per_kwh.max(battery.degradation_cost_per_kwh())
    }

    /// Telemetry with the site reserve applied when it is the stricter floor
    pub fn effective_battery(&self, battery: &BatteryState) -> BatteryState {
        BatteryState {
            min_reserve_percent: battery.min_reserve_percent.max(self.min_reserve_soc),
            ..battery.clone()
        }
    }

    pub fn peak_sell_lookahead(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.peak_sell_lookahead_minutes)
    }
}

/// Per-source staleness grace (minutes). For required series this is the
/// limit before `DataStale`; for optional ones, the forward-fill gap limit.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StalenessConfig {
    #[validate(range(min = 0))]
    pub price_minutes: i64,
    #[validate(range(min = 0))]
    pub load_minutes: i64,
    #[validate(range(min = 0))]
    pub weather_minutes: i64,
    #[validate(range(min = 0))]
    pub grid_minutes: i64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            price_minutes: 35,
            load_minutes: 60,
            weather_minutes: 90,
            grid_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TimelineConfig {
    #[validate(range(min = 12, max = 56))]
    pub forecast_horizon_hours: i64,
    /// Shortest timeline a cycle may plan over when a required series ends
    /// early; capped at the forecast horizon
    #[validate(range(min = 1, max = 56))]
    pub min_horizon_hours: i64,
    /// Span covered by 5-minute buckets before switching to 30 minutes
    #[validate(range(min = 0))]
    pub near_term_minutes: i64,
    #[validate(nested)]
    pub staleness: StalenessConfig,
    /// Confidence multiplier for buckets with unfilled optional data
    #[validate(range(min = 0.0, max = 1.0))]
    pub degraded_confidence_factor: f64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            forecast_horizon_hours: 48,
            min_horizon_hours: 12,
            near_term_minutes: 120,
            staleness: StalenessConfig::default(),
            degraded_confidence_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OptimizerConfig {
    #[validate(range(min = 2, max = 401))]
    pub soc_discretization_levels: usize,
    /// Fractional weight lost per hour of distance from now
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence_decay_per_hour: f64,
    /// Lower SOC floor for the first VPP Dispatch action; `None` keeps the reserve
    #[validate(range(min = 0.0, max = 100.0))]
    pub vpp_emergency_floor_percent: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            soc_discretization_levels: 41,
            confidence_decay_per_hour: 0.02,
            vpp_emergency_floor_percent: None,
        }
    }
}

/// Nameplate values for the simulated pack
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatteryConfig {
    #[validate(range(min = 0.1))]
    pub capacity_kwh: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub initial_soc_percent: f64,
    #[validate(range(min = 0.0))]
    pub max_charge_kw: f64,
    #[validate(range(min = 0.0))]
    pub max_discharge_kw: f64,
    #[validate(range(min = 0.01, max = 1.0))]
    pub efficiency: f64,
    #[validate(range(min = 0.0))]
    pub cycle_cost_cents: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_percent: f64,
    pub ambient_temp_c: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: 13.5,
            initial_soc_percent: 50.0,
            max_charge_kw: 5.0,
            max_discharge_kw: 5.0,
            efficiency: 0.9,
            cycle_cost_cents: 5.0,
            min_soc_percent: 20.0,
            ambient_temp_c: 25.0,
        }
    }
}

impl BatteryConfig {
    /// Telemetry the simulated pack reports before its first step
    pub fn initial_state(&self, at: DateTime<Utc>) -> BatteryState {
        BatteryState {
            soc_percent: self.initial_soc_percent,
            capacity_kwh: self.capacity_kwh,
            max_charge_kw: self.max_charge_kw,
            max_discharge_kw: self.max_discharge_kw,
            efficiency: self.efficiency,
            cycle_count: 0,
            degradation_cost_per_cycle: self.cycle_cost_cents,
            min_reserve_percent: self.min_soc_percent,
            thermal_derate: 1.0,
            temperature_c: self.ambient_temp_c,
            timestamp: at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub nem_region: String,
    /// Local clock offset used by the simulated profiles
    pub utc_offset_hours: i32,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            nem_region: "NSW1".to_string(),
            utc_offset_hours: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { json: true }
    }
}

impl Config {
    /// Defaults, then `config/default.toml`, then `GRIDPILOT__*` env vars
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("config/default.toml"))
                .merge(Env::prefixed("GRIDPILOT__").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract().context("config extraction failed")?;
        cfg.validate().context("config validation failed")?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.timeline.staleness.price_minutes, 35);
        assert_eq!(cfg.controller.decision_cycle_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_horizon_out_of_range_is_rejected() {
        let figment = Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(
            r#"
            [timeline]
            forecast_horizon_hours = 72
            "#,
        ));
        let err = Config::from_figment(figment).unwrap_err();
        assert!(format!("{err:#}").contains("validation"));
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let figment = Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(
            r#"
            [strategy]
            charge_threshold_price = 5.0

            [optimizer]
            soc_discretization_levels = 21
            "#,
        ));
        let cfg = Config::from_figment(figment).unwrap();
        assert_eq!(cfg.strategy.charge_threshold_price, 5.0);
        assert_eq!(cfg.optimizer.soc_discretization_levels, 21);
        assert_eq!(cfg.strategy.peak_sell_margin, 2.0);
    }

    #[test]
    fn test_effective_degradation_cost_takes_the_larger() {
        let strategy = StrategyConfig::default();
        let battery = BatteryState {
            soc_percent: 50.0,
            capacity_kwh: 10.0,
            max_charge_kw: 5.0,
            max_discharge_kw: 5.0,
            efficiency: 0.9,
            cycle_count: 0,
            degradation_cost_per_cycle: 30.0,
            min_reserve_percent: 20.0,
            thermal_derate: 1.0,
            temperature_c: 25.0,
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(strategy.effective_degradation_cost(&battery), 3.0);
    }
}
