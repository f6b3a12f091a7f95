use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Telemetry that cannot be planned against
#[derive(Debug, Error, PartialEq)]
pub enum BatteryError {
    #[error("Invalid telemetry field {field}: {value}")]
    InvalidField { field: &'static str, value: f64 },
    #[error("State of charge out of bounds: {0}%")]
    SocOutOfBounds(f64),
}

/// Temperature band where the cells run at full rate (°C)
const FULL_RATE_BAND_C: (f64, f64) = (5.0, 40.0);
/// Temperatures where the rate has fallen to `MIN_TEMPERATURE_FACTOR` (°C)
const DERATE_LIMITS_C: (f64, f64) = (-10.0, 55.0);
const MIN_TEMPERATURE_FACTOR: f64 = 0.5;

/// Snapshot of the battery as reported by telemetry.
///
/// Built fresh every decision cycle and replaced wholesale; nothing mutates
/// it in place. Power convention everywhere in the crate: positive = charging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    pub soc_percent: f64,
    /// Usable capacity (kWh)
    pub capacity_kwh: f64,
    pub max_charge_kw: f64,
    pub max_discharge_kw: f64,
    /// Round-trip efficiency in (0, 1]
    pub efficiency: f64,
    pub cycle_count: u32,
    /// Degradation cost of one full cycle (cents)
    pub degradation_cost_per_cycle: f64,
    pub min_reserve_percent: f64,
    /// Thermal derate factor in (0, 1] reported by the BMS
    pub thermal_derate: f64,
    pub temperature_c: f64,
    pub timestamp: DateTime<Utc>,
}

/// Charge/discharge limits after derating (kW, both non-negative)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    pub charge_kw: f64,
    pub discharge_kw: f64,
}

impl RateLimits {
    /// Clamp a signed power request into the derated envelope
    pub fn clamp(&self, power_kw: f64) -> f64 {
        power_kw.clamp(-self.discharge_kw, self.charge_kw)
    }

    pub fn allows(&self, power_kw: f64) -> bool {
        const EPS: f64 = 1e-9;
        power_kw <= self.charge_kw + EPS && power_kw >= -self.discharge_kw - EPS
    }
}

impl BatteryState {
    pub fn stored_kwh(&self) -> f64 {
        self.capacity_kwh * self.soc_percent / 100.0
    }

    pub fn reserve_kwh(&self) -> f64 {
        self.capacity_kwh * self.min_reserve_percent / 100.0
    }

    /// Energy that can still be stored before the pack is full
    pub fn chargeable_kwh(&self) -> f64 {
        (self.capacity_kwh - self.stored_kwh()).max(0.0)
    }

    /// Energy available above the reserve floor
    pub fn dischargeable_kwh(&self) -> f64 {
        (self.stored_kwh() - self.reserve_kwh()).max(0.0)
    }

    pub fn is_above_reserve(&self) -> bool {
        self.soc_percent > self.min_reserve_percent
    }

    pub fn is_full(&self) -> bool {
        self.soc_percent >= 100.0
    }

    /// Rate limits at a given cell temperature.
    ///
    /// The BMS derate factor always applies; the temperature curve can only
    /// lower it further, so the result never exceeds `thermal_derate × max`.
    pub fn max_rate_at(&self, temperature_c: f64) -> RateLimits {
        let factor = self.thermal_derate.min(temperature_factor(temperature_c));
        RateLimits {
            charge_kw: (self.max_charge_kw * factor).max(0.0),
            discharge_kw: (self.max_discharge_kw * factor).max(0.0),
        }
    }

    /// Limits at the currently reported cell temperature
    pub fn rate_limits(&self) -> RateLimits {
        self.max_rate_at(self.temperature_c)
    }

    pub fn degradation_cost_per_kwh(&self) -> f64 {
        if self.capacity_kwh <= 0.0 {
            return 0.0;
        }
        self.degradation_cost_per_cycle / self.capacity_kwh
    }

    /// Degradation cost (cents) of moving `kwh` through the pack
    pub fn cycle_cost(&self, kwh: f64) -> f64 {
        self.degradation_cost_per_kwh() * kwh.abs()
    }

    /// SOC after holding `power_kw` for `hours`, using the same efficiency
    /// convention as the optimizer: charging stores `efficiency` of what it
    /// draws, discharging delivers what it removes.
    pub fn projected_soc(&self, power_kw: f64, hours: f64) -> f64 {
        let stored_delta = if power_kw >= 0.0 {
            power_kw * hours * self.efficiency
        } else {
            power_kw * hours
        };
        let kwh = (self.stored_kwh() + stored_delta).clamp(0.0, self.capacity_kwh);
        if self.capacity_kwh > 0.0 {
            kwh / self.capacity_kwh * 100.0
        } else {
            0.0
        }
    }

    /// Reject telemetry that would poison the plan
    pub fn validate(&self) -> Result<(), BatteryError> {
        let finite = [
            ("soc_percent", self.soc_percent),
            ("capacity_kwh", self.capacity_kwh),
            ("max_charge_kw", self.max_charge_kw),
            ("max_discharge_kw", self.max_discharge_kw),
            ("degradation_cost_per_cycle", self.degradation_cost_per_cycle),
            ("temperature_c", self.temperature_c),
        ];
        for (field, value) in finite {
            if !value.is_finite() {
                return Err(BatteryError::InvalidField { field, value });
            }
        }
        if self.capacity_kwh <= 0.0 {
            return Err(BatteryError::InvalidField { field: "capacity_kwh", value: self.capacity_kwh });
        }
        if self.max_charge_kw < 0.0 || self.max_discharge_kw < 0.0 {
            return Err(BatteryError::InvalidField {
                field: "max_rate_kw",
                value: self.max_charge_kw.min(self.max_discharge_kw),
            });
        }
        if !(self.efficiency > 0.0 && self.efficiency <= 1.0) {
            return Err(BatteryError::InvalidField { field: "efficiency", value: self.efficiency });
        }
        if !(self.thermal_derate > 0.0 && self.thermal_derate <= 1.0) {
            return Err(BatteryError::InvalidField { field: "thermal_derate", value: self.thermal_derate });
        }
        if !(0.0..=100.0).contains(&self.soc_percent) {
            return Err(BatteryError::SocOutOfBounds(self.soc_percent));
        }
        if !(0.0..=100.0).contains(&self.min_reserve_percent) {
            return Err(BatteryError::InvalidField {
                field: "min_reserve_percent",
                value: self.min_reserve_percent,
            });
        }
        Ok(())
    }
}

fn temperature_factor(temperature_c: f64) -> f64 {
    let (low_ok, high_ok) = FULL_RATE_BAND_C;
    let (low_min, high_min) = DERATE_LIMITS_C;
    let span = 1.0 - MIN_TEMPERATURE_FACTOR;
    if temperature_c < low_ok {
        let x = ((low_ok - temperature_c) / (low_ok - low_min)).clamp(0.0, 1.0);
        1.0 - span * x
    } else if temperature_c > high_ok {
        let x = ((temperature_c - high_ok) / (high_min - high_ok)).clamp(0.0, 1.0);
        1.0 - span * x
    } else {
        1.0
    }
}

/// Dispatch setpoint sent to the inverter.
///
/// Commands are absolute ("set dispatch to X"), so re-sending one after a
/// retry has no additional effect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Signed power (kW); positive charges the battery
    pub power_kw: f64,
    pub duration_secs: u64,
}

impl Command {
    pub fn idle(duration_secs: u64) -> Self {
        Self { power_kw: 0.0, duration_secs }
    }

    pub fn is_charge(&self) -> bool {
        self.power_kw > 0.0
    }

    pub fn is_discharge(&self) -> bool {
        self.power_kw < 0.0
    }

    pub fn is_idle(&self) -> bool {
        self.power_kw == 0.0
    }

    pub fn hours(&self) -> f64 {
        self.duration_secs as f64 / 3600.0
    }
}

/// Inverter response to a command write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandAck {
    Accepted,
    Rejected { reason: String },
}

/// Telemetry read / command write contract of the battery collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Battery: Send + Sync {
    async fn read_state(&self) -> Result<BatteryState>;
    async fn apply(&self, command: Command) -> Result<CommandAck>;
}

#[derive(Debug, Clone)]
struct SimulatedPack {
    state: BatteryState,
    setpoint: Command,
    throughput_kwh: f64,
}

/// In-process battery used by the `sim` binary and integration tests.
///
/// `apply` only latches the setpoint; energy moves when `advance` is called,
/// which keeps command writes idempotent.
#[derive(Debug, Clone)]
pub struct SimulatedBattery {
    pack: Arc<RwLock<SimulatedPack>>,
    /// Ambient temperature the pack relaxes toward (°C)
    pub ambient_temp_c: f64,
}

impl SimulatedBattery {
    pub fn new(initial: BatteryState) -> Self {
        Self::new_with_ambient(initial, 25.0)
    }

    pub fn new_with_ambient(initial: BatteryState, ambient_temp_c: f64) -> Self {
        let setpoint = Command::idle(0);
        Self {
            pack: Arc::new(RwLock::new(SimulatedPack {
                state: initial,
                setpoint,
                throughput_kwh: 0.0,
            })),
            ambient_temp_c,
        }
    }

    pub async fn setpoint(&self) -> Command {
        self.pack.read().await.setpoint
    }

    /// Integrate the current setpoint over `dt`
    pub async fn advance(&self, dt: Duration) {
        const TEMP_RISE_PER_KW: f64 = 2.0;
        const RELAX_STEP_C: f64 = 0.5;

        let mut pack = self.pack.write().await;
        let hours = dt.num_milliseconds() as f64 / 3_600_000.0;
        if hours <= 0.0 {
            return;
        }
        let power_kw = pack.state.rate_limits().clamp(pack.setpoint.power_kw);
        let before = pack.state.stored_kwh();
        let soc = pack.state.projected_soc(power_kw, hours);
        pack.state.soc_percent = soc;
        let moved = (pack.state.stored_kwh() - before).abs();

        pack.throughput_kwh += moved;
        let capacity = pack.state.capacity_kwh.max(0.1);
        pack.state.cycle_count = (pack.throughput_kwh / (2.0 * capacity)) as u32;

        let target_temp = self.ambient_temp_c + power_kw.abs() * TEMP_RISE_PER_KW;
        pack.state.temperature_c = if pack.state.temperature_c < target_temp {
            (pack.state.temperature_c + RELAX_STEP_C).min(target_temp)
        } else {
            (pack.state.temperature_c - RELAX_STEP_C).max(target_temp)
        };
        pack.state.timestamp = pack.state.timestamp + dt;
    }
}

#[async_trait]
impl Battery for SimulatedBattery {
    async fn read_state(&self) -> Result<BatteryState> {
        Ok(self.pack.read().await.state.clone())
    }

    async fn apply(&self, command: Command) -> Result<CommandAck> {
        let mut pack = self.pack.write().await;
        let limits = pack.state.rate_limits();
        if !command.power_kw.is_finite() || !limits.allows(command.power_kw) {
            return Ok(CommandAck::Rejected {
                reason: format!(
                    "power {:.2} kW outside [-{:.2}, {:.2}] kW",
                    command.power_kw, limits.discharge_kw, limits.charge_kw
                ),
            });
        }
        pack.setpoint = command;
        Ok(CommandAck::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn state(soc: f64) -> BatteryState {
        BatteryState {
            soc_percent: soc,
            capacity_kwh: 10.0,
            max_charge_kw: 5.0,
            max_discharge_kw: 5.0,
            efficiency: 0.9,
            cycle_count: 0,
            degradation_cost_per_cycle: 20.0,
            min_reserve_percent: 20.0,
            thermal_derate: 1.0,
            temperature_c: 25.0,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 10, 6, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_energy_queries_respect_reserve_and_capacity() {
        let b = state(50.0);
        assert!((b.chargeable_kwh() - 5.0).abs() < 1e-9);
        assert!((b.dischargeable_kwh() - 3.0).abs() < 1e-9);

        let at_reserve = state(20.0);
        assert_eq!(at_reserve.dischargeable_kwh(), 0.0);
        assert!(!at_reserve.is_above_reserve());

        let full = state(100.0);
        assert_eq!(full.chargeable_kwh(), 0.0);
        assert!(full.is_full());
    }

    #[test]
    fn test_thermal_derate_caps_rate() {
        let mut b = state(50.0);
        b.thermal_derate = 0.6;
        let limits = b.max_rate_at(25.0);
        assert!((limits.charge_kw - 3.0).abs() < 1e-9);
        assert!((limits.discharge_kw - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_temperature_curve_only_lowers_rate() {
        let b = state(50.0);
        assert_eq!(b.max_rate_at(20.0).charge_kw, 5.0);
        assert!((b.max_rate_at(55.0).charge_kw - 2.5).abs() < 1e-9);
        assert!((b.max_rate_at(-10.0).discharge_kw - 2.5).abs() < 1e-9);
        assert!(b.max_rate_at(47.5).charge_kw < 5.0);
        assert!(b.max_rate_at(90.0).charge_kw >= 2.5);
    }

    #[test]
    fn test_cycle_cost_is_proportional_to_throughput() {
        let b = state(50.0);
        assert!((b.cycle_cost(10.0) - 20.0).abs() < 1e-9);
        assert!((b.cycle_cost(-2.5) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_projected_soc_uses_efficiency_on_charge_only() {
        let b = state(50.0);
        assert!((b.projected_soc(2.0, 1.0) - 68.0).abs() < 1e-9);
        assert!((b.projected_soc(-2.0, 1.0) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_bad_telemetry() {
        let mut b = state(50.0);
        assert!(b.validate().is_ok());
        b.efficiency = 1.2;
        assert!(matches!(b.validate(), Err(BatteryError::InvalidField { field: "efficiency", .. })));
        let mut b = state(101.0);
        b.efficiency = 0.9;
        assert_eq!(b.validate(), Err(BatteryError::SocOutOfBounds(101.0)));
        let mut b = state(50.0);
        b.thermal_derate = 0.0;
        assert!(b.validate().is_err());
    }

    #[tokio::test]
    async fn test_simulated_battery_command_is_idempotent() {
        let battery = SimulatedBattery::new(state(50.0));
        let cmd = Command { power_kw: 2.0, duration_secs: 300 };

        assert_eq!(battery.apply(cmd).await.unwrap(), CommandAck::Accepted);
        assert_eq!(battery.apply(cmd).await.unwrap(), CommandAck::Accepted);
        assert_eq!(battery.read_state().await.unwrap().soc_percent, 50.0);
        assert_eq!(battery.setpoint().await, cmd);

        battery.advance(Duration::hours(1)).await;
        let after = battery.read_state().await.unwrap();
        assert!((after.soc_percent - 68.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_simulated_battery_rejects_out_of_range_power() {
        let battery = SimulatedBattery::new(state(50.0));
        let ack = battery
            .apply(Command { power_kw: -9.0, duration_secs: 300 })
            .await
            .unwrap();
        assert!(matches!(ack, CommandAck::Rejected { .. }));
        assert_eq!(battery.setpoint().await, Command::idle(0));
    }
}
