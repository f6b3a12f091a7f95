use serde::{Deserialize, Serialize};

use crate::domain::{Mode, TimelineInterval};
use crate::error::EngineError;

/// Smallest power (kW) that counts as actively charging or discharging
pub const MIN_ACTIVE_KW: f64 = 0.01;

const EPS: f64 = 1e-9;

/// Signed power window (kW) the chosen mode allows for the first action.
/// Either end may be infinite; physical limits are applied separately.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionBounds {
    pub min_kw: f64,
    pub max_kw: f64,
}

impl ActionBounds {
    pub fn new(min_kw: f64, max_kw: f64) -> Self {
        Self { min_kw, max_kw }
    }

    /// `max_charge_kw` and `max_discharge_kw` are what the pack can actually
    /// sustain over `iv` without overfilling or crossing its floor.
    pub fn for_mode(
        mode: Mode,
        iv: &TimelineInterval,
        max_charge_kw: f64,
        max_discharge_kw: f64,
    ) -> Result<Self, EngineError> {
        let net_load_kw = iv.net_load_kw().max(0.0);
        let bounds = match mode {
            Mode::Idle => Self::new(0.0, 0.0),
            Mode::GridCharge => Self::new(MIN_ACTIVE_KW, f64::INFINITY),
            Mode::SolarCharge => {
                let surplus = iv.solar_surplus_kw();
                if surplus < MIN_ACTIVE_KW {
                    return Err(EngineError::InfeasibleSchedule {
                        mode,
                        reason: format!("solar surplus {surplus:.3} kW too small to charge from"),
                    });
                }
                // at least the surplus, or whatever fills the pack
                Self::new(surplus.min(max_charge_kw).max(MIN_ACTIVE_KW), surplus)
            }
            Mode::PeakSell => Self::new(f64::NEG_INFINITY, -MIN_ACTIVE_KW),
            Mode::SelfConsume => Self::new(-net_load_kw, 0.0),
            Mode::SpikeShield => {
                Self::new(f64::NEG_INFINITY, -net_load_kw.min(max_discharge_kw.max(0.0)))
            }
            Mode::VppDispatch => {
                if max_discharge_kw < MIN_ACTIVE_KW {
                    return Err(EngineError::InfeasibleSchedule {
                        mode,
                        reason: "no dischargeable energy for VPP dispatch".into(),
                    });
                }
                Self::new(-max_discharge_kw, -max_discharge_kw)
            }
        };
        Ok(bounds)
    }

    pub fn contains(&self, power_kw: f64) -> bool {
        power_kw >= self.min_kw - EPS && power_kw <= self.max_kw + EPS
    }

    /// Finite ends of the window
    pub fn endpoints(&self) -> impl Iterator<Item = f64> {
        [self.min_kw, self.max_kw].into_iter().filter(|p| p.is_finite())
    }
}
