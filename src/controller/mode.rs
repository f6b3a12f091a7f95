//! Seven-mode decision table.
//!
//! Rules are tried in `Mode::PRIORITY` order and the first match wins. The
//! classifier only looks at the battery and the timeline; it has no state.

use ordered_float::OrderedFloat;

use crate::config::StrategyConfig;
use crate::domain::{BatteryState, Mode, RuleMatch, SpikeState, Timeline};

#[derive(Debug, Clone)]
pub struct ModeClassifier {
    cfg: StrategyConfig,
}

impl ModeClassifier {
    pub fn new(cfg: StrategyConfig) -> Self {
        Self { cfg }
    }

    pub fn classify(&self, battery: &BatteryState, timeline: &Timeline) -> Mode {
        let battery = self.cfg.effective_battery(battery);
        Mode::PRIORITY
            .into_iter()
            .find(|mode| self.matches(*mode, &battery, timeline))
            .unwrap_or(Mode::Idle)
    }

    /// Every rule and whether it matched, in priority order
    pub fn evaluate(&self, battery: &BatteryState, timeline: &Timeline) -> Vec<RuleMatch> {
        let battery = self.cfg.effective_battery(battery);
        Mode::PRIORITY
            .into_iter()
            .map(|mode| RuleMatch {
                mode,
                matched: self.matches(mode, &battery, timeline),
            })
            .collect()
    }

    /// Operator-facing sentence for choosing `mode` on this input
    pub fn reason(&self, mode: Mode, battery: &BatteryState, timeline: &Timeline) -> String {
        let battery = self.cfg.effective_battery(battery);
        let now = timeline.current();
        match mode {
            Mode::VppDispatch => format!(
                "VPP event active; {:.1} kWh above reserve to dispatch",
                battery.dischargeable_kwh()
            ),
            Mode::SpikeShield => format!(
                "{} price spike at {:.0}c; battery covers the house",
                now.spike, now.import_price
            ),
            Mode::GridCharge => format!(
                "import {:.1}c at or below charge threshold {:.1}c",
                now.import_price, self.cfg.charge_threshold_price
            ),
            Mode::SolarCharge => format!(
                "solar surplus {:.1} kW stored at SOC {:.0}%",
                now.solar_surplus_kw(),
                battery.soc_percent
            ),
            Mode::PeakSell => format!(
                "export {:.1}c is the peak of the next {} min",
                now.export_price, self.cfg.peak_sell_lookahead_minutes
            ),
            Mode::SelfConsume => format!(
                "import {:.1}c above wear cost {:.1}c; battery covers the house",
                now.import_price,
                self.cfg.effective_degradation_cost(&battery)
            ),
            Mode::Idle => format!(
                "no action at {:.1}c import, {:.1}c export, SOC {:.0}%",
                now.import_price, now.export_price, battery.soc_percent
            ),
        }
    }

    fn matches(&self, mode: Mode, battery: &BatteryState, timeline: &Timeline) -> bool {
        let now = timeline.current();
        match mode {
            // needs energy above the reserve
            Mode::VppDispatch => timeline.vpp_event_active() && battery.dischargeable_kwh() > 0.0,
            Mode::SpikeShield => {
                let available = battery.dischargeable_kwh();
                let spiking = match now.spike {
                    SpikeState::Actual => true,
                    SpikeState::Potential => available >= self.cfg.spike_residual_margin_kwh,
                    SpikeState::None => false,
                };
                spiking && available > 0.0
            }
            Mode::GridCharge => {
                now.import_price <= self.cfg.charge_threshold_price && battery.chargeable_kwh() > 0.0
            }
            Mode::SolarCharge => now.solar_kwh > now.load_kwh && !battery.is_full(),
            Mode::PeakSell => {
                let peak = timeline
                    .lookahead(self.cfg.peak_sell_lookahead())
                    .map(|iv| OrderedFloat(iv.export_price))
                    .max()
                    .map(|p| p.into_inner())
                    .unwrap_or(now.export_price);
                now.export_price >= peak - self.cfg.peak_sell_margin
                    && now.export_price > self.cfg.peak_sell_min_price
                    && battery.is_above_reserve()
            }
            Mode::SelfConsume => {
                now.import_price > self.cfg.effective_degradation_cost(battery)
                    && battery.is_above_reserve()
            }
            Mode::Idle => true,
        }
    }
}
