//! Receding-horizon dispatch over a discretized state of charge.
//!
//! Values are computed backwards from the end of the timeline, where energy
//! left above the reserve is worth what it would save at the mean import
//! price. Every step moves from an exact stored energy to any reachable
//! energy, grid level or not, with the continuation value interpolated
//! between levels. Only the first action is returned as a command.

use tracing::debug;

use super::{ActionBounds, Dispatch, PlannedStep};
use crate::config::OptimizerConfig;
use crate::domain::{BatteryState, Command, Mode, RateLimits, Timeline, TimelineInterval};
use crate::error::EngineError;

/// Values closer than this are treated as equal
const VALUE_TOLERANCE: f64 = 1e-9;
const ENERGY_EPS: f64 = 1e-9;

/// Physics and prices shared by every transition
struct PackModel {
    capacity_kwh: f64,
    efficiency: f64,
    limits: RateLimits,
    degradation_cost_per_kwh: f64,
}

impl PackModel {
    /// Change in stored energy from holding `power_kw` for `hours`
    fn stored_delta(&self, power_kw: f64, hours: f64) -> f64 {
        if power_kw >= 0.0 {
            power_kw * hours * self.efficiency
        } else {
            power_kw * hours
        }
    }

    /// Power needed to move stored energy by `delta_kwh` in `hours`
    fn power_for(&self, delta_kwh: f64, hours: f64) -> f64 {
        if delta_kwh >= 0.0 {
            delta_kwh / (self.efficiency * hours)
        } else {
            delta_kwh / hours
        }
    }

    /// Largest charge (kW) that fits the headroom above `e` within `hours`
    fn fill_kw(&self, e: f64, hours: f64) -> f64 {
        self.limits
            .charge_kw
            .min((self.capacity_kwh - e).max(0.0) / (self.efficiency * hours))
    }

    /// Largest discharge (kW) that stays above `floor` within `hours`
    fn drain_kw(&self, e: f64, floor: f64, hours: f64) -> f64 {
        self.limits.discharge_kw.min((e - floor).max(0.0) / hours)
    }

    /// Powers worth scoring from stored energy `e` over `iv`: idle, the
    /// rate-limited extremes, every reachable level, and the powers that
    /// exactly cover the load or absorb the solar surplus.
    fn candidates(&self, iv: &TimelineInterval, e: f64, floor: f64, levels: &[f64]) -> Vec<f64> {
        let h = iv.hours();
        let mut out = Vec::with_capacity(levels.len() + 5);
        out.push(0.0);
        out.push(self.fill_kw(e, h));
        out.push(-self.drain_kw(e, floor, h));
        out.push(-iv.net_load_kw().max(0.0));
        out.push(iv.solar_surplus_kw());
        out.extend(levels.iter().map(|l| self.power_for(l - e, h)));
        out
    }

    /// Stored energy after holding `power_kw` from `e` over `hours`, or
    /// `None` when that breaks a rate limit, overfills, or discharges
    /// below `floor`.
    fn settle(&self, e: f64, power_kw: f64, hours: f64, floor: f64) -> Option<f64> {
        if !self.limits.allows(power_kw) {
            return None;
        }
        let next = e + self.stored_delta(power_kw, hours);
        if next > self.capacity_kwh + ENERGY_EPS || (power_kw < 0.0 && next < floor - ENERGY_EPS) {
            return None;
        }
        Some(next.clamp(0.0, self.capacity_kwh))
    }

    /// Unweighted value (cents) and net grid energy (kWh, + import) of
    /// holding `power_kw` over `iv`. AC-side battery flow is `power × hours`
    /// in both directions.
    fn reward(&self, iv: &TimelineInterval, power_kw: f64) -> (f64, f64) {
        let flow_kwh = power_kw * iv.hours();
        let grid_kwh = iv.net_load_kwh() + flow_kwh;
        let imported = grid_kwh.max(0.0);
        let exported = (-grid_kwh).max(0.0);
        let value = iv.export_price * exported
            - iv.import_price * imported
            - self.degradation_cost_per_kwh * flow_kwh.abs();
        (value, grid_kwh)
    }

    /// Worth (cents per stored kWh) of energy still held at the horizon:
    /// the import it would displace, less the cost of cycling it out.
    fn terminal_rate(&self, intervals: &[TimelineInterval]) -> f64 {
        if intervals.is_empty() {
            return 0.0;
        }
        let mean_import =
            intervals.iter().map(|iv| iv.import_price).sum::<f64>() / intervals.len() as f64;
        (mean_import * self.efficiency - self.degradation_cost_per_kwh).max(0.0)
    }
}

/// One scored transition
#[derive(Debug, Clone, Copy)]
struct Move {
    power_kw: f64,
    value: f64,
    energy_kwh: f64,
}

impl Move {
    /// Higher value wins; within tolerance the smaller magnitude does
    fn beats(&self, other: &Move) -> bool {
        self.value > other.value + VALUE_TOLERANCE
            || ((self.value - other.value).abs() <= VALUE_TOLERANCE
                && self.power_kw.abs() < other.power_kw.abs())
    }
}

/// Where a step starts and what follows it
struct Step<'a> {
    iv: &'a TimelineInterval,
    weight: f64,
    energy_kwh: f64,
    floor_kwh: f64,
    levels: &'a [f64],
    next: &'a [f64],
}

impl Step<'_> {
    /// Best of `powers` that settles inside the pack's bounds and passes `admit`
    fn choose(
        &self,
        model: &PackModel,
        powers: impl IntoIterator<Item = f64>,
        admit: impl Fn(f64) -> bool,
    ) -> Option<Move> {
        let h = self.iv.hours();
        let mut best: Option<Move> = None;
        for p in powers {
            if !p.is_finite() || !admit(p) {
                continue;
            }
            let Some(e_next) = model.settle(self.energy_kwh, p, h, self.floor_kwh) else {
                continue;
            };
            let (r, _) = model.reward(self.iv, p);
            let candidate = Move {
                power_kw: p,
                value: self.weight * r + interpolate(self.levels, self.next, e_next),
                energy_kwh: e_next,
            };
            if best.map_or(true, |b| candidate.beats(&b)) {
                best = Some(candidate);
            }
        }
        best
    }

    /// Unconstrained best move; idle always settles
    fn best(&self, model: &PackModel) -> Move {
        let powers = model.candidates(self.iv, self.energy_kwh, self.floor_kwh, self.levels);
        self.choose(model, powers, |_| true).unwrap_or_else(|| Move {
            power_kw: 0.0,
            value: self.weight * model.reward(self.iv, 0.0).0
                + interpolate(self.levels, self.next, self.energy_kwh),
            energy_kwh: self.energy_kwh,
        })
    }
}

/// Row `t` is the value of entering interval `t` at each level; the last
/// row is the terminal value.
struct ValueTable {
    values: Vec<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct DispatchOptimizer {
    cfg: OptimizerConfig,
    degradation_cost_per_kwh: f64,
}

impl DispatchOptimizer {
    /// `degradation_cost_per_kwh` is the site-configured rate; the pack's own
    /// rate is used instead when it is higher.
    pub fn new(cfg: OptimizerConfig, degradation_cost_per_kwh: f64) -> Self {
        Self {
            cfg,
            degradation_cost_per_kwh,
        }
    }

    pub fn optimize(
        &self,
        mode: Mode,
        timeline: &Timeline,
        battery: &BatteryState,
    ) -> Result<Dispatch, EngineError> {
        let intervals = timeline.intervals();
        let capacity = battery.capacity_kwh;
        let reserve = battery.reserve_kwh().min(capacity);
        let e0 = battery.stored_kwh().clamp(0.0, capacity);

        let model = PackModel {
            capacity_kwh: capacity,
            efficiency: battery.efficiency,
            limits: battery.rate_limits(),
            degradation_cost_per_kwh: self
                .degradation_cost_per_kwh
                .max(battery.degradation_cost_per_kwh()),
        };
        let levels = self.levels(reserve, capacity);
        let weights = self.weights(timeline);
        let table = backward(&model, intervals, &weights, &levels);

        let first = timeline.current();
        let h = first.hours();
        let floor = match (mode, self.cfg.vpp_emergency_floor_percent) {
            (Mode::VppDispatch, Some(pct)) => (capacity * pct / 100.0).min(reserve),
            _ => reserve,
        };
        let max_discharge = model.drain_kw(e0, floor, h);
        let max_charge = model.fill_kw(e0, h);
        let bounds = ActionBounds::for_mode(mode, first, max_charge, max_discharge)?;

        let step = Step {
            iv: first,
            weight: weights[0],
            energy_kwh: e0,
            floor_kwh: floor,
            levels: &levels,
            next: &table.values[1],
        };
        let mut powers = model.candidates(first, e0, floor, &levels);
        powers.extend(bounds.endpoints());
        let chosen = step
            .choose(&model, powers, |p| bounds.contains(p))
            .ok_or_else(|| EngineError::InfeasibleSchedule {
                mode,
                reason: format!(
                    "no action in [{:.2}, {:.2}] kW fits rate limits and SOC {:.1}%",
                    bounds.min_kw, bounds.max_kw, battery.soc_percent
                ),
            })?;
        let power = if chosen.power_kw.abs() < ENERGY_EPS {
            0.0
        } else {
            model.limits.clamp(chosen.power_kw)
        };

        let trajectory = trace(
            &model,
            intervals,
            &weights,
            &levels,
            &table,
            reserve,
            power,
            chosen.energy_kwh,
        );
        let expected_value = trajectory.first().map(|s| s.value_cents).unwrap_or(0.0);
        debug!(
            %mode,
            power_kw = power,
            expected_value_cents = expected_value,
            horizon_value_cents = chosen.value,
            intervals = intervals.len(),
            "dispatch optimized"
        );

        Ok(Dispatch {
            mode,
            command: Command {
                power_kw: power,
                duration_secs: (first.duration_minutes * 60) as u64,
            },
            expected_value_cents: expected_value,
            horizon_value_cents: chosen.value,
            trajectory,
        })
    }

    /// Evenly spaced stored-energy levels from reserve to capacity
    fn levels(&self, reserve_kwh: f64, capacity_kwh: f64) -> Vec<f64> {
        let span = capacity_kwh - reserve_kwh;
        let n = self.cfg.soc_discretization_levels.max(2);
        if span <= ENERGY_EPS {
            return vec![capacity_kwh];
        }
        (0..n)
            .map(|i| reserve_kwh + span * i as f64 / (n - 1) as f64)
            .collect()
    }

    /// Interval confidence decayed by distance from now, never increasing
    /// along the timeline.
    fn weights(&self, timeline: &Timeline) -> Vec<f64> {
        let origin = timeline.current().start;
        let keep = (1.0 - self.cfg.confidence_decay_per_hour).clamp(0.0, 1.0);
        let mut running = 1.0_f64;
        let mut out = Vec::with_capacity(timeline.len());
        for iv in timeline.intervals() {
            let hours = (iv.start - origin).num_minutes() as f64 / 60.0;
            let w = iv.confidence.clamp(0.0, 1.0) * keep.powf(hours);
            running = running.min(w);
            out.push(running);
        }
        out
    }
}

fn backward(
    model: &PackModel,
    intervals: &[TimelineInterval],
    weights: &[f64],
    levels: &[f64],
) -> ValueTable {
    let t_len = intervals.len();
    let reserve = levels[0];
    let mut values = vec![vec![0.0; levels.len()]; t_len + 1];

    let rate = model.terminal_rate(intervals) * weights.last().copied().unwrap_or(0.0);
    values[t_len] = levels.iter().map(|l| (l - reserve).max(0.0) * rate).collect();

    for t in (1..t_len).rev() {
        let (head, tail) = values.split_at_mut(t + 1);
        for (j, &e) in levels.iter().enumerate() {
            let step = Step {
                iv: &intervals[t],
                weight: weights[t],
                energy_kwh: e,
                floor_kwh: reserve,
                levels,
                next: &tail[0],
            };
            head[t][j] = step.best(model).value;
        }
    }

    ValueTable { values }
}

/// Linear interpolation of a value row; clamps outside the grid
fn interpolate(levels: &[f64], row: &[f64], e: f64) -> f64 {
    let last = levels.len() - 1;
    if last == 0 || e <= levels[0] {
        return row[0];
    }
    if e >= levels[last] {
        return row[last];
    }
    let i = levels.partition_point(|l| *l <= e).saturating_sub(1).min(last - 1);
    let (l0, l1) = (levels[i], levels[i + 1]);
    let x = (e - l0) / (l1 - l0);
    row[i] + x * (row[i + 1] - row[i])
}

/// Forward simulation from the exact energy after the first action
#[allow(clippy::too_many_arguments)]
fn trace(
    model: &PackModel,
    intervals: &[TimelineInterval],
    weights: &[f64],
    levels: &[f64],
    table: &ValueTable,
    reserve: f64,
    first_power: f64,
    e1: f64,
) -> Vec<PlannedStep> {
    let soc = |e: f64| e / model.capacity_kwh * 100.0;
    let step = |iv: &TimelineInterval, power_kw: f64, e_end: f64| {
        let (value, grid_kwh) = model.reward(iv, power_kw);
        PlannedStep {
            start: iv.start,
            duration_minutes: iv.duration_minutes,
            power_kw,
            soc_percent: soc(e_end),
            grid_kwh,
            value_cents: value,
        }
    };

    let mut out = Vec::with_capacity(intervals.len());
    out.push(step(&intervals[0], first_power, e1));

    let mut e = e1;
    for (t, iv) in intervals.iter().enumerate().skip(1) {
        let m = Step {
            iv,
            weight: weights[t],
            energy_kwh: e,
            floor_kwh: reserve,
            levels,
            next: &table.values[t + 1],
        }
        .best(model);
        out.push(step(iv, m.power_kw, m.energy_kwh));
        e = m.energy_kwh;
    }
    out
}
