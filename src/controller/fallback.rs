use crate::domain::{BatteryState, Command};

/// Command emitted when a cycle cannot produce a decision.
///
/// Holds the last acknowledged command for a fresh duration. A discharge is
/// only held while the last known SOC is above reserve; otherwise, or with
/// no previous command, the battery idles.
pub fn fallback_command(
    previous: Option<Command>,
    last_battery: Option<&BatteryState>,
    duration_secs: u64,
) -> Command {
    match previous {
        Some(cmd) if cmd.is_discharge() => match last_battery {
            Some(b) if b.is_above_reserve() => Command { duration_secs, ..cmd },
            _ => Command::idle(duration_secs),
        },
        Some(cmd) => Command { duration_secs, ..cmd },
        None => Command::idle(duration_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;

    fn battery(soc: f64) -> BatteryState {
        BatteryState {
            soc_percent: soc,
            capacity_kwh: 13.5,
            max_charge_kw: 5.0,
            max_discharge_kw: 5.0,
            efficiency: 0.9,
            cycle_count: 0,
            degradation_cost_per_cycle: 5.0,
            min_reserve_percent: 20.0,
            thermal_derate: 1.0,
            temperature_c: 25.0,
            timestamp: Utc::now(),
        }
    }

    #[rstest]
    #[case(None, Some(60.0), 0.0)]
    #[case(Some(3.0), Some(60.0), 3.0)]
    #[case(Some(3.0), Some(20.0), 3.0)]
    #[case(Some(-2.0), Some(60.0), -2.0)]
    #[case(Some(-2.0), Some(20.0), 0.0)]
    #[case(Some(-2.0), Some(10.0), 0.0)]
    #[case(Some(-2.0), None, 0.0)]
    fn test_fallback(#[case] previous_kw: Option<f64>, #[case] soc: Option<f64>, #[case] expected_kw: f64) {
        let previous = previous_kw.map(|p| Command { power_kw: p, duration_secs: 120 });
        let b = soc.map(battery);
        let cmd = fallback_command(previous, b.as_ref(), 300);
        assert_eq!(cmd.power_kw, expected_kw);
        assert_eq!(cmd.duration_secs, 300);
    }
}
