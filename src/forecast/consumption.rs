use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, FixedOffset, Utc, Weekday};

use super::{floor_to, local_hour};
use crate::domain::{LoadForecastInterval, LoadSource};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoadPredictor: Send + Sync {
    async fn predict(&self) -> Result<Vec<LoadForecastInterval>>;
}

/// A known appliance run (EV charge, pool pump) that replaces the learned
/// profile for its window.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOverride {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub load_kw: f64,
}

impl LoadOverride {
    fn covers(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

/// Time-of-day household profile, weekday and weekend variants.
#[derive(Debug, Clone)]
pub struct ProfileLoadPredictor {
    pub utc_offset_hours: i32,
    pub horizon_hours: i64,
    pub interval_minutes: i64,
    pub overrides: Vec<LoadOverride>,
}

impl ProfileLoadPredictor {
    pub fn new(utc_offset_hours: i32, horizon_hours: i64) -> Self {
        Self {
            utc_offset_hours,
            horizon_hours,
            interval_minutes: 30,
            overrides: Vec::new(),
        }
    }

    pub fn with_override(mut self, o: LoadOverride) -> Self {
        self.overrides.push(o);
        self
    }

    /// Average household draw (kW) at `t`
    pub fn profile_kw(&self, t: DateTime<Utc>) -> f64 {
        let hh = local_hour(t, self.utc_offset_hours);
        let weekday = !matches!(self.local_weekday(t), Weekday::Sat | Weekday::Sun);
        match hh {
            h if (6.0..9.0).contains(&h) => {
                if weekday {
                    2.5
                } else {
                    1.5
                }
            }
            h if (9.0..16.0).contains(&h) => {
                if weekday {
                    0.8
                } else {
                    1.5
                }
            }
            h if (16.0..21.0).contains(&h) => 3.5,
            h if h >= 21.0 => 1.5,
            _ => 0.5,
        }
    }

    fn local_weekday(&self, t: DateTime<Utc>) -> Weekday {
        match FixedOffset::east_opt(self.utc_offset_hours * 3600) {
            Some(offset) => t.with_timezone(&offset).weekday(),
            None => t.weekday(),
        }
    }

    pub fn predict_at(&self, now: DateTime<Utc>) -> Vec<LoadForecastInterval> {
        let step = self.interval_minutes.max(1);
        let first = floor_to(now, step);
        let count = self.horizon_hours * 60 / step + 1;
        let hours = step as f64 / 60.0;

        (0..count)
            .map(|i| {
                let start = first + Duration::minutes(step * i);
                let (kw, source) = match self.overrides.iter().find(|o| o.covers(start)) {
                    Some(o) => (o.load_kw, LoadSource::ScheduledOverride),
                    None => (self.profile_kw(start), LoadSource::LearnedProfile),
                };
                LoadForecastInterval {
                    start,
                    duration_minutes: step,
                    consumption_kwh: kw * hours,
                    source,
                }
            })
            .collect()
    }
}

#[async_trait]
impl LoadPredictor for ProfileLoadPredictor {
    async fn predict(&self) -> Result<Vec<LoadForecastInterval>> {
        Ok(self.predict_at(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    // 2026-01-12 is a Monday
    #[rstest]
    #[case(Utc.with_ymd_and_hms(2026, 1, 11, 21, 30, 0).unwrap(), 2.5)] // Mon 07:30 local
    #[case(Utc.with_ymd_and_hms(2026, 1, 12, 2, 0, 0).unwrap(), 0.8)] // Mon 12:00
    #[case(Utc.with_ymd_and_hms(2026, 1, 12, 8, 0, 0).unwrap(), 3.5)] // Mon 18:00
    #[case(Utc.with_ymd_and_hms(2026, 1, 12, 16, 0, 0).unwrap(), 0.5)] // Tue 02:00
    #[case(Utc.with_ymd_and_hms(2026, 1, 10, 21, 30, 0).unwrap(), 1.5)] // Sun 07:30
    fn test_profile(#[case] t: DateTime<Utc>, #[case] kw: f64) {
        let p = ProfileLoadPredictor::new(10, 24);
        assert_eq!(p.profile_kw(t), kw);
    }

    #[test]
    fn test_override_replaces_profile() {
        let now = Utc.with_ymd_and_hms(2026, 1, 12, 2, 0, 0).unwrap();
        let p = ProfileLoadPredictor::new(10, 2).with_override(LoadOverride {
            start: now + Duration::minutes(30),
            end: now + Duration::minutes(90),
            load_kw: 7.0,
        });
        let fc = p.predict_at(now);
        assert_eq!(fc.len(), 5);
        assert_eq!(fc[0].source, LoadSource::LearnedProfile);
        assert!((fc[0].consumption_kwh - 0.4).abs() < 1e-9);
        assert_eq!(fc[1].source, LoadSource::ScheduledOverride);
        assert!((fc[1].consumption_kwh - 3.5).abs() < 1e-9);
        assert_eq!(fc[2].source, LoadSource::ScheduledOverride);
        assert_eq!(fc[3].source, LoadSource::LearnedProfile);
    }
}
