//! Merges price, weather, grid and load series onto the decision grid.
//!
//! Bucket layout: the first bucket starts at `now` floored to 5 minutes.
//! 5-minute buckets run through the near-term window and on to the next
//! 30-minute boundary; 30-minute buckets then run to the horizon.
//!
//! Each bucket is split at every series start that falls inside it, and each
//! piece takes the latest interval starting at or before the piece (hold last
//! value). Energy is scaled by overlap so it is conserved across resolutions.

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use tracing::{debug, warn};

use super::{floor_to, PriceSnapshot};
use crate::config::TimelineConfig;
use crate::domain::{
    GridConditions, GridState, LoadForecastInterval, LoadSource, PriceInterval, Provenance,
    Sampled, SeriesKind, SpikeState, Timeline, TimelineInterval, WeatherInterval,
};
use crate::error::EngineError;

const FINE_MINUTES: i64 = 5;
const COARSE_MINUTES: i64 = 30;

/// Part of a bucket governed by a single source interval
struct Piece<'a, T> {
    item: &'a T,
    minutes: f64,
}

impl<'a, T: Sampled> Piece<'a, T> {
    /// Share of the source interval's energy that falls in this piece
    fn energy_share(&self) -> f64 {
        self.minutes / self.item.duration_minutes().max(1) as f64
    }
}

#[derive(Debug, Clone)]
pub struct TimelineBuilder {
    cfg: TimelineConfig,
}

impl TimelineBuilder {
    pub fn new(cfg: TimelineConfig) -> Self {
        Self { cfg }
    }

    /// Start and length (minutes) of every bucket for a cycle at `now`
    pub fn buckets(&self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, i64)> {
        let first = floor_to(now, FINE_MINUTES);
        let fine_until = first + Duration::minutes(self.cfg.near_term_minutes);
        let horizon_end = now + Duration::hours(self.cfg.forecast_horizon_hours);

        let mut out = Vec::new();
        let mut t = first;
        while t < horizon_end {
            let on_coarse_boundary = floor_to(t, COARSE_MINUTES) == t;
            let len = if t < fine_until || !on_coarse_boundary {
                FINE_MINUTES
            } else {
                COARSE_MINUTES
            };
            out.push((t, len));
            t += Duration::minutes(len);
        }
        out
    }

    pub fn merge(
        &self,
        price: &PriceSnapshot,
        weather: &[WeatherInterval],
        grid: Option<&GridState>,
        load: &[LoadForecastInterval],
        now: DateTime<Utc>,
    ) -> Result<Timeline, EngineError> {
        if price.is_empty() {
            return Err(EngineError::MissingRequiredSeries(SeriesKind::Price));
        }
        let prices = price.intervals();
        if load.is_empty() {
            return Err(EngineError::MissingRequiredSeries(SeriesKind::Load));
        }

        let prices = sorted(&prices);
        let load = sorted(load);
        let weather = sorted(weather);
        let staleness = &self.cfg.staleness;
        let factor = self.cfg.degraded_confidence_factor;

        let grid_now = grid
            .filter(|g| (now - g.timestamp).num_minutes() <= staleness.grid_minutes)
            .map(GridConditions::from);
        if grid_now.is_none() {
            warn!(
                grid_minutes = staleness.grid_minutes,
                "grid state missing or stale; intervals degraded"
            );
        }

        let mut intervals = Vec::new();
        let mut cut = None;
        for (i, (start, minutes)) in self.buckets(now).into_iter().enumerate() {
            let end = start + Duration::minutes(minutes);

            let price_pieces = match resolve(&prices, start, end, staleness.price_minutes) {
                Ok(p) => p,
                Err(age) if i == 0 => {
                    return Err(EngineError::DataStale {
                        series: SeriesKind::Price,
                        age_minutes: age,
                        grace_minutes: staleness.price_minutes,
                    })
                }
                Err(age) => {
                    warn!(
                        at = %start,
                        age_minutes = age,
                        "price coverage ends; truncating timeline"
                    );
                    cut = Some((SeriesKind::Price, age, staleness.price_minutes));
                    break;
                }
            };
            let load_pieces = match resolve(&load, start, end, staleness.load_minutes) {
                Ok(p) => p,
                Err(age) if i == 0 => {
                    return Err(EngineError::DataStale {
                        series: SeriesKind::Load,
                        age_minutes: age,
                        grace_minutes: staleness.load_minutes,
                    })
                }
                Err(age) => {
                    warn!(
                        at = %start,
                        age_minutes = age,
                        "load coverage ends; truncating timeline"
                    );
                    cut = Some((SeriesKind::Load, age, staleness.load_minutes));
                    break;
                }
            };

            let mut iv = price_bucket(start, minutes, &price_pieces);
            iv.load_kwh = load_pieces
                .iter()
                .map(|p| p.item.consumption_kwh * p.energy_share())
                .sum();
            iv.load_source = if load_pieces
                .iter()
                .any(|p| p.item.source == LoadSource::ScheduledOverride)
            {
                LoadSource::ScheduledOverride
            } else {
                LoadSource::LearnedProfile
            };

            match resolve(&weather, start, end, staleness.weather_minutes) {
                Ok(pieces) => {
                    let span = minutes as f64;
                    iv.solar_kwh = pieces
                        .iter()
                        .map(|p| p.item.solar_kwh * p.energy_share())
                        .sum();
                    iv.irradiance_w_m2 = Some(weighted(&pieces, span, |w| w.irradiance_w_m2));
                    iv.cloud_cover_percent =
                        Some(weighted(&pieces, span, |w| w.cloud_cover_percent));
                    iv.temperature_c = Some(weighted(&pieces, span, |w| w.temperature_c));
                }
                Err(_) => {
                    iv.solar_kwh = 0.0;
                    iv.degraded = true;
                    iv.confidence *= factor;
                }
            }

            match grid_now {
                Some(g) => iv.grid = Some(g),
                None => {
                    iv.degraded = true;
                    iv.confidence *= factor;
                }
            }

            intervals.push(iv);
        }

        let timeline = Timeline::new(now, intervals)?
            .with_vpp_event(price.vpp_event_active)
            .with_truncation(cut.is_some());
        if let Some((series, age_minutes, grace_minutes)) = cut {
            let min_horizon = self.cfg.min_horizon_hours.min(self.cfg.forecast_horizon_hours);
            if timeline.span() < Duration::hours(min_horizon) {
                warn!(
                    %series,
                    span_minutes = timeline.span().num_minutes(),
                    min_horizon_hours = min_horizon,
                    "timeline shorter than the minimum horizon"
                );
                return Err(EngineError::DataStale {
                    series,
                    age_minutes,
                    grace_minutes,
                });
            }
        }
        debug!(
            built_for = %timeline.built_for(),
            intervals = timeline.len(),
            span_hours = timeline.span().num_minutes() as f64 / 60.0,
            degraded = timeline.has_degraded_intervals(),
            truncated = timeline.is_truncated(),
            vpp = timeline.vpp_event_active(),
            "timeline built"
        );
        Ok(timeline)
    }
}

fn sorted<T: Sampled>(series: &[T]) -> Vec<&T> {
    series.iter().sorted_by_key(|s| s.start()).collect()
}

/// Split `[b0, b1)` at every series start inside it and find the interval
/// held over each piece. `Err` carries the distance (minutes) between the
/// first uncovered instant and the nearest coverage.
fn resolve<'a, T: Sampled>(
    series: &[&'a T],
    b0: DateTime<Utc>,
    b1: DateTime<Utc>,
    grace_minutes: i64,
) -> Result<Vec<Piece<'a, T>>, i64> {
    let cuts: Vec<DateTime<Utc>> = std::iter::once(b0)
        .chain(series.iter().map(|s| s.start()).filter(|s| *s > b0 && *s < b1))
        .chain(std::iter::once(b1))
        .dedup()
        .collect();

    cuts.iter()
        .tuple_windows()
        .map(|(p0, p1)| {
            let item = held_at(series, *p0, grace_minutes)?;
            Ok(Piece {
                item,
                minutes: (*p1 - *p0).num_seconds() as f64 / 60.0,
            })
        })
        .collect()
}

fn held_at<'a, T: Sampled>(
    series: &[&'a T],
    at: DateTime<Utc>,
    grace_minutes: i64,
) -> Result<&'a T, i64> {
    match series.partition_point(|s| s.start() <= at) {
        0 => {
            // nothing has started yet; back-fill from the first interval
            let first = series.first().ok_or(i64::MAX)?;
            let lead = (first.start() - at).num_minutes();
            if lead <= grace_minutes {
                Ok(*first)
            } else {
                Err(lead)
            }
        }
        idx => {
            let held = series[idx - 1];
            let age = (at - held.end()).num_minutes();
            if age <= grace_minutes {
                Ok(held)
            } else {
                Err(age)
            }
        }
    }
}

fn weighted<T>(pieces: &[Piece<'_, T>], span_minutes: f64, f: impl Fn(&T) -> f64) -> f64 {
    if span_minutes <= 0.0 {
        return 0.0;
    }
    pieces.iter().map(|p| f(p.item) * p.minutes).sum::<f64>() / span_minutes
}

fn price_bucket(
    start: DateTime<Utc>,
    minutes: i64,
    pieces: &[Piece<'_, PriceInterval>],
) -> TimelineInterval {
    let span = minutes as f64;
    TimelineInterval {
        start,
        duration_minutes: minutes,
        import_price: weighted(pieces, span, |p| p.import_price),
        export_price: weighted(pieces, span, |p| p.export_price),
        spike: pieces
            .iter()
            .map(|p| p.item.spike)
            .max()
            .unwrap_or(SpikeState::None),
        provenance: if pieces
            .iter()
            .any(|p| p.item.provenance == Provenance::Forecast)
        {
            Provenance::Forecast
        } else {
            Provenance::Actual
        },
        solar_kwh: 0.0,
        load_kwh: 0.0,
        load_source: LoadSource::LearnedProfile,
        irradiance_w_m2: None,
        cloud_cover_percent: None,
        temperature_c: None,
        grid: None,
        confidence: pieces
            .iter()
            .map(|p| p.item.confidence)
            .fold(1.0, f64::min),
        degraded: false,
    }
}
