use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{fallback_command, Alert, AlertSeverity, HealthMonitor, HealthStatus, ModeClassifier, RecordingSink};
use crate::config::{Config, ControllerConfig, StrategyConfig};
use crate::domain::{
    Battery, BatteryState, Command, CommandAck, CyclePhase, DecisionCycle, FailureKind,
    InputSnapshot, Mode, Rationale, RuleMatch, SeriesKind, SourceStatus,
};
use crate::error::EngineError;
use crate::forecast::{GridProvider, LoadPredictor, PriceProvider, TimelineBuilder, WeatherProvider};
use crate::optimizer::{Dispatch, DispatchOptimizer};

/// External parties one decision loop talks to. Forecast providers may be
/// shared between loops; the battery belongs to this loop alone.
#[derive(Clone)]
pub struct Collaborators {
    pub price: Arc<dyn PriceProvider>,
    pub weather: Arc<dyn WeatherProvider>,
    pub grid: Arc<dyn GridProvider>,
    pub load: Arc<dyn LoadPredictor>,
    pub battery: Arc<dyn Battery>,
    pub sink: Arc<dyn RecordingSink>,
}

/// What a cycle has learned so far; survives a deadline abort
struct CycleDraft {
    snapshot: InputSnapshot,
    mode: Option<Mode>,
    rules: Vec<RuleMatch>,
    reason: String,
    degraded: bool,
}

/// Runs decision cycles for one battery, strictly one at a time.
pub struct DecisionScheduler {
    controller: ControllerConfig,
    strategy: StrategyConfig,
    collab: Collaborators,
    builder: TimelineBuilder,
    classifier: ModeClassifier,
    optimizer: DispatchOptimizer,
    phase: RwLock<CyclePhase>,
    last_command: Mutex<Option<Command>>,
    last_battery: Mutex<Option<BatteryState>>,
    health: Mutex<HealthMonitor>,
}

impl DecisionScheduler {
    pub fn new(cfg: &Config, collab: Collaborators) -> Self {
        Self {
            controller: cfg.controller.clone(),
            strategy: cfg.strategy.clone(),
            collab,
            builder: TimelineBuilder::new(cfg.timeline.clone()),
            classifier: ModeClassifier::new(cfg.strategy.clone()),
            optimizer: DispatchOptimizer::new(
                cfg.optimizer.clone(),
                cfg.strategy.degradation_cost_per_kwh,
            ),
            phase: RwLock::new(CyclePhase::Idle),
            last_command: Mutex::new(None),
            last_battery: Mutex::new(None),
            health: Mutex::new(HealthMonitor::new(cfg.controller.alert_after_consecutive_failures)),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.read()
    }

    /// Last command the battery acknowledged
    pub fn last_command(&self) -> Option<Command> {
        *self.last_command.lock()
    }

    pub fn health(&self) -> HealthStatus {
        self.health.lock().status().clone()
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.write() = phase;
        debug!(%phase, "cycle phase");
    }

    /// Tick every decision interval until `shutdown` resolves. A cycle that
    /// overruns its tick causes the missed ticks to be skipped, never queued.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut ticker = interval(self.controller.decision_cycle_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            interval_secs = self.controller.decision_cycle_interval_secs,
            deadline_secs = self.controller.cycle_deadline_secs,
            "decision loop started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("decision loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle(Utc::now()).await;
                    let health = self.health.lock();
                    debug!(health = %health.summary(), critical = health.is_critical(), "loop health");
                }
            }
        }
    }

    /// One full cycle. Always records exactly one `DecisionCycle` and
    /// returns it.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> DecisionCycle {
        let mut draft = CycleDraft {
            snapshot: InputSnapshot::new(now),
            mode: None,
            rules: Vec::new(),
            reason: String::new(),
            degraded: false,
        };

        let deadline = self.controller.cycle_deadline();
        let outcome = match timeout(deadline, self.execute(now, &mut draft)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!(
                "cycle deadline of {}s exceeded",
                deadline.as_secs()
            ))),
        };

        let (cycle, alerts) = match outcome {
            Ok(dispatch) => {
                self.health.lock().record_success(now);
                let cycle = DecisionCycle::completed(
                    now,
                    draft.snapshot,
                    dispatch.mode,
                    dispatch.command,
                    dispatch.expected_value_cents,
                    draft.degraded,
                    Rationale {
                        reason: draft.reason,
                        rules: draft.rules,
                    },
                );
                info!(
                    cycle_id = %cycle.id(),
                    mode = %dispatch.mode,
                    power_kw = dispatch.command.power_kw,
                    expected_value_cents = dispatch.expected_value_cents,
                    status = %cycle.status(),
                    reason = %cycle.reason(),
                    "cycle complete"
                );
                (cycle, Vec::new())
            }
            Err(err) => {
                warn!(error = %err, kind = %err.kind(), "cycle failed; emitting fallback");
                let action = self.emit_fallback().await;
                let cycle = DecisionCycle::failed(
                    now,
                    draft.snapshot,
                    draft.mode,
                    action,
                    err.to_failure(),
                    draft.rules,
                );

                let mut alerts = Vec::new();
                if err.kind() == FailureKind::CommandRejected {
                    alerts.push(Alert::new(now, AlertSeverity::Warning, err.to_string()));
                }
                if let Some(alert) = self.health.lock().record_failure(now, &err.to_string()) {
                    alerts.push(alert);
                }
                let alerts: Vec<Alert> = alerts.into_iter().map(|a| a.for_cycle(cycle.id())).collect();
                (cycle, alerts)
            }
        };

        self.set_phase(CyclePhase::Recording);
        for alert in &alerts {
            if let Err(e) = self.collab.sink.alert(alert).await {
                error!(error = %e, "failed to deliver alert");
            }
        }
        if let Err(e) = self.collab.sink.record(&cycle).await {
            error!(error = %e, cycle_id = %cycle.id(), "failed to record decision cycle");
        }
        self.set_phase(CyclePhase::Idle);
        cycle
    }

    async fn execute(&self, now: DateTime<Utc>, draft: &mut CycleDraft) -> Result<Dispatch, EngineError> {
        let c = &self.controller;
        let secs = Duration::from_secs;

        self.set_phase(CyclePhase::Gathering);
        let (price, weather, grid, load, telemetry) = tokio::join!(
            timeout(secs(c.price_timeout_secs), self.collab.price.fetch()),
            timeout(secs(c.weather_timeout_secs), self.collab.weather.fetch()),
            timeout(secs(c.grid_timeout_secs), self.collab.grid.fetch()),
            timeout(secs(c.load_timeout_secs), self.collab.load.predict()),
            timeout(secs(c.telemetry_timeout_secs), self.collab.battery.read_state()),
        );

        let statuses = [
            (SeriesKind::Price, matches!(price, Ok(Ok(_)))),
            (SeriesKind::Weather, matches!(weather, Ok(Ok(_)))),
            (SeriesKind::Grid, matches!(grid, Ok(Ok(_)))),
            (SeriesKind::Load, matches!(load, Ok(Ok(_)))),
            (SeriesKind::Telemetry, matches!(telemetry, Ok(Ok(_)))),
        ];
        {
            let mut health = self.health.lock();
            for (series, available) in statuses {
                health.record_source(series, available);
                draft.snapshot.sources.push(SourceStatus { series, available });
            }
        }

        let battery = match telemetry {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => return Err(EngineError::TelemetryUnavailable(format!("{e:#}"))),
            Err(_) => return Err(EngineError::Timeout("battery telemetry".into())),
        };
        battery.validate()?;
        let battery = self.strategy.effective_battery(&battery);
        draft.snapshot.battery_soc_percent = Some(battery.soc_percent);
        *self.last_battery.lock() = Some(battery.clone());

        let price = required(SeriesKind::Price, price)?;
        let load = required(SeriesKind::Load, load)?;
        let weather = optional(SeriesKind::Weather, weather).unwrap_or_default();
        let grid = optional(SeriesKind::Grid, grid);
        draft.degraded = statuses.iter().any(|(_, ok)| !ok);

        self.set_phase(CyclePhase::Building);
        let timeline = self.builder.merge(&price, &weather, grid.as_ref(), &load, now)?;
        draft.snapshot.timeline_intervals = timeline.len();
        draft.snapshot.vpp_event_active = timeline.vpp_event_active();
        draft.degraded |= timeline.current().degraded || timeline.is_truncated();

        self.set_phase(CyclePhase::Classifying);
        let mode = self.classifier.classify(&battery, &timeline);
        draft.mode = Some(mode);
        draft.rules = self.classifier.evaluate(&battery, &timeline);
        draft.reason = self.classifier.reason(mode, &battery, &timeline);
        debug!(
            %mode,
            reason = %draft.reason,
            soc_percent = battery.soc_percent,
            import_price = timeline.current().import_price,
            export_price = timeline.current().export_price,
            "mode classified"
        );

        self.set_phase(CyclePhase::Optimizing);
        let dispatch = self.optimizer.optimize(mode, &timeline, &battery)?;

        self.set_phase(CyclePhase::Emitting);
        self.emit(dispatch.command).await?;
        Ok(dispatch)
    }

    /// Send a command, retrying once on rejection
    async fn emit(&self, command: Command) -> Result<(), EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let reason = match timeout(self.controller.command_timeout(), self.collab.battery.apply(command)).await {
                Ok(Ok(CommandAck::Accepted)) => {
                    *self.last_command.lock() = Some(command);
                    return Ok(());
                }
                Ok(Ok(CommandAck::Rejected { reason })) => reason,
                Ok(Err(e)) => format!("{e:#}"),
                Err(_) => "command write timed out".to_string(),
            };
            warn!(attempt, power_kw = command.power_kw, %reason, "command not accepted");
            if attempt >= 2 {
                return Err(EngineError::CommandRejected(reason));
            }
        }
    }

    async fn emit_fallback(&self) -> Command {
        self.set_phase(CyclePhase::Emitting);
        let previous = self.last_command();
        let last_battery = self.last_battery.lock().clone();
        let command = fallback_command(
            previous,
            last_battery.as_ref(),
            self.controller.command_duration_secs(),
        );

        match timeout(self.controller.command_timeout(), self.collab.battery.apply(command)).await {
            Ok(Ok(CommandAck::Accepted)) => *self.last_command.lock() = Some(command),
            Ok(Ok(CommandAck::Rejected { reason })) => {
                error!(%reason, power_kw = command.power_kw, "fallback command rejected")
            }
            Ok(Err(e)) => error!(error = %e, "fallback command failed"),
            Err(_) => error!("fallback command timed out"),
        }
        command
    }
}

fn required<T>(
    series: SeriesKind,
    fetched: Result<anyhow::Result<T>, tokio::time::error::Elapsed>,
) -> Result<T, EngineError> {
    match fetched {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => {
            warn!(%series, error = %e, "required source failed");
            Err(EngineError::MissingRequiredSeries(series))
        }
        Err(_) => Err(EngineError::Timeout(format!("{series} fetch"))),
    }
}

fn optional<T>(
    series: SeriesKind,
    fetched: Result<anyhow::Result<T>, tokio::time::error::Elapsed>,
) -> Option<T> {
    match fetched {
        Ok(Ok(v)) => Some(v),
        Ok(Err(e)) => {
            warn!(%series, error = %e, "optional source failed; continuing degraded");
            None
        }
        Err(_) => {
            warn!(%series, "optional source timed out; continuing degraded");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MemorySink;
    use crate::domain::{
        CycleStatus, GridState, LoadForecastInterval, LoadSource, MockBattery, PriceInterval,
    };
    use crate::forecast::{
        MockGridProvider, MockLoadPredictor, MockPriceProvider, MockWeatherProvider, PriceSnapshot,
    };
    use chrono::{Duration as ChronoDuration, TimeZone};
    use mockall::predicate::*;
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 8, 2, 0).unwrap()
    }

    fn from() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap()
    }

    fn snapshot(import: f64) -> PriceSnapshot {
        PriceSnapshot {
            current: vec![PriceInterval::forecast(from(), 30, import, 8.0).settled()],
            forecast: (1..100)
                .map(|i| PriceInterval::forecast(from() + ChronoDuration::minutes(30 * i), 30, 30.0, 8.0))
                .collect(),
            vpp_event_active: false,
            fetched_at: now(),
        }
    }

    fn load() -> Vec<LoadForecastInterval> {
        (0..100)
            .map(|i| LoadForecastInterval {
                start: from() + ChronoDuration::minutes(30 * i),
                duration_minutes: 30,
                consumption_kwh: 0.5,
                source: LoadSource::LearnedProfile,
            })
            .collect()
    }

    fn grid() -> GridState {
        GridState {
            region: "NSW1".into(),
            demand_mw: 8000.0,
            generation_mix: BTreeMap::new(),
            interconnector_flow_mw: 0.0,
            renewables_percent: 35.0,
            timestamp: now(),
        }
    }

    fn state(soc: f64) -> BatteryState {
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
            timestamp: now(),
        }
    }

    struct Mocks {
        price: MockPriceProvider,
        weather: MockWeatherProvider,
        grid: MockGridProvider,
        load: MockLoadPredictor,
        battery: MockBattery,
    }

    impl Mocks {
        /// Every source healthy; cheap current import price
        fn healthy() -> Self {
            let mut price = MockPriceProvider::new();
            price.expect_fetch().returning(|| Ok(snapshot(-5.0)));
            let mut weather = MockWeatherProvider::new();
            weather.expect_fetch().returning(|| Ok(vec![]));
            let mut grid_p = MockGridProvider::new();
            grid_p.expect_fetch().returning(|| Ok(grid()));
            let mut load_p = MockLoadPredictor::new();
            load_p.expect_predict().returning(|| Ok(load()));
            let mut battery = MockBattery::new();
            battery.expect_read_state().returning(|| Ok(state(50.0)));
            Self { price, weather, grid: grid_p, load: load_p, battery }
        }

        fn build(self, sink: Arc<MemorySink>) -> DecisionScheduler {
            let collab = Collaborators {
                price: Arc::new(self.price),
                weather: Arc::new(self.weather),
                grid: Arc::new(self.grid),
                load: Arc::new(self.load),
                battery: Arc::new(self.battery),
                sink,
            };
            DecisionScheduler::new(&Config::default(), collab)
        }
    }

    #[tokio::test]
    async fn test_cheap_price_charges_at_full_rate() {
        let mut mocks = Mocks::healthy();
        mocks
            .battery
            .expect_apply()
            .withf(|c| (c.power_kw - 5.0).abs() < 1e-6)
            .times(1)
            .returning(|_| Ok(CommandAck::Accepted));
        let sink = Arc::new(MemorySink::new());
        let scheduler = mocks.build(sink.clone());

        let cycle = scheduler.run_cycle(now()).await;
        assert_eq!(cycle.mode(), Some(Mode::GridCharge));
        // weather was empty, so solar is unknown everywhere
        assert_eq!(cycle.status(), CycleStatus::Degraded);
        assert_eq!(scheduler.phase(), CyclePhase::Idle);
        assert_eq!(scheduler.last_command().map(|c| c.power_kw), Some(cycle.action().power_kw));
        assert_eq!(sink.cycles().len(), 1);
        assert_eq!(cycle.snapshot().battery_soc_percent, Some(50.0));
        assert!(cycle.reason().contains("charge threshold"), "{}", cycle.reason());
        assert_eq!(cycle.rules().len(), Mode::PRIORITY.len());
        let first_match = cycle.rules().iter().find(|r| r.matched).map(|r| r.mode);
        assert_eq!(first_match, Some(Mode::GridCharge));
    }

    #[tokio::test]
    async fn test_price_failure_falls_back_to_idle() {
        let mut mocks = Mocks::healthy();
        mocks.price = MockPriceProvider::new();
        mocks
            .price
            .expect_fetch()
            .returning(|| Err(anyhow::anyhow!("HTTP 503")));
        mocks
            .battery
            .expect_apply()
            .with(eq(Command::idle(300)))
            .times(1)
            .returning(|_| Ok(CommandAck::Accepted));
        let sink = Arc::new(MemorySink::new());
        let scheduler = mocks.build(sink.clone());

        let cycle = scheduler.run_cycle(now()).await;
        assert_eq!(cycle.status(), CycleStatus::Failed);
        assert_eq!(cycle.failure().map(|f| f.kind), Some(FailureKind::MissingRequiredSeries));
        assert!(cycle.snapshot().is_missing(SeriesKind::Price));
        assert_eq!(cycle.action(), Command::idle(300));
        assert!(sink.alerts().is_empty());
        assert!(cycle.reason().contains("price"), "{}", cycle.reason());
        assert!(cycle.rules().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_twice_raises_alert() {
        let mut mocks = Mocks::healthy();
        mocks
            .battery
            .expect_apply()
            .withf(|c| c.power_kw > 0.0)
            .times(2)
            .returning(|_| Ok(CommandAck::Rejected { reason: "grid export limit".into() }));
        mocks
            .battery
            .expect_apply()
            .withf(|c| c.is_idle())
            .times(1)
            .returning(|_| Ok(CommandAck::Accepted));
        let sink = Arc::new(MemorySink::new());
        let scheduler = mocks.build(sink.clone());

        let cycle = scheduler.run_cycle(now()).await;
        assert_eq!(cycle.failure().map(|f| f.kind), Some(FailureKind::CommandRejected));
        assert_eq!(cycle.mode(), Some(Mode::GridCharge));
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains("grid export limit"));
        assert_eq!(alerts[0].cycle_id, Some(cycle.id()));
    }

    #[tokio::test]
    async fn test_invalid_telemetry_fails_cycle() {
        let mut mocks = Mocks::healthy();
        mocks.battery = MockBattery::new();
        mocks.battery.expect_read_state().returning(|| {
            let mut s = state(50.0);
            s.efficiency = 0.0;
            Ok(s)
        });
        mocks.battery.expect_apply().returning(|_| Ok(CommandAck::Accepted));
        let scheduler = mocks.build(Arc::new(MemorySink::new()));

        let cycle = scheduler.run_cycle(now()).await;
        assert_eq!(cycle.failure().map(|f| f.kind), Some(FailureKind::InvalidTelemetry));
    }

    #[tokio::test]
    async fn test_repeated_failures_alert_through_sink() {
        let mut mocks = Mocks::healthy();
        mocks.load = MockLoadPredictor::new();
        mocks.load.expect_predict().returning(|| Ok(vec![]));
        mocks.battery.expect_apply().returning(|_| Ok(CommandAck::Accepted));
        let sink = Arc::new(MemorySink::new());
        let scheduler = mocks.build(sink.clone());

        for _ in 0..3 {
            scheduler.run_cycle(now()).await;
        }
        assert_eq!(sink.cycles().len(), 3);
        assert_eq!(sink.alerts().len(), 1);
        assert_eq!(scheduler.health().consecutive_failures, 3);
    }
}
