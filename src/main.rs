use anyhow::{Context, Result};
use gridpilot::{config::Config, telemetry};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Config::load().context("failed to load configuration")?;
    telemetry::init_tracing(&cfg.log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        region = %cfg.site.nem_region,
        horizon_hours = cfg.timeline.forecast_horizon_hours,
        "starting GridPilot strategy engine"
    );

    run(cfg).await
}

#[cfg(feature = "sim")]
async fn run(cfg: Config) -> Result<()> {
    use chrono::Utc;
    use gridpilot::controller::{Collaborators, DecisionScheduler, TracingSink};
    use gridpilot::domain::SimulatedBattery;
    use gridpilot::forecast::{
        ProfileLoadPredictor, SimulatedGridProvider, SimulatedPriceProvider, SimulatedWeatherProvider,
    };
    use std::sync::Arc;
    use std::time::Duration;

    const SIM_STEP: Duration = Duration::from_secs(5);

    let offset = cfg.site.utc_offset_hours;
    let horizon = cfg.timeline.forecast_horizon_hours;
    let battery = SimulatedBattery::new_with_ambient(
        cfg.battery.initial_state(Utc::now()),
        cfg.battery.ambient_temp_c,
    );

    let pack = battery.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SIM_STEP);
        loop {
            ticker.tick().await;
            pack.advance(chrono::Duration::seconds(SIM_STEP.as_secs() as i64)).await;
        }
    });

    let collab = Collaborators {
        price: Arc::new(SimulatedPriceProvider::new(offset, horizon)),
        weather: Arc::new(SimulatedWeatherProvider::new(offset, horizon)),
        grid: Arc::new(SimulatedGridProvider::new(cfg.site.nem_region.clone(), offset)),
        load: Arc::new(ProfileLoadPredictor::new(offset, horizon)),
        battery: Arc::new(battery),
        sink: Arc::new(TracingSink),
    };

    let scheduler = DecisionScheduler::new(&cfg, collab);
    scheduler.run(telemetry::shutdown_signal()).await;

    let health = scheduler.health();
    info!(
        total_cycles = health.total_cycles,
        total_failures = health.total_failures,
        "shutdown complete"
    );
    Ok(())
}

#[cfg(not(feature = "sim"))]
async fn run(_cfg: Config) -> Result<()> {
    anyhow::bail!("no battery or market integrations compiled in; build with --features sim")
}
