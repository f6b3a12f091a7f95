//! GridPilot strategy engine: decides every few minutes how a home battery
//! should charge or discharge given prices, solar, grid and household load.

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod optimizer;
pub mod telemetry;

pub use config::Config;
pub use error::EngineError;
