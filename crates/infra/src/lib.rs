//! Infrastructure layer: job ledger, transports, workers, config.

pub mod config;
pub mod jobs;
pub mod transport;
pub mod workers;


pub use config::{ConfigError, TaskhubConfig};
