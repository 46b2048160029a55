//! Integration with the external xray proxy process.
//!
//! The engine is a black box that consumes a JSON configuration file,
//! accepts start/kill, and answers counter queries over an administrative
//! API ingress. This module owns:
//! - [`config`]: the typed configuration model and the bootstrap injection
//!   that guarantees the administrative channel exists
//! - [`instance`]: process lifecycle around a disposable temp config file
//! - [`projector`]: folding the diff stream onto the in-memory
//!   configuration, with hot-reload on every effective change
//! - [`stats`]: the traffic sampler turning per-process cumulative
//!   counters into a monotonic delta stream

pub mod config;
pub mod instance;
pub mod projector;
pub mod stats;

use thiserror::Error;

pub use config::XrayConfig;
pub use instance::XrayInstance;
pub use projector::{ConfigManager, ProjectError};
pub use stats::TrafficSampler;

pub type XrayResult<T> = Result<T, XrayError>;

#[derive(Debug, Error)]
pub enum XrayError {
    #[error("no configuration loaded")]
    NotLoaded,

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
