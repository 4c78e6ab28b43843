pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod shutdown;
pub mod supervisor;
pub mod telemetry;

pub use config::{Config, Settings, SettingsStore};
pub use error::{QueueError, Result};
