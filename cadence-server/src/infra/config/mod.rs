//! Runtime configuration: `cadence.toml` plus environment overrides.

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    Config, ConfigMetadata, DatabaseConfig, ScheduleConfig, ScoringServiceConfig,
    ServerConfig,
};
pub use validation::{ConfigWarning, ConfigWarnings};
