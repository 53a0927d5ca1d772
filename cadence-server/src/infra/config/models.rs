use std::path::PathBuf;
use std::time::Duration;

use cadence_core::config::GovernorConfig;
use url::Url;

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scoring_service: ScoringServiceConfig,
    pub schedule: ScheduleConfig,
    pub governor: GovernorConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub run_migrations: bool,
}

/// Where the scoring collaborator lives. `url == None` disables scoring.
#[derive(Clone)]
pub struct ScoringServiceConfig {
    pub url: Option<Url>,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ScoringServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringServiceConfig")
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    /// Delay between ticks for `run` and `serve --schedule`.
    pub tick_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
