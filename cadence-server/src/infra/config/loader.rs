use once_cell::sync::Lazy;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use url::Url;

use cadence_core::CadenceError;

use super::{
    models::{
        Config, ConfigMetadata, DatabaseConfig, ScheduleConfig, ScoringServiceConfig,
        ServerConfig,
    },
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("cadence.toml"),
        PathBuf::from("config/cadence.toml"),
    ]
});

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        self.load_with_env(EnvConfig::gather(), env_file_loaded)
    }

    /// Compose configuration from an already gathered environment.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, warnings) =
            self.compose_config(file_config, env, config_path, env_file_loaded)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = if let Some(explicit) = &self.options.config_path {
            (explicit.clone(), true)
        } else if let Some(from_env) = &env.config_path {
            (from_env.clone(), true)
        } else if let Some(default) = DEFAULT_CONFIG_LOCATIONS
            .iter()
            .find(|candidate| candidate.exists())
        {
            (default.clone(), false)
        } else {
            return Ok((None, None));
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents =
            fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
                path: path.clone(),
                source,
            })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;

        Ok((Some(file_config), Some(path)))
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        env_file_loaded: bool,
    ) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        if config_path.is_none() {
            warnings.push_with_hint(
                "No cadence.toml detected; falling back to environment variables",
                "Create cadence.toml or point CADENCE_CONFIG at a configuration file",
            );
        }

        let FileConfig {
            server: file_server,
            database: file_database,
            scoring_service: file_scoring,
            schedule: file_schedule,
            governor: file_governor,
        } = file_config.unwrap_or_default();

        let server = ServerConfig {
            host: env
                .server_host
                .clone()
                .or(file_server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.server_port.or(file_server.port).unwrap_or(8080),
        };

        let database_url = match env
            .database_url
            .clone()
            .filter(|value| !value.trim().is_empty())
        {
            Some(url) => Some(url),
            None => match env.database_url_file.as_deref() {
                Some(path) => read_secret_file(path)?,
                None => None,
            },
        };
        let database = DatabaseConfig {
            url: database_url.or(file_database.url),
            max_connections: env
                .database_max_connections
                .or(file_database.max_connections)
                .unwrap_or(5),
            run_migrations: file_database.run_migrations.unwrap_or(true),
        };

        let scoring_url = env
            .scoring_url
            .clone()
            .or(file_scoring.url)
            .filter(|value| !value.trim().is_empty())
            .map(|raw| Url::parse(raw.trim()))
            .transpose()
            .map_err(|source| ConfigLoadError::InvalidScoringUrl { source })?;
        let scoring_api_key = env.scoring_api_key.clone().or_else(|| {
            file_scoring
                .api_key_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok())
        });
        let scoring_service = ScoringServiceConfig {
            url: scoring_url,
            api_key: scoring_api_key,
        };

        let schedule = ScheduleConfig {
            tick_interval: match env.tick_interval.clone().or(file_schedule.tick_interval) {
                Some(raw) => parse_interval("schedule.tick_interval", &raw)?,
                None => DEFAULT_TICK_INTERVAL,
            },
        };

        let mut governor = file_governor.unwrap_or_default();
        if let Some(max_concurrent) = env.max_concurrent {
            governor.queue.max_concurrent = max_concurrent;
        }
        governor.validate()?;

        let config = Config {
            server,
            database,
            scoring_service,
            schedule,
            governor,
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        };

        warnings.extend(validation::collect_warnings(&config));
        Ok((config, warnings))
    }
}

fn parse_interval(field: &'static str, raw: &str) -> Result<Duration, ConfigLoadError> {
    let interval = humantime::parse_duration(raw.trim()).map_err(|source| {
        ConfigLoadError::InvalidInterval {
            field,
            value: raw.to_string(),
            source,
        }
    })?;
    if interval.is_zero() {
        return Err(ConfigLoadError::ZeroInterval { field });
    }
    Ok(interval)
}

/// Reads a file's trimmed contents, treating an empty file as unset.
fn read_secret_file(path: &Path) -> Result<Option<String>, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| {
        ConfigLoadError::SecretFileIo {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {field} '{value}'")]
    InvalidInterval {
        field: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },
    #[error("invalid scoring service URL")]
    InvalidScoringUrl {
        #[source]
        source: url::ParseError,
    },
    #[error("failed to read secret file {path}")]
    SecretFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Governor(#[from] CadenceError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}
