use super::models::Config;

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Soft checks that do not stop startup but are worth surfacing.
pub fn collect_warnings(config: &Config) -> ConfigWarnings {
    let mut warnings = ConfigWarnings::default();

    if config.governor.units.is_empty() {
        warnings.push_with_hint(
            "No units configured; ticks will have nothing to sync",
            "Add [[governor.units]] entries to cadence.toml",
        );
    }

    if config.governor.scoring.enabled && config.scoring_service.url.is_none() {
        warnings.push_with_hint(
            "Scoring is enabled but no scoring service URL is configured; scores will not be recomputed",
            "Set CADENCE_SCORING_URL or [scoring_service].url",
        );
    }

    for unit in &config.governor.units {
        if unit.token_env.is_none() {
            warnings.push(format!(
                "Unit {}/{} has no token_env; requests will be unauthenticated",
                unit.namespace, unit.resource
            ));
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::models::{
        ConfigMetadata, DatabaseConfig, ScheduleConfig, ScoringServiceConfig, ServerConfig,
    };
    use cadence_core::config::GovernorConfig;
    use std::time::Duration;

    fn config(governor: GovernorConfig) -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 5,
                run_migrations: true,
            },
            scoring_service: ScoringServiceConfig {
                url: None,
                api_key: None,
            },
            schedule: ScheduleConfig {
                tick_interval: Duration::from_secs(300),
            },
            governor,
            metadata: ConfigMetadata::default(),
        }
    }

    #[test]
    fn empty_deployment_warns_with_hints() {
        let warnings = collect_warnings(&config(GovernorConfig::default()));
        assert!(!warnings.is_empty());
        assert!(warnings.items.iter().all(|w| w.hint.is_some()));
    }

    #[test]
    fn scoring_disabled_without_units_only_warns_about_units() {
        let mut governor = GovernorConfig::default();
        governor.scoring.enabled = false;
        let warnings = collect_warnings(&config(governor));
        assert_eq!(warnings.items.len(), 1);
        assert!(warnings.items[0].message.contains("No units"));
    }
}
