//! Wires configuration into a running governor.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use cadence_core::Governor;
use cadence_core::adapter::{GovernedUnit, build_unit};
use cadence_core::config::UnitConfig;
use cadence_core::scoring::{HttpScoringClient, ScoringCollaborator};
use cadence_core::store::PostgresStore;

use super::config::{Config, DatabaseConfig};

const USER_AGENT: &str = concat!("cadence/", env!("CARGO_PKG_VERSION"));

pub fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")
}

pub async fn connect_store(database: &DatabaseConfig) -> anyhow::Result<Arc<PostgresStore>> {
    let url = database.url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("DATABASE_URL or [database].url must be provided")
    })?;
    if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
        return Err(anyhow::anyhow!(
            "Invalid database URL: must start with postgres:// or postgresql://"
        ));
    }

    let store = PostgresStore::connect(url, database.max_connections, database.run_migrations)
        .await
        .context("failed to open governor store")?;
    Ok(Arc::new(store))
}

/// Resolve each unit's token from the environment variable it names.
pub fn build_units<F>(
    units: &[UnitConfig],
    http: &reqwest::Client,
    lookup: F,
) -> anyhow::Result<Vec<GovernedUnit>>
where
    F: Fn(&str) -> Option<String>,
{
    units
        .iter()
        .map(|unit| {
            let token = match unit.token_env.as_deref() {
                Some(name) => {
                    let token = lookup(name).filter(|value| !value.trim().is_empty());
                    if token.is_none() {
                        warn!(
                            unit = %format!("{}/{}", unit.namespace, unit.resource),
                            env = name,
                            "token variable is unset; requests will be unauthenticated"
                        );
                    }
                    token
                }
                None => None,
            };
            build_unit(unit, token, http.clone()).with_context(|| {
                format!("invalid unit {}/{}", unit.namespace, unit.resource)
            })
        })
        .collect()
}

pub fn build_scorer(
    config: &Config,
    http: &reqwest::Client,
) -> Option<Arc<dyn ScoringCollaborator>> {
    if !config.governor.scoring.enabled {
        return None;
    }
    let url = config.scoring_service.url.clone()?;
    let mut client = HttpScoringClient::new(http.clone(), url);
    if let Some(key) = &config.scoring_service.api_key {
        client = client.with_api_key(key.clone());
    }
    Some(Arc::new(client))
}

pub async fn build_governor(config: &Config) -> anyhow::Result<Arc<Governor<PostgresStore>>> {
    let store = connect_store(&config.database).await?;
    let http = http_client()?;
    let units = build_units(&config.governor.units, &http, |name| std::env::var(name).ok())?;
    let scorer = build_scorer(config, &http);

    info!(
        units = units.len(),
        max_concurrent = config.governor.queue.max_concurrent,
        page_size = config.governor.queue.page_size,
        lease_timeout_secs = config.governor.lease.timeout_secs,
        max_attempts = config.governor.lease.max_attempts,
        retention_days = config.governor.backfill.retention_days,
        scoring = scorer.is_some(),
        "governor configuration in effect"
    );

    Ok(Arc::new(Governor::new(
        store,
        config.governor.clone(),
        units,
        scorer,
    )))
}
