//! Environment-driven configuration for `refreshctl`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use refresh_batch::{MediaType, PopularitySql};
use refresh_coord::{
    ActiveRunSource, FileRunSource, ResourceTagRegistry, StaticRunSource, DEFAULT_POLL_INTERVAL,
};
use tracing::warn;

const DEFAULT_ENVIRONMENT: &str = "staging";
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Process-wide settings read once at startup. Command-line flags override them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlConfig {
    pub database_url: Option<String>,
    /// Deployment context used to look up resource tags.
    pub environment: String,
    /// JSON snapshot of scheduler runs maintained by the scheduler.
    pub runs_file: Option<PathBuf>,
    /// `context -> [tag]` overrides for the built-in search-cluster registry.
    pub tags_file: Option<PathBuf>,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

impl CtlConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("REFRESH_DATABASE_URL").filter(|url| !url.trim().is_empty());
        let environment = lookup("REFRESH_ENVIRONMENT")
            .map(|env| env.trim().to_string())
            .filter(|env| !env.is_empty())
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());
        let runs_file = lookup("REFRESH_RUNS_FILE").map(PathBuf::from);
        let tags_file = lookup("REFRESH_TAGS_FILE").map(PathBuf::from);
        let poll_interval_ms = parse_u64(
            lookup("REFRESH_POLL_INTERVAL_MS"),
            DEFAULT_POLL_INTERVAL.as_millis() as u64,
        )
        .context("REFRESH_POLL_INTERVAL_MS")?
        .max(1);
        let wait_timeout_ms = parse_u64(
            lookup("REFRESH_WAIT_TIMEOUT_MS"),
            DEFAULT_WAIT_TIMEOUT.as_millis() as u64,
        )
        .context("REFRESH_WAIT_TIMEOUT_MS")?;

        Ok(Self {
            database_url,
            environment,
            runs_file,
            tags_file,
            poll_interval: Duration::from_millis(poll_interval_ms),
            wait_timeout: Duration::from_millis(wait_timeout_ms),
        })
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("no database url: pass --database-url or set REFRESH_DATABASE_URL")
    }

    /// Registry from `tags_file`, or the built-in search-cluster registry.
    pub fn registry(&self) -> Result<ResourceTagRegistry> {
        match &self.tags_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read tag registry {}", path.display()))?;
                ResourceTagRegistry::from_json(&raw)
                    .with_context(|| format!("load tag registry {}", path.display()))
            }
            None => Ok(ResourceTagRegistry::elasticsearch()),
        }
    }

    /// Scheduler view of live runs. Without a snapshot file only claims made
    /// by this process are visible.
    pub fn run_source(&self) -> Arc<dyn ActiveRunSource> {
        match &self.runs_file {
            Some(path) => Arc::new(FileRunSource::new(path)),
            None => {
                warn!("REFRESH_RUNS_FILE not set; only in-process runs are considered");
                Arc::new(StaticRunSource::default())
            }
        }
    }

    /// Per-media profiles, built once and handed to commands.
    pub fn media_profiles(&self) -> BTreeMap<MediaType, MediaProfile> {
        MediaType::ALL
            .into_iter()
            .map(|media| (media, MediaProfile::new(media)))
            .collect()
    }
}

/// Everything a command needs to know about one media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaProfile {
    pub table: String,
    pub popularity: PopularitySql,
}

impl MediaProfile {
    pub fn new(media: MediaType) -> Self {
        let popularity = PopularitySql::for_media(media);
        Self {
            table: popularity.media_table.clone(),
            popularity,
        }
    }
}

/// Scheduler id of the data refresh for `media`; refreshes are deployed once per environment.
pub fn data_refresh_workflow(environment: &str, media: MediaType) -> String {
    format!("{environment}_{media}_data_refresh")
}

/// Workflow ids of every data refresh in `environment`; only one may run at a time.
pub fn data_refresh_workflows(environment: &str) -> Vec<String> {
    MediaType::ALL
        .into_iter()
        .map(|media| data_refresh_workflow(environment, media))
        .collect()
}

/// Parses an optional `u64` with fallback default.
fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = CtlConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.environment, "staging");
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.wait_timeout, DEFAULT_WAIT_TIMEOUT);
        assert!(config.database_url().is_err());
        assert!(config.runs_file.is_none());
    }

    #[test]
    fn env_values_override_defaults() {
        let config = CtlConfig::from_lookup(lookup(&[
            ("REFRESH_DATABASE_URL", "postgres://deploy@db/openledger"),
            ("REFRESH_ENVIRONMENT", " production "),
            ("REFRESH_POLL_INTERVAL_MS", "250"),
            ("REFRESH_WAIT_TIMEOUT_MS", "0"),
        ]))
        .expect("config");
        assert_eq!(config.environment, "production");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.wait_timeout, Duration::ZERO);
        assert_eq!(
            config.database_url().expect("url"),
            "postgres://deploy@db/openledger"
        );
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = CtlConfig::from_lookup(lookup(&[("REFRESH_POLL_INTERVAL_MS", "soon")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("REFRESH_POLL_INTERVAL_MS"));
    }

    #[test]
    fn media_profiles_cover_every_media_type() {
        let config = CtlConfig::from_lookup(lookup(&[])).expect("config");
        let profiles = config.media_profiles();
        assert_eq!(profiles.len(), 2);
        let audio = &profiles[&MediaType::Audio];
        assert_eq!(audio.table, "audio");
        assert_eq!(
            data_refresh_workflow(&config.environment, MediaType::Audio),
            "staging_audio_data_refresh"
        );
        assert_eq!(
            data_refresh_workflows("production"),
            vec![
                "production_image_data_refresh",
                "production_audio_data_refresh"
            ]
        );
    }

    #[test]
    fn tag_registry_file_replaces_builtin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tags.json");
        std::fs::write(&path, r#"{"staging": ["shared_cluster"]}"#).expect("write");
        let config = CtlConfig {
            tags_file: Some(path),
            ..CtlConfig::from_lookup(lookup(&[])).expect("config")
        };
        let registry = config.registry().expect("registry");
        assert_eq!(registry.tags_for("staging"), ["shared_cluster"]);
        assert!(registry.tags_for("production").is_empty());
    }
}
