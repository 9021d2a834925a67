use std::path::PathBuf;
use std::time::Duration;

use otsync_adapters::Credentials;
use otsync_core::{SyncOutcome, VersionInfo};
use otsync_storage::{ConfigError, JsonDocumentStore, DEFAULT_RELEASE_URL};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The persisted configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub export_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub database_url: String,
    pub release_url: String,
    pub auto_update_enabled: bool,
    pub auto_update_interval_min: u64,
    pub check_version_on_startup: bool,
    pub credentials: Option<Credentials>,
    /// Last successful sync; failures never overwrite it.
    pub last_status: Option<SyncOutcome>,
    pub latest_release: Option<VersionInfo>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("./exports"),
            archive_dir: PathBuf::from("./archive"),
            database_url: "sqlite://otsync.db".to_string(),
            release_url: DEFAULT_RELEASE_URL.to_string(),
            auto_update_enabled: false,
            auto_update_interval_min: 5,
            check_version_on_startup: true,
            credentials: None,
            last_status: None,
            latest_release: None,
        }
    }
}

impl AppConfig {
    pub fn auto_update_interval(&self) -> Duration {
        Duration::from_secs(self.auto_update_interval_min.max(1) * 60)
    }

    pub fn credentials_configured(&self) -> bool {
        self.credentials
            .as_ref()
            .is_some_and(Credentials::is_complete)
    }
}

/// Process environment knobs. Unset values keep whatever the document says.
#[derive(Debug, Clone)]
pub struct SyncEnv {
    pub config_path: PathBuf,
    pub database_url: Option<String>,
    pub export_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub release_url: Option<String>,
    /// Read rows from this JSON file instead of the export directory.
    pub rows_json: Option<PathBuf>,
}

impl SyncEnv {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("OTSYNC_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config.json")),
            database_url: std::env::var("DATABASE_URL").ok(),
            export_dir: std::env::var("OTSYNC_EXPORT_DIR").ok().map(PathBuf::from),
            archive_dir: std::env::var("OTSYNC_ARCHIVE_DIR").ok().map(PathBuf::from),
            release_url: std::env::var("OTSYNC_RELEASE_URL").ok(),
            rows_json: std::env::var("OTSYNC_ROWS_JSON").ok().map(PathBuf::from),
        }
    }

    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(dir) = &self.export_dir {
            config.export_dir = dir.clone();
        }
        if let Some(dir) = &self.archive_dir {
            config.archive_dir = dir.clone();
        }
        if let Some(url) = &self.release_url {
            config.release_url = url.clone();
        }
    }
}

/// Owner of the configuration document. Every mutation goes through a
/// method here and is written back immediately.
#[derive(Debug)]
pub struct AppState {
    config: AppConfig,
    document: Option<JsonDocumentStore>,
}

impl AppState {
    pub async fn load(document: JsonDocumentStore) -> Result<Self, ConfigError> {
        let config = document.load_or_init().await?;
        Ok(Self {
            config,
            document: Some(document),
        })
    }

    /// State that lives only in memory; nothing is written to disk.
    pub fn ephemeral(config: AppConfig) -> Self {
        Self {
            config,
            document: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn apply_env(&mut self, env: &SyncEnv) -> Result<(), ConfigError> {
        env.apply(&mut self.config);
        self.persist().await
    }

    /// Keep `outcome` as the last good run. Failed outcomes are ignored.
    pub async fn record_outcome(&mut self, outcome: &SyncOutcome) -> Result<bool, ConfigError> {
        if !outcome.is_success() {
            return Ok(false);
        }
        self.config.last_status = Some(outcome.clone());
        self.persist().await?;
        Ok(true)
    }

    pub async fn record_version(&mut self, info: VersionInfo) -> Result<(), ConfigError> {
        self.config.latest_release = Some(info);
        self.persist().await
    }

    pub async fn set_auto_update(
        &mut self,
        enabled: bool,
        interval_min: u64,
    ) -> Result<(), ConfigError> {
        self.config.auto_update_enabled = enabled;
        self.config.auto_update_interval_min = interval_min.max(1);
        self.persist().await
    }

    pub async fn set_credentials(
        &mut self,
        credentials: Option<Credentials>,
    ) -> Result<(), ConfigError> {
        self.config.credentials = credentials.filter(|c| !c.username.is_empty());
        self.persist().await
    }

    async fn persist(&self) -> Result<(), ConfigError> {
        if let Some(document) = &self.document {
            document.save(&self.config).await?;
            debug!(path = %document.path().display(), "configuration saved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use otsync_core::{ErrorInfo, ErrorKind};

    #[test]
    fn interval_never_drops_below_one_minute() {
        let config = AppConfig {
            auto_update_interval_min: 0,
            ..Default::default()
        };
        assert_eq!(config.auto_update_interval(), Duration::from_secs(60));
    }

    #[test]
    fn credentials_need_both_parts() {
        let mut config = AppConfig::default();
        assert!(!config.credentials_configured());
        config.credentials = Some(Credentials {
            username: "tech".into(),
            password: String::new(),
        });
        assert!(!config.credentials_configured());
        config.credentials = Some(Credentials {
            username: "tech".into(),
            password: "pw".into(),
        });
        assert!(config.credentials_configured());
    }

    #[tokio::test]
    async fn failed_outcomes_do_not_replace_the_last_good_one() {
        let dir = tempfile::tempdir().unwrap();
        let document = JsonDocumentStore::new(dir.path().join("config.json"));
        let mut state = AppState::load(document.clone()).await.unwrap();

        let good = SyncOutcome::succeeded(Utc::now(), 2, 1);
        assert!(state.record_outcome(&good).await.unwrap());

        let bad = SyncOutcome::failed(
            Utc::now(),
            ErrorInfo {
                kind: ErrorKind::Fetch,
                detail: "unreachable".into(),
            },
        );
        assert!(!state.record_outcome(&bad).await.unwrap());
        assert_eq!(state.config().last_status.as_ref(), Some(&good));

        let reloaded = AppState::load(document).await.unwrap();
        assert_eq!(reloaded.config().last_status.as_ref(), Some(&good));
    }

    #[tokio::test]
    async fn auto_update_settings_are_persisted_and_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let document = JsonDocumentStore::new(dir.path().join("config.json"));
        let mut state = AppState::load(document.clone()).await.unwrap();
        state.set_auto_update(true, 0).await.unwrap();

        let reloaded = AppState::load(document).await.unwrap();
        assert!(reloaded.config().auto_update_enabled);
        assert_eq!(reloaded.config().auto_update_interval_min, 1);
    }

    #[test]
    fn env_overrides_replace_document_paths() {
        let env = SyncEnv {
            config_path: PathBuf::from("config.json"),
            database_url: Some("sqlite::memory:".into()),
            export_dir: Some(PathBuf::from("/tmp/exports")),
            archive_dir: None,
            release_url: None,
            rows_json: None,
        };
        let mut config = AppConfig::default();
        env.apply(&mut config);
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.export_dir, PathBuf::from("/tmp/exports"));
        assert_eq!(config.archive_dir, PathBuf::from("./archive"));
    }
}
