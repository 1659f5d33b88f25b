use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tsync_core::Credentials;
use tsync_fetch::HttpClientConfig;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub credentials_path: PathBuf,
    pub base_url_template: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub min_request_interval_ms: Option<u64>,
    pub blacklist_table: String,
    pub watermark_table: String,
    pub table_prefix: String,
    pub max_parallel_projects: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://tracker_sync.db".to_string(),
            credentials_path: PathBuf::from("./credentials.json"),
            base_url_template: "https://{instance}.atlassian.net".to_string(),
            user_agent: "tracker-sync/0.1".to_string(),
            http_timeout_secs: 30,
            min_request_interval_ms: None,
            blacklist_table: "blacklist_table".to_string(),
            watermark_table: "jira_sync_metadata".to_string(),
            table_prefix: "jira_issues".to_string(),
            max_parallel_projects: 1,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            credentials_path: std::env::var("TSYNC_CREDENTIALS")
                .map(PathBuf::from)
                .unwrap_or(defaults.credentials_path),
            base_url_template: std::env::var("TSYNC_BASE_URL_TEMPLATE")
                .unwrap_or(defaults.base_url_template),
            user_agent: std::env::var("TSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("TSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            min_request_interval_ms: std::env::var("TSYNC_MIN_REQUEST_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
            blacklist_table: std::env::var("TSYNC_BLACKLIST_TABLE")
                .unwrap_or(defaults.blacklist_table),
            watermark_table: std::env::var("TSYNC_WATERMARK_TABLE")
                .unwrap_or(defaults.watermark_table),
            table_prefix: std::env::var("TSYNC_TABLE_PREFIX").unwrap_or(defaults.table_prefix),
            max_parallel_projects: std::env::var("TSYNC_MAX_PARALLEL_PROJECTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_parallel_projects),
            scheduler_enabled: std::env::var("TSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            min_request_interval: self.min_request_interval_ms.map(Duration::from_millis),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading credentials {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing credentials {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("credentials {} have an empty {field}", path.display())]
    MissingField { path: PathBuf, field: &'static str },
}

/// Reads the credentials document; YAML when the extension says so, JSON otherwise.
pub fn load_credentials(path: impl AsRef<Path>) -> Result<Credentials, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let credentials: Credentials = if is_yaml {
        serde_yaml::from_str(&text).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?
    } else {
        serde_json::from_str(&text).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?
    };

    for (field, value) in [("username", &credentials.username), ("token", &credentials.token)] {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField {
                path: path.to_path_buf(),
                field,
            });
        }
    }
    Ok(credentials)
}
