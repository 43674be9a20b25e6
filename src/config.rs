use std::{
    collections::BTreeMap,
    fs::{self, File},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

pub const CACHE_DIR_ENV: &str = "HUB_CACHE_DIR";
pub const REMOTE_HOST_ENV: &str = "HUB_CACHE_REMOTE_HOST";
pub const TOKEN_ENV: &str = "HF_TOKEN";

const DEFAULT_REMOTE_HOST: &str = "https://huggingface.co/";
const DEFAULT_PATH_TEMPLATE: &str = "{model}/resolve/{revision}/";
const DEFAULT_REVISION: &str = "main";
const FALLBACK_CACHE_DIR: &str = ".cache/hub-cache";

/// Immutable settings for a fetcher. Nothing here is process-global, so tests
/// and callers can run side by side with distinct cache roots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct HubConfig {
    pub cache_dir: PathBuf,
    pub remote_host: String,
    /// `{model}` and `{revision}` are substituted per request.
    pub remote_path_template: String,
    pub revision: String,
    /// Read from config files but never written back out.
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
    /// Enables ranged, resumable downloads in chunks of this many bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            remote_host: DEFAULT_REMOTE_HOST.into(),
            remote_path_template: DEFAULT_PATH_TEMPLATE.into(),
            revision: DEFAULT_REVISION.into(),
            auth_token: None,
            user_agent: format!("hub-cache/{}", env!("CARGO_PKG_VERSION")),
            headers: BTreeMap::new(),
            segment_size: None,
            timeout_secs: None,
        }
    }
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("open hub config {}", path.display()))?;
        let config: Self = serde_json::from_reader(file)
            .with_context(|| format!("parse hub config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("create config directory")?;
        }
        let file = File::create(path).context("create hub config")?;
        serde_json::to_writer_pretty(file, self).context("write hub config")?;
        Ok(())
    }

    /// Defaults with `HUB_CACHE_DIR`, `HUB_CACHE_REMOTE_HOST` and `HF_TOKEN` applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.apply_env(|key| std::env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(dir) = lookup(CACHE_DIR_ENV) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(host) = lookup(REMOTE_HOST_ENV) {
            self.remote_host = host;
        }
        if let Some(token) = lookup(TOKEN_ENV) {
            self.auth_token = Some(token);
        }
        self
    }

    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_remote_host(mut self, host: impl Into<String>) -> Self {
        self.remote_host = host.into();
        self
    }

    #[must_use]
    pub fn with_remote_path_template(mut self, template: impl Into<String>) -> Self {
        self.remote_path_template = template.into();
        self
    }

    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_segment_size(mut self, bytes: Option<u64>) -> Self {
        self.segment_size = bytes;
        self
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Segment size to use, ignoring a configured zero.
    pub fn effective_segment_size(&self) -> Option<u64> {
        self.segment_size.filter(|size| *size > 0)
    }
}

fn default_cache_dir() -> PathBuf {
    ProjectDirs::from("co", "HubCache", "hub-cache")
        .map(|dirs| dirs.cache_dir().join("models"))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_CACHE_DIR))
}
