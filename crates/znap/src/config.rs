//! Endpoint and credential configuration.
//!
//! Values are resolved once at startup with the precedence
//! environment variable > config file > built-in default, and the resulting
//! [`ZnapConfig`] is shared read-only by the REST client and the feed
//! subscriber.

use crate::error::{Result, ZnapError};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// Default ZNAP API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.znap.dev";
/// Page size used when a listing call does not specify one.
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

pub const ENV_API_URL: &str = "ZNAP_API_URL";
pub const ENV_API_KEY: &str = "ZNAP_API_KEY";
pub const ENV_DEFAULT_LIMIT: &str = "ZNAP_DEFAULT_LIMIT";

const CONFIG_DIR: &str = ".znap";
const CONFIG_FILE: &str = "config.json";

/// Contents of the persisted configuration document (`~/.znap/config.json`).
///
/// This crate only reads the file; creating and editing it belongs to the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub default_limit: Option<u32>,
}

impl ConfigFile {
    /// Location of the config file under the user's home directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Read the document at `path`. A missing file is an empty document.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ZnapError::Io(e)),
        };
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&contents)
            .map_err(|e| ZnapError::Config(format!("{}: {e}", path.display())))
    }
}

/// Immutable client configuration: where the service lives and who we are.
#[derive(Clone, PartialEq, Eq)]
pub struct ZnapConfig {
    base_url: Url,
    api_key: Option<String>,
    default_limit: u32,
}

impl ZnapConfig {
    /// Build a configuration from explicit values.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ZnapError::InvalidUrl(format!(
                    "base URL must use http:// or https://, got: {other}"
                )));
            }
        }
        Ok(Self {
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            default_limit: DEFAULT_PAGE_LIMIT,
        })
    }

    /// Override the default page size.
    pub fn with_default_limit(mut self, limit: u32) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    /// Resolve from the process environment and the default config file.
    pub fn from_env() -> Result<Self> {
        let file = match ConfigFile::default_path() {
            Some(path) => ConfigFile::load(&path)?,
            None => ConfigFile::default(),
        };
        Self::resolve(|key| std::env::var(key).ok(), &file)
    }

    /// Resolve with an explicit environment lookup and config document.
    ///
    /// Empty values are treated as unset at every level.
    pub fn resolve<F>(env: F, file: &ConfigFile) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        let base_url = non_empty(env(ENV_API_URL))
            .or_else(|| non_empty(file.api_url.clone()))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let api_key = non_empty(env(ENV_API_KEY)).or_else(|| non_empty(file.api_key.clone()));
        let env_limit = match non_empty(env(ENV_DEFAULT_LIMIT)) {
            Some(raw) => Some(raw.trim().parse::<u32>().map_err(|e| {
                ZnapError::Config(format!("{ENV_DEFAULT_LIMIT}={raw:?} is not a page size: {e}"))
            })?),
            None => None,
        };
        let default_limit = env_limit
            .or(file.default_limit)
            .unwrap_or(DEFAULT_PAGE_LIMIT);

        Ok(Self::new(&base_url, api_key)?.with_default_limit(default_limit))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn default_limit(&self) -> u32 {
        self.default_limit
    }

    /// Absolute URL for a relative API path (which may carry a query string).
    pub fn rest_url(&self, path: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    /// Streaming endpoint: same host, port and path prefix with `ws`/`wss`.
    pub fn feed_url(&self) -> Result<Url> {
        let scheme = match self.base_url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(ZnapError::InvalidUrl(format!(
                    "cannot derive a streaming URL from scheme {other}"
                )));
            }
        };
        let mut url = self.base_url.clone();
        url.set_scheme(scheme)
            .map_err(|()| ZnapError::InvalidUrl(format!("cannot switch {} to {scheme}", self.base_url)))?;
        Ok(url)
    }
}

// Keeps the key out of logs and panic messages.
impl fmt::Debug for ZnapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZnapConfig")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("default_limit", &self.default_limit)
            .finish()
    }
}
