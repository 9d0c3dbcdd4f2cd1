//! Discovery configuration, loaded from YAML.
//!
//! ```yaml
//! region: eu-west-1
//! wire_format: xml
//! refresh_interval_secs: 30
//! filter:
//!   tag_filters:
//!     cluster: search-prod
//!   security_groups: [sg-0a1b2c]
//! selection:
//!   preference: prefer_private
//!   port: 9300
//! retry:
//!   max_attempts: 5
//! ```
//!
//! Every field has a default, so an empty file is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::fetcher::signing::Credentials;
use crate::fetcher::RetryPolicy;
use crate::filter::DiscoveryFilterConfig;
use crate::inventory::WireFormat;
use crate::selector::EndpointSelectionPolicy;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const CONFIG_DIR_NAME: &str = "ec2-discovery";
pub const CONFIG_FILE_NAME: &str = "discovery.yaml";

pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Overrides the regional endpoint, e.g. for a gateway or a mock.
    pub endpoint: Option<String>,
    pub region: String,
    /// Unsigned requests when absent.
    pub credentials: Option<Credentials>,
    pub wire_format: WireFormat,
    pub filter: DiscoveryFilterConfig,
    pub selection: EndpointSelectionPolicy,
    pub refresh_interval_secs: u64,
    pub cycle_deadline_secs: u64,
    pub request_timeout_ms: u64,
    /// `MaxResults` per page; the API default when absent.
    pub page_size: Option<u32>,
    pub retry: RetryPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_REGION.to_string(),
            credentials: None,
            wire_format: WireFormat::default(),
            filter: DiscoveryFilterConfig::default(),
            selection: EndpointSelectionPolicy::default(),
            refresh_interval_secs: 60,
            cycle_deadline_secs: 60,
            request_timeout_ms: 10_000,
            page_size: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        // An empty document deserialises as unit, not as an empty map.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context("Failed to parse discovery config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// `<config_dir>/ec2-discovery/discovery.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load the default file if it exists, fill credentials from the
    /// environment, and validate.
    pub fn load_default() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Fill in credentials from the environment when the file has none.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.credentials.is_some() {
            return;
        }
        let non_empty = |name: &str| lookup(name).filter(|v: &String| !v.is_empty());
        if let (Some(key_id), Some(secret)) = (
            non_empty(ENV_ACCESS_KEY_ID),
            non_empty(ENV_SECRET_ACCESS_KEY),
        ) {
            let mut credentials = Credentials::new(key_id, secret);
            if let Some(token) = non_empty(ENV_SESSION_TOKEN) {
                credentials = credentials.with_session_token(token);
            }
            self.credentials = Some(credentials);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.region.trim().is_empty() {
            bail!("region must not be empty");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            bail!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms,
                self.retry.max_backoff_ms
            );
        }
        if self.selection.port == 0 {
            bail!("selection.port must be non-zero");
        }
        if self.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be non-zero");
        }
        if self.cycle_deadline_secs == 0 {
            bail!("cycle_deadline_secs must be non-zero");
        }
        if self.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be non-zero");
        }
        if self.page_size == Some(0) {
            bail!("page_size must be non-zero when set");
        }
        if let Some(credentials) = &self.credentials {
            if credentials.access_key_id.is_empty() || credentials.secret_access_key.is_empty() {
                bail!("credentials need both access_key_id and secret_access_key");
            }
        }
        Ok(())
    }

    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://ec2.{}.amazonaws.com/", self.region))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
