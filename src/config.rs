use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use sysinfo::System;
use tracing::{error, info};

use crate::api::types::CHECK_TYPE_HTTPTRAP;
use crate::error::{Error, Result};

const APP_NAME: &str = "checkmgr";
const DEFAULT_API_URL: &str = "https://api.circonus.com/v2";

fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub token_key: String,
    pub token_app: String,
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_API_URL.to_string(),
            token_key: String::new(),
            token_app: APP_NAME.to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CheckConfig {
    pub id: Option<u64>,
    pub submission_url: Option<String>,
    pub instance_id: String,
    pub target_host: String,
    pub display_name: String,
    pub search_tags: Vec<String>,
    pub tags: Vec<String>,
    pub check_type: String,
    pub secret: Option<String>,
    pub max_url_age_secs: u64,
    pub force_update: bool,
    pub force_metric_activation: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        let host = hostname();
        let instance_id = format!("{host}:{APP_NAME}");
        Self {
            id: None,
            submission_url: None,
            display_name: format!("{instance_id} /{APP_NAME}"),
            instance_id,
            target_host: host,
            search_tags: vec![format!("service:{APP_NAME}")],
            tags: Vec::new(),
            check_type: CHECK_TYPE_HTTPTRAP.to_string(),
            secret: None,
            max_url_age_secs: 60,
            force_update: false,
            force_metric_activation: false,
        }
    }
}

impl CheckConfig {
    pub fn max_url_age(&self) -> Duration {
        Duration::from_secs(self.max_url_age_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub id: Option<u64>,
    pub select_tags: Vec<String>,
    pub max_response_time_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            id: None,
            select_tags: Vec::new(),
            max_response_time_ms: 500,
        }
    }
}

impl BrokerConfig {
    pub fn max_response_time(&self) -> Duration {
        Duration::from_millis(self.max_response_time_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CheckManagerConfig {
    pub enabled: bool,
    pub debug: bool,
    pub api: ApiConfig,
    pub check: CheckConfig,
    pub broker: BrokerConfig,
}

impl Default for CheckManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            api: ApiConfig::default(),
            check: CheckConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl CheckManagerConfig {
    /// Rejects configurations that can neither reach the backend nor submit
    /// to a fixed trap.
    pub fn validate(&self) -> Result<()> {
        let has_url = self
            .check
            .submission_url
            .as_deref()
            .is_some_and(|u| !u.is_empty());
        if self.enabled && self.api.token_key.is_empty() && !has_url {
            return Err(Error::InvalidConfig(
                "no API token and no submission url".to_string(),
            ));
        }
        if self.check.check_type.is_empty() {
            return Err(Error::InvalidConfig("check type must be set".to_string()));
        }
        Ok(())
    }
}

pub fn load_config(config_path_str: &str) -> Result<CheckManagerConfig> {
    let config_path = Path::new(config_path_str);
    let absolute_path_display = config_path
        .canonicalize()
        .unwrap_or_else(|_| config_path.to_path_buf());
    info!(path = ?absolute_path_display, "Attempting to load config.");

    let config_str = fs::read_to_string(config_path).map_err(|e| {
        error!(path = %config_path_str, error = %e, "Failed to read config file.");
        Error::from(e)
    })?;

    let config: CheckManagerConfig = toml::from_str(&config_str).map_err(|e| {
        error!(path = %config_path_str, error = %e, "Failed to parse config file.");
        Error::from(e)
    })?;
    config.validate()?;

    info!(enabled = config.enabled, check_type = %config.check.check_type, "Loaded config successfully.");
    Ok(config)
}
