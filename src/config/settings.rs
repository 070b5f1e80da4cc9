//! Proxy settings
//!
//! Settings are read from ~/.entityproxy/config.toml (or an explicit path)
//! and then overlaid with `ENTITYPROXY_*` environment variables. Every
//! section has defaults so an empty file is a valid configuration.

use crate::config::ConnectionConfig;
use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    /// Default tenant credentials
    #[serde(default)]
    pub database: ConnectionConfig,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub managed: ManagedSettings,

    #[serde(default)]
    pub dispatch: DispatchSettings,

    #[serde(default)]
    pub coercion: CoercionSettings,

    #[serde(default)]
    pub access: AccessSettings,

    #[serde(default)]
    pub staffing: StaffingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum concurrent connections per tenant pool
    #[serde(default = "default_pool_size")]
    pub max_size: usize,

    #[serde(default = "default_keepalive_idle")]
    pub keepalive_idle_secs: u64,
}

/// Upstream managed backend (also the configuration store)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedSettings {
    #[serde(default = "default_managed_url")]
    pub base_url: String,

    #[serde(default)]
    pub app_id: String,

    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_managed_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Entity holding the backend mode setting
    #[serde(default = "default_setting_entity")]
    pub setting_entity: String,

    /// Value of the key field that names the mode setting
    #[serde(default = "default_setting_key")]
    pub setting_key: String,

    /// Field of the setting record that holds the mode
    #[serde(default = "default_setting_field")]
    pub setting_field: String,

    /// Entities that always stay on the managed backend
    #[serde(default = "default_always_managed")]
    pub always_managed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoercionSettings {
    /// Text columns holding JSON documents
    #[serde(default = "default_json_columns")]
    pub json_columns: Vec<String>,

    /// Columns stored as 0/1 that read back as booleans
    #[serde(default = "default_boolean_columns")]
    pub boolean_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessSettings {
    /// Actions that require the `admin` role
    #[serde(default = "default_admin_only")]
    pub admin_only_actions: Vec<String>,
}

/// Natural key of the keyed cell upsert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaffingSettings {
    #[serde(default = "default_key_fields")]
    pub key_fields: Vec<String>,

    #[serde(default = "default_value_field")]
    pub value_field: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_keepalive_idle() -> u64 {
    60
}

fn default_managed_url() -> String {
    "http://localhost:4000/api".to_string()
}

fn default_managed_timeout() -> u64 {
    30
}

fn default_setting_entity() -> String {
    "AppSetting".to_string()
}

fn default_setting_key() -> String {
    "db_mode".to_string()
}

fn default_setting_field() -> String {
    "value".to_string()
}

fn default_always_managed() -> Vec<String> {
    vec!["AppSetting".to_string()]
}

fn default_json_columns() -> Vec<String> {
    [
        "settings",
        "config",
        "data",
        "metadata",
        "permissions",
        "qualifications",
        "preferences",
        "shifts",
        "rules",
        "members",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_boolean_columns() -> Vec<String> {
    [
        "is_active",
        "active",
        "is_archived",
        "is_holiday",
        "is_public",
        "is_published",
        "is_locked",
        "is_admin",
        "enabled",
        "exclude_from_staffing_plan",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_admin_only() -> Vec<String> {
    vec!["bulkCreate".to_string()]
}

fn default_key_fields() -> Vec<String> {
    vec![
        "doctor_id".to_string(),
        "year".to_string(),
        "month".to_string(),
    ]
}

fn default_value_field() -> String {
    "value".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: default_pool_size(),
            keepalive_idle_secs: default_keepalive_idle(),
        }
    }
}

impl Default for ManagedSettings {
    fn default() -> Self {
        Self {
            base_url: default_managed_url(),
            app_id: String::new(),
            api_key: None,
            timeout_secs: default_managed_timeout(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            setting_entity: default_setting_entity(),
            setting_key: default_setting_key(),
            setting_field: default_setting_field(),
            always_managed: default_always_managed(),
        }
    }
}

impl Default for CoercionSettings {
    fn default() -> Self {
        Self {
            json_columns: default_json_columns(),
            boolean_columns: default_boolean_columns(),
        }
    }
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            admin_only_actions: default_admin_only(),
        }
    }
}

impl Default for StaffingSettings {
    fn default() -> Self {
        Self {
            key_fields: default_key_fields(),
            value_field: default_value_field(),
        }
    }
}

impl Settings {
    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.pool.max_size == 0 {
            return Err(ConfigError::Invalid("pool.max_size must be at least 1".into()));
        }
        if self.staffing.key_fields.is_empty() {
            return Err(ConfigError::Invalid(
                "staffing.key_fields must name at least one field".into(),
            ));
        }
        Ok(())
    }

    /// Overlay `ENTITYPROXY_*` environment variables
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(v) = var("ENTITYPROXY_LISTEN") {
            self.server.listen = v;
        }
        if let Some(v) = var("ENTITYPROXY_DB_HOST") {
            self.database.host = v;
        }
        if let Some(v) = var("ENTITYPROXY_DB_PORT") {
            self.database.port = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("Invalid port: {}", v)))?;
        }
        if let Some(v) = var("ENTITYPROXY_DB_NAME") {
            self.database.database = v;
        }
        if let Some(v) = var("ENTITYPROXY_DB_USER") {
            self.database.username = v;
        }
        if let Some(v) = var("ENTITYPROXY_DB_PASSWORD") {
            self.database.password = Some(v);
        }
        if let Some(v) = var("ENTITYPROXY_MANAGED_URL") {
            self.managed.base_url = v;
        }
        if let Some(v) = var("ENTITYPROXY_APP_ID") {
            self.managed.app_id = v;
        }
        if let Some(v) = var("ENTITYPROXY_API_KEY") {
            self.managed.api_key = Some(v);
        }
        Ok(())
    }
}

/// Load settings from an explicit path, or from the default location.
///
/// A missing default file yields the defaults; a missing explicit file is
/// an error.
pub fn load_settings(path: Option<&Path>) -> ConfigResult<Settings> {
    let mut settings = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                ConfigError::NotFound(format!("{}: {}", path.display(), e))
            })?;
            Settings::from_toml(&content)?
        }
        None => {
            let path = ConnectionConfig::config_dir()?.join("config.toml");
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    ConfigError::NotFound(format!("{}: {}", path.display(), e))
                })?;
                Settings::from_toml(&content)?
            } else {
                Settings::default()
            }
        }
    };
    settings.apply_env()?;
    Ok(settings)
}
