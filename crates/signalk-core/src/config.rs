//! Server settings and their storage.
//!
//! Settings live in one JSON file (`~/.signalk/settings.json` by default).
//! Provider entries are kept as raw strings here; the providers crate turns
//! them into typed transport and protocol choices when a pipeline is built.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

/// Environment variable overriding the settings file location.
pub const SETTINGS_ENV: &str = "SIGNALK_SETTINGS";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration not found: {0}")]
    NotFound(String),

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Settings storage.
///
/// All methods are synchronous; settings are read once at startup.
pub trait ConfigStorage: Send + Sync {
    fn load_settings(&self) -> Result<ServerSettings, ConfigError>;

    fn save_settings(&self, settings: &ServerSettings) -> Result<(), ConfigError>;

    /// Load settings, writing defaults first when none exist yet.
    fn load_or_init_settings(&self) -> Result<ServerSettings, ConfigError> {
        match self.load_settings() {
            Err(ConfigError::NotFound(what)) => {
                info!("No settings at {}, writing defaults", what);
                let settings = ServerSettings::default();
                self.save_settings(&settings)?;
                Ok(settings)
            }
            other => other,
        }
    }
}

/// JSON file backed settings storage.
#[derive(Debug, Clone)]
pub struct FileConfigStorage {
    path: PathBuf,
}

impl FileConfigStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$SIGNALK_SETTINGS`, else `$HOME/.signalk/settings.json`.
    pub fn default_location() -> Self {
        if let Some(path) = std::env::var_os(SETTINGS_ENV) {
            return Self::new(path);
        }
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".signalk").join("settings.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStorage for FileConfigStorage {
    fn load_settings(&self) -> Result<ServerSettings, ConfigError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(self.path.display().to_string()));
            }
            Err(e) => return Err(ConfigError::ReadError(e.to_string())),
        };
        serde_json::from_str(&text).map_err(|e| ConfigError::InvalidData(e.to_string()))
    }

    fn save_settings(&self, settings: &ServerSettings) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| ConfigError::WriteError(e.to_string()))
    }
}

/// Server settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    #[serde(default)]
    pub vessel: VesselInfo,

    /// Minutes before pruning inactive contexts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune_contexts_minutes: Option<u32>,

    /// Directory for raw data logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging_directory: Option<String>,

    /// Port of the HTTP read-out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,

    #[serde(default)]
    pub piped_providers: Vec<ProviderConfig>,
}

impl ServerSettings {
    /// Self vessel URN, from the configured mmsi or uuid.
    pub fn self_urn(&self) -> String {
        match (&self.vessel.mmsi, &self.vessel.uuid) {
            (Some(mmsi), _) => format!("urn:mrn:imo:mmsi:{}", mmsi),
            (None, Some(uuid)) if uuid.starts_with("urn:") => uuid.clone(),
            (None, Some(uuid)) => format!("urn:mrn:signalk:uuid:{}", uuid),
            (None, None) => "urn:mrn:signalk:uuid:00000000-0000-0000-0000-000000000000".into(),
        }
    }
}

/// Vessel information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VesselInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmsi: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

fn enabled_default() -> bool {
    true
}

/// One data connection as written in the settings file.
///
/// `type` names the transport ("serial", "tcp", ...) and `dataType` the
/// protocol ("NMEA0183", "NMEA2000", "SignalK", "Multiplexed").
/// Transport options and the adapter variant live in `subOptions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(alias = "providerId")]
    pub id: String,

    #[serde(default = "enabled_default")]
    pub enabled: bool,

    #[serde(rename = "type")]
    pub transport: String,

    pub data_type: String,

    #[serde(default)]
    pub sub_options: Value,

    #[serde(default)]
    pub logging: bool,

    #[serde(default)]
    pub no_throttle: bool,

    #[serde(default)]
    pub override_timestamp: bool,
}

impl ProviderConfig {
    pub fn new(id: &str, transport: &str, data_type: &str, sub_options: Value) -> Self {
        Self {
            id: id.to_string(),
            enabled: true,
            transport: transport.to_string(),
            data_type: data_type.to_string(),
            sub_options,
            logging: false,
            no_throttle: false,
            override_timestamp: false,
        }
    }

    /// String option from `subOptions`.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.sub_options.get(key).and_then(Value::as_str)
    }

    /// Numeric option from `subOptions`; numeric strings are accepted too.
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        match self.sub_options.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.sub_options.get(key).and_then(Value::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_config_from_settings_json() {
        let json = r#"{
            "vessel": {"name": "Test Vessel", "mmsi": "230099999"},
            "pruneContextsMinutes": 60,
            "pipedProviders": [{
                "id": "n2k",
                "type": "tcp",
                "dataType": "NMEA2000",
                "subOptions": {"type": "ydraw", "host": "10.0.0.5", "port": "1457"}
            }, {
                "providerId": "gps",
                "enabled": false,
                "type": "serial",
                "dataType": "NMEA0183",
                "subOptions": {"device": "/dev/ttyUSB0", "baudrate": 4800},
                "logging": true
            }]
        }"#;

        let settings: ServerSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.prune_contexts_minutes, Some(60));
        assert_eq!(settings.self_urn(), "urn:mrn:imo:mmsi:230099999");

        let n2k = &settings.piped_providers[0];
        assert!(n2k.enabled);
        assert_eq!(n2k.transport, "tcp");
        assert_eq!(n2k.option_str("type"), Some("ydraw"));
        assert_eq!(n2k.option_u64("port"), Some(1457));

        let gps = &settings.piped_providers[1];
        assert_eq!(gps.id, "gps");
        assert!(!gps.enabled);
        assert!(gps.logging);
        assert_eq!(gps.option_u64("baudrate"), Some(4800));
    }

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileConfigStorage::new(dir.path().join("nested").join("settings.json"));

        assert!(matches!(storage.load_settings(), Err(ConfigError::NotFound(_))));
        let settings = storage.load_or_init_settings().unwrap();
        assert!(settings.piped_providers.is_empty());
        assert!(storage.path().exists());
    }

    #[test]
    fn test_settings_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileConfigStorage::new(dir.path().join("settings.json"));

        let settings = ServerSettings {
            http_port: Some(3001),
            piped_providers: vec![ProviderConfig::new(
                "replay",
                "filestream",
                "Multiplexed",
                json!({"filename": "/tmp/log.txt"}),
            )],
            ..Default::default()
        };
        storage.save_settings(&settings).unwrap();

        let loaded = storage.load_settings().unwrap();
        assert_eq!(loaded.http_port, Some(3001));
        assert_eq!(loaded.piped_providers, settings.piped_providers);
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let storage = FileConfigStorage::new(path);
        assert!(matches!(storage.load_settings(), Err(ConfigError::InvalidData(_))));
    }
}
