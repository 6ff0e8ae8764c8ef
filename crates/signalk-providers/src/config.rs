//! Typed connection configuration.
//!
//! [`ConnectionConfig::from_provider`] turns a settings entry into checked,
//! typed options. Every configuration error surfaces here, before a pipeline
//! touches the network or the filesystem.

use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use signalk_core::config::ProviderConfig;
use signalk_core::PathPattern;

use crate::detect::{DISC_N2K, DISC_NMEA0183, DISC_SIGNALK};
use crate::error::{ProviderError, Result};
use crate::n2k::N2kOptions;
use crate::nmea0183::Nmea0183Options;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    Tcp,
    TcpServer,
    Udp,
    Execute,
    FileStream,
    FolderStream,
    WebSocket,
}

impl TransportKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "tcp" => Ok(Self::Tcp),
            "tcpserver" => Ok(Self::TcpServer),
            "udp" => Ok(Self::Udp),
            "execute" => Ok(Self::Execute),
            "filestream" => Ok(Self::FileStream),
            "folderstream" => Ok(Self::FolderStream),
            "ws" | "websocket" => Ok(Self::WebSocket),
            other => Err(ProviderError::config(format!("Unknown transport type '{}'", other))),
        }
    }
}

/// How NMEA 2000 traffic is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanFraming {
    /// Raw lines piped through the external canboat analyzer.
    Analyzer,
    /// canboat/Actisense text; other text encodings are autodetected too.
    Actisense,
    Candump,
    Ikonvert,
    Ydraw,
}

impl CanFraming {
    pub fn parse(variant: Option<&str>) -> Result<Self> {
        let Some(variant) = variant else {
            return Ok(Self::Actisense);
        };
        match variant.to_ascii_lowercase().as_str() {
            "" | "actisense" | "canboatjs" | "actisense-canboatjs" => Ok(Self::Actisense),
            "analyzer" | "ngt-1" | "canboat" => Ok(Self::Analyzer),
            "candump" | "canbus" | "canbus-canboatjs" => Ok(Self::Candump),
            "ikonvert" | "ikonvert-canboatjs" => Ok(Self::Ikonvert),
            "ydraw" | "ydwg02-canboatjs" | "ydwg02-udp-canboatjs" => Ok(Self::Ydraw),
            other => Err(ProviderError::config(format!("Unknown NMEA 2000 variant '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Nmea0183,
    SignalK,
    /// Mixed or multiplexed input; the format detector decides per line.
    Multiplexed,
    Nmea2000(CanFraming),
}

impl Protocol {
    pub fn parse(data_type: &str, variant: Option<&str>) -> Result<Self> {
        match data_type.to_ascii_lowercase().as_str() {
            "nmea0183" => Ok(Self::Nmea0183),
            "signalk" => Ok(Self::SignalK),
            "multiplexedlog" | "multiplexed" | "mixed" => Ok(Self::Multiplexed),
            "nmea2000" | "nmea2000js" => Ok(Self::Nmea2000(CanFraming::parse(variant)?)),
            other => Err(ProviderError::config(format!("Unknown data type '{}'", other))),
        }
    }

    /// Discriminator written to the raw log. Multiplexed input already
    /// carries its own.
    pub fn discriminator(&self) -> Option<char> {
        match self {
            Protocol::Nmea0183 => Some(DISC_NMEA0183),
            Protocol::SignalK => Some(DISC_SIGNALK),
            Protocol::Nmea2000(_) => Some(DISC_N2K),
            Protocol::Multiplexed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportSettings {
    Serial {
        device: String,
        baud_rate: u32,
    },
    Tcp {
        host: String,
        port: u16,
        /// Reconnect when nothing arrived for this long.
        idle_timeout: Option<Duration>,
    },
    TcpServer {
        port: u16,
    },
    Udp {
        host: Option<String>,
        port: u16,
    },
    Execute {
        command: String,
    },
    FileStream {
        path: PathBuf,
        keep_running: bool,
        /// Lines per second for plain (not multiplexed) replay.
        throttle_rate: Option<u64>,
    },
    FolderStream {
        folder: PathBuf,
        keep_running: bool,
    },
    WebSocket {
        host: String,
        port: u16,
        subscription: Subscription,
    },
}

impl TransportSettings {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportSettings::Serial { .. } => TransportKind::Serial,
            TransportSettings::Tcp { .. } => TransportKind::Tcp,
            TransportSettings::TcpServer { .. } => TransportKind::TcpServer,
            TransportSettings::Udp { .. } => TransportKind::Udp,
            TransportSettings::Execute { .. } => TransportKind::Execute,
            TransportSettings::FileStream { .. } => TransportKind::FileStream,
            TransportSettings::FolderStream { .. } => TransportKind::FolderStream,
            TransportSettings::WebSocket { .. } => TransportKind::WebSocket,
        }
    }
}

/// What a websocket client subscribes to after the hello.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub context: String,
    pub path: String,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            context: "vessels.self".to_string(),
            path: "*".to_string(),
        }
    }
}

const DEFAULT_BAUD_RATE: u32 = 4800;

/// A provider's settings, checked and typed.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub provider_id: String,
    pub transport: TransportSettings,
    pub protocol: Protocol,
    pub logging: bool,
    pub no_throttle: bool,
    pub override_timestamp: bool,
    pub separator: String,
    pub nmea0183: Nmea0183Options,
    pub n2k: N2kOptions,
    pub ignored_paths: Vec<PathPattern>,
    pub analyzer_command: Option<String>,
}

fn required<'a>(config: &'a ProviderConfig, key: &str) -> Result<&'a str> {
    config
        .option_str(key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProviderError::config(format!("{}: missing subOptions.{}", config.id, key)))
}

fn port(config: &ProviderConfig) -> Result<u16> {
    config
        .option_u64("port")
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| ProviderError::config(format!("{}: missing or invalid subOptions.port", config.id)))
}

fn options<T: DeserializeOwned + Default>(config: &ProviderConfig) -> Result<T> {
    match &config.sub_options {
        Value::Null => Ok(T::default()),
        value => serde_json::from_value(value.clone())
            .map_err(|e| ProviderError::config(format!("{}: invalid subOptions: {}", config.id, e))),
    }
}

fn subscription(config: &ProviderConfig) -> Subscription {
    let mut subscription = Subscription::default();
    match config.sub_options.get("subscription") {
        Some(Value::String(path)) => subscription.path = path.clone(),
        Some(Value::Object(map)) => {
            if let Some(context) = map.get("context").and_then(Value::as_str) {
                subscription.context = context.to_string();
            }
            if let Some(path) = map.get("path").and_then(Value::as_str) {
                subscription.path = path.to_string();
            }
        }
        _ => {}
    }
    subscription
}

fn transport(config: &ProviderConfig, kind: TransportKind) -> Result<TransportSettings> {
    let keep_running = config.option_bool("keepRunning").unwrap_or(false);
    Ok(match kind {
        TransportKind::Serial => TransportSettings::Serial {
            device: required(config, "device")?.to_string(),
            baud_rate: config
                .option_u64("baudrate")
                .and_then(|b| u32::try_from(b).ok())
                .unwrap_or(DEFAULT_BAUD_RATE),
        },
        TransportKind::Tcp => TransportSettings::Tcp {
            host: required(config, "host")?.to_string(),
            port: port(config)?,
            idle_timeout: config
                .option_u64("noDataReconnectTimeout")
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
        },
        TransportKind::TcpServer => TransportSettings::TcpServer { port: port(config)? },
        TransportKind::Udp => TransportSettings::Udp {
            host: config.option_str("host").map(String::from),
            port: port(config)?,
        },
        TransportKind::Execute => TransportSettings::Execute {
            command: required(config, "command")?.to_string(),
        },
        TransportKind::FileStream => TransportSettings::FileStream {
            path: PathBuf::from(required(config, "filename")?),
            keep_running,
            throttle_rate: config.option_u64("throttleRate").filter(|r| *r > 0),
        },
        TransportKind::FolderStream => TransportSettings::FolderStream {
            folder: PathBuf::from(required(config, "folder")?),
            keep_running,
        },
        TransportKind::WebSocket => {
            if config.option_bool("useTls").unwrap_or(false) {
                return Err(ProviderError::config(format!(
                    "{}: TLS websocket connections are not supported",
                    config.id
                )));
            }
            TransportSettings::WebSocket {
                host: required(config, "host")?.to_string(),
                port: port(config)?,
                subscription: subscription(config),
            }
        }
    })
}

impl ConnectionConfig {
    pub fn from_provider(config: &ProviderConfig) -> Result<Self> {
        let kind = TransportKind::parse(&config.transport)?;
        let protocol = Protocol::parse(&config.data_type, config.option_str("type"))?;

        if kind == TransportKind::WebSocket && protocol != Protocol::SignalK {
            return Err(ProviderError::config(format!(
                "{}: websocket connections carry Signal K only, not {:?}",
                config.id, protocol
            )));
        }

        let ignored_paths = match config.sub_options.get("ignoredPaths") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|p| {
                    PathPattern::new(p)
                        .map_err(|e| ProviderError::config(format!("{}: {}", config.id, e)))
                })
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };

        Ok(Self {
            provider_id: config.id.clone(),
            transport: transport(config, kind)?,
            protocol,
            logging: config.logging,
            no_throttle: config.no_throttle,
            override_timestamp: config.override_timestamp,
            separator: config.option_str("separator").unwrap_or("\n").to_string(),
            nmea0183: options(config)?,
            n2k: options(config)?,
            ignored_paths,
            analyzer_command: config.option_str("analyzerCommand").map(String::from),
        })
    }
}
