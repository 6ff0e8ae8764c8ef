//! Pipeline composition.
//!
//! A provider config becomes an ordered list of stages:
//!
//! ```text
//! transport → [raw logger] → decoders → [path filter] → [override timestamp]
//!           → activity tap → delta sink
//! ```
//!
//! Building the list does no I/O, so every configuration error surfaces
//! before a socket is opened. [`Pipeline::end`] closes the first stage's
//! input and aborts the transport task, which drops its socket, port or
//! child process even while it waits on a full downstream. Every later
//! stage ends its own output once drained and the shutdown ripples down the
//! chain.

use std::sync::Arc;

use signalk_core::config::ProviderConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::AppHandle;
use crate::config::{CanFraming, ConnectionConfig, Protocol};
use crate::demux::Demux;
use crate::detect::FormatDetector;
use crate::error::Result;
use crate::n2k::{Analyzer, CanLineParser, N2kToSignalK};
use crate::nmea0183::Nmea0183Decoder;
use crate::record::Record;
use crate::stage::{spawn_chain, transform, Stage};
use crate::stages::{ActivityTap, DeltaSink, FromJson, LogRegistry, OverrideTimestamp, PathFilter, RawLogger};
use crate::throttle::TimestampThrottle;
use crate::transport::{transport_stages, MAX_PENDING_WRITES};

/// Shared collaborators handed to every pipeline.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub app: AppHandle,
    /// Where raw logs go when a provider sets `logging`.
    pub log_registry: Option<Arc<LogRegistry>>,
}

impl PipelineContext {
    pub fn new(app: AppHandle) -> Self {
        Self {
            app,
            log_registry: None,
        }
    }

    pub fn with_log_registry(mut self, registry: Arc<LogRegistry>) -> Self {
        self.log_registry = Some(registry);
        self
    }
}

fn decoder_stages(config: &ConnectionConfig, ctx: &PipelineContext) -> Result<Vec<Box<dyn Stage>>> {
    let id = config.provider_id.as_str();
    let app = &ctx.app;
    let n2k = || transform(N2kToSignalK::new(id, config.n2k.clone(), app.clone()));
    let nmea0183 = || Nmea0183Decoder::new(id, config.nmea0183.clone(), app.clone());

    let stages = match config.protocol {
        Protocol::SignalK => vec![transform(FromJson::new(id))],
        // PCDIN sentences come out as NMEA 2000 messages
        Protocol::Nmea0183 => vec![transform(nmea0183()), n2k()],
        Protocol::Nmea2000(CanFraming::Analyzer) => vec![
            Box::new(Analyzer::new(id, config.analyzer_command.as_deref(), app.clone())) as Box<dyn Stage>,
            n2k(),
        ],
        Protocol::Nmea2000(_) => vec![transform(CanLineParser::new()?), n2k()],
        Protocol::Multiplexed => {
            let mut stages = vec![transform(FormatDetector::new())];
            if !config.no_throttle {
                stages.push(transform(TimestampThrottle::new()));
            }
            stages.push(transform(Demux::new(nmea0183(), CanLineParser::new()?)));
            stages.push(n2k());
            stages
        }
    };
    Ok(stages)
}

/// A running provider pipeline.
pub struct Pipeline {
    provider_id: String,
    input: Option<mpsc::Sender<Record>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// The ordered stages for `config`. Nothing is started.
    pub fn stages(config: &ConnectionConfig, ctx: &PipelineContext) -> Result<Vec<Box<dyn Stage>>> {
        let id = config.provider_id.as_str();
        let mut stages = transport_stages(config, &ctx.app);

        if config.logging {
            match &ctx.log_registry {
                Some(registry) => stages.push(transform(RawLogger::new(
                    id,
                    config.protocol.discriminator(),
                    registry.clone(),
                ))),
                None => warn!("{}: logging requested but no logging directory is configured", id),
            }
        }

        stages.extend(decoder_stages(config, ctx)?);

        if !config.ignored_paths.is_empty() {
            stages.push(transform(PathFilter::new(config.ignored_paths.clone())));
        }
        if config.override_timestamp {
            stages.push(transform(OverrideTimestamp));
        }
        stages.push(transform(ActivityTap::new(id, ctx.app.clone())));
        stages.push(Box::new(DeltaSink::new(id, ctx.app.clone())));
        Ok(stages)
    }

    /// Build and start the pipeline for `config`.
    pub fn build(config: &ConnectionConfig, ctx: &PipelineContext) -> Result<Self> {
        let stages = Self::stages(config, ctx)?;
        let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
        info!("{}: starting pipeline {}", config.provider_id, names.join(" → "));
        let chain = spawn_chain(stages, MAX_PENDING_WRITES);
        Ok(Self {
            provider_id: config.provider_id.clone(),
            input: Some(chain.input),
            tasks: chain.tasks,
        })
    }

    /// Check and build a provider straight from settings.
    pub fn from_provider(config: &ProviderConfig, ctx: &PipelineContext) -> Result<Self> {
        Self::build(&ConnectionConfig::from_provider(config)?, ctx)
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Queue an outbound record for the transport. Dropped when the queue
    /// is full or the pipeline has ended.
    pub fn write(&self, record: Record) -> bool {
        let Some(input) = &self.input else {
            debug!("{}: write after end", self.provider_id);
            return false;
        };
        match input.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{}: too many pending writes, dropping", self.provider_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stop the transport and release what it holds. Records already past
    /// the transport still flow to the sink. Calling it again does nothing.
    pub fn end(&mut self) {
        if self.input.take().is_some() {
            info!("{}: ending pipeline", self.provider_id);
            if let Some(transport) = self.tasks.first() {
                transport.abort();
            }
        }
    }

    /// True until every stage has finished.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Wait for every stage to finish. A replay without `keepRunning` ends
    /// by itself; anything else needs [`Pipeline::end`] first.
    pub async fn finished(mut self) {
        for task in self.tasks.drain(..) {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => debug!("{}: transport aborted", self.provider_id),
                Err(e) => warn!("{}: stage failed: {}", self.provider_id, e),
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn names(config: ProviderConfig) -> Vec<String> {
        let (app, _events) = AppHandle::channel(16);
        let ctx = PipelineContext::new(app)
            .with_log_registry(Arc::new(LogRegistry::new(std::env::temp_dir()).unwrap()));
        let config = ConnectionConfig::from_provider(&config).unwrap();
        Pipeline::stages(&config, &ctx)
            .unwrap()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    #[test]
    fn test_multiplexed_file_stages() {
        let mut config = ProviderConfig::new("log", "filestream", "Multiplexed", json!({"filename": "x.log"}));
        config.logging = true;
        assert_eq!(
            names(config),
            vec![
                "file",
                "liner",
                "raw-logger",
                "format-detector",
                "timestamp-throttle",
                "demux",
                "n2k-to-signalk",
                "activity-tap",
                "delta-sink",
            ]
        );
    }

    #[test]
    fn test_optional_stages() {
        let mut config = ProviderConfig::new(
            "gps",
            "udp",
            "NMEA0183",
            json!({"port": 10110, "ignoredPaths": ["navigation.gnss.*"]}),
        );
        config.no_throttle = true;
        config.override_timestamp = true;
        assert_eq!(
            names(config),
            vec![
                "udp",
                "non-buffering-liner",
                "nmea0183",
                "n2k-to-signalk",
                "path-filter",
                "override-timestamp",
                "activity-tap",
                "delta-sink",
            ]
        );
    }

    #[test]
    fn test_signalk_over_websocket() {
        let config = ProviderConfig::new("remote", "ws", "SignalK", json!({"host": "h", "port": 3000}));
        assert_eq!(
            names(config),
            vec!["websocket", "from-json", "activity-tap", "delta-sink"]
        );
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let (app, _events) = AppHandle::channel(16);
        let config = ProviderConfig::new("srv", "tcpserver", "NMEA0183", json!({"port": 0}));
        let mut pipeline = Pipeline::from_provider(&config, &PipelineContext::new(app)).unwrap();
        assert!(pipeline.write(Record::Line("$GPHDT,1,T".into())));
        pipeline.end();
        pipeline.end();
        assert!(!pipeline.write(Record::Line("late".into())));
        pipeline.finished().await;
    }

    /// Running and not yet reaped.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !matches!(stat.rsplit(')').next().map(str::trim_start), Some(s) if s.starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_end_kills_blocked_command() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let command = format!(
            "echo $$ > {}; while true; do echo '$GPHDT,123.4,T*31'; done",
            pid_file.display()
        );
        // never drained, so the whole chain backs up into the transport
        let (app, _events) = AppHandle::channel(1);
        let config = ProviderConfig::new("cmd", "execute", "NMEA0183", json!({"command": command}));
        let mut pipeline = Pipeline::from_provider(&config, &PipelineContext::new(app)).unwrap();

        let mut pid = String::new();
        for _ in 0..200 {
            pid = std::fs::read_to_string(&pid_file).unwrap_or_default().trim().to_string();
            if !pid.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!pid.is_empty(), "command started");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(process_alive(&pid));

        pipeline.end();
        let mut alive = true;
        for _ in 0..200 {
            alive = process_alive(&pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!alive, "command still running after end");
    }
}
