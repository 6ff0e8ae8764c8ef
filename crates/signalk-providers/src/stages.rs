//! Auxiliary stages: JSON passthrough, raw logging, filtering, timestamp
//! override, the activity tap and the terminal delta sink.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use signalk_core::{Delta, PathPattern, Source};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::app::AppHandle;
use crate::detect::{classify, is_multiplexed};
use crate::record::{iso_now, now_ms, Record};
use crate::stage::{Stage, Transform};

/// Signal K JSON lines to deltas.
#[derive(Debug)]
pub struct FromJson {
    provider_id: String,
}

impl FromJson {
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
        }
    }

    pub fn parse(&self, line: &str) -> Option<Delta> {
        let json: Value = match serde_json::from_str(line) {
            Ok(json) => json,
            Err(e) => {
                debug!("{}: unparsable JSON '{}': {}", self.provider_id, line, e);
                return None;
            }
        };
        // hello, subscription replies and the like
        if json.get("updates").is_none() {
            return None;
        }
        let mut delta: Delta = match serde_json::from_value(json) {
            Ok(delta) => delta,
            Err(e) => {
                warn!("{}: invalid delta: {}", self.provider_id, e);
                return None;
            }
        };
        for update in &mut delta.updates {
            if update.source.is_none() && update.source_ref.is_none() {
                update.source = Some(Source::generic(&self.provider_id, "SignalK"));
            }
        }
        Some(delta)
    }
}

impl Transform for FromJson {
    fn name(&self) -> &str {
        "from-json"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        match record {
            Record::Line(line) => out.extend(self.parse(&line).map(Record::Delta)),
            other => out.push(other),
        }
    }
}

/// Raw lines queued for the log writer before new ones are dropped.
const RAW_LOG_QUEUE: usize = 1024;

struct HourlyFile {
    hour: String,
    file: File,
}

/// Owns the open log file. Runs on its own thread so file I/O never blocks
/// a pipeline.
struct HourlyWriter {
    directory: PathBuf,
    current: Option<HourlyFile>,
}

impl HourlyWriter {
    fn write(&mut self, line: &str) -> std::io::Result<()> {
        let hour = Utc::now().format("%Y-%m-%dT%H").to_string();
        if self.current.as_ref().map_or(true, |c| c.hour != hour) {
            std::fs::create_dir_all(&self.directory)?;
            let path = self.directory.join(LogRegistry::file_name(&hour));
            info!("Logging raw input to {}", path.display());
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.current = Some(HourlyFile { hour, file });
        }
        match self.current.as_mut() {
            Some(c) => writeln!(c.file, "{}", line),
            None => Ok(()),
        }
    }
}

/// Hourly raw-record log files shared by all providers.
///
/// Created once by the server and handed to every pipeline. Lines are
/// written by a background thread that stops when the registry is dropped.
pub struct LogRegistry {
    directory: PathBuf,
    lines: mpsc::Sender<String>,
}

impl std::fmt::Debug for LogRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRegistry")
            .field("directory", &self.directory)
            .finish()
    }
}

impl LogRegistry {
    pub fn new(directory: impl Into<PathBuf>) -> std::io::Result<Self> {
        let directory = directory.into();
        let (lines, mut queue) = mpsc::channel::<String>(RAW_LOG_QUEUE);
        let mut writer = HourlyWriter {
            directory: directory.clone(),
            current: None,
        };
        std::thread::Builder::new()
            .name("raw-log".into())
            .spawn(move || {
                while let Some(line) = queue.blocking_recv() {
                    if let Err(e) = writer.write(&line) {
                        warn!("Raw log write failed: {}", e);
                    }
                }
            })?;
        Ok(Self { directory, lines })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn file_name(hour: &str) -> String {
        format!("skserver-raw_{}.log", hour)
    }

    /// Queue one line for the file of the current hour. False when the
    /// writer is behind and the line was dropped.
    pub fn append(&self, line: String) -> bool {
        self.lines.try_send(line).is_ok()
    }
}

/// Appends every line to the raw log as `<millis>;<disc>;<line>`.
///
/// Without a fixed discriminator each line gets the class the format
/// detector would give it, and multiplexed records are kept verbatim, so
/// the log always replays as multiplexed input.
#[derive(Debug)]
pub struct RawLogger {
    provider_id: String,
    discriminator: Option<char>,
    registry: Arc<LogRegistry>,
}

impl RawLogger {
    pub fn new(provider_id: &str, discriminator: Option<char>, registry: Arc<LogRegistry>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            discriminator,
            registry,
        }
    }

    fn entry(&self, line: &str) -> String {
        match self.discriminator {
            Some(d) => format!("{};{};{}", now_ms(), d, line),
            None if is_multiplexed(line) => line.to_string(),
            None => format!("{};{};{}", now_ms(), classify(line), line),
        }
    }
}

impl Transform for RawLogger {
    fn name(&self) -> &str {
        "raw-logger"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        if let Record::Line(line) = &record {
            if !self.registry.append(self.entry(line)) {
                warn!("{}: raw log is behind, dropping line", self.provider_id);
            }
        }
        out.push(record);
    }
}

/// Drops values whose path matches any of the patterns.
#[derive(Debug)]
pub struct PathFilter {
    patterns: Vec<PathPattern>,
}

impl PathFilter {
    pub fn new(patterns: Vec<PathPattern>) -> Self {
        Self { patterns }
    }

    pub fn apply(&self, mut delta: Delta) -> Option<Delta> {
        for update in &mut delta.updates {
            update
                .values
                .retain(|pv| !self.patterns.iter().any(|p| p.matches(&pv.path)));
        }
        delta.updates.retain(|u| !u.is_empty());
        (!delta.updates.is_empty()).then_some(delta)
    }
}

impl Transform for PathFilter {
    fn name(&self) -> &str {
        "path-filter"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        match record {
            Record::Delta(delta) => out.extend(self.apply(delta).map(Record::Delta)),
            other => out.push(other),
        }
    }
}

/// Restamps every update with the time it passed through.
#[derive(Debug, Default)]
pub struct OverrideTimestamp;

impl Transform for OverrideTimestamp {
    fn name(&self) -> &str {
        "override-timestamp"
    }

    fn handle_read(&mut self, mut record: Record, out: &mut Vec<Record>) {
        if let Record::Delta(delta) = &mut record {
            let now = iso_now();
            for update in &mut delta.updates {
                update.timestamp = Some(now.clone());
            }
        }
        out.push(record);
    }
}

/// Shortest gap between two activity reports of one pipeline.
pub const ACTIVITY_INTERVAL: Duration = Duration::from_secs(1);

/// Reports that records reach the end of the pipeline, at most once per
/// [`ACTIVITY_INTERVAL`] so status events are not crowded out.
#[derive(Debug)]
pub struct ActivityTap {
    provider_id: String,
    app: AppHandle,
    last_report: Option<Instant>,
}

impl ActivityTap {
    pub fn new(provider_id: &str, app: AppHandle) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            app,
            last_report: None,
        }
    }
}

impl Transform for ActivityTap {
    fn name(&self) -> &str {
        "activity-tap"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        let now = Instant::now();
        if self.last_report.map_or(true, |last| now - last >= ACTIVITY_INTERVAL) {
            self.last_report = Some(now);
            self.app.activity(&self.provider_id);
        }
        out.push(record);
    }
}

/// Terminal stage: hands deltas to the server.
///
/// Anything that is not a delta by now has no decoder and is dropped.
pub struct DeltaSink {
    provider_id: String,
    app: AppHandle,
}

impl DeltaSink {
    pub fn new(provider_id: &str, app: AppHandle) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            app,
        }
    }
}

impl Stage for DeltaSink {
    fn name(&self) -> &str {
        "delta-sink"
    }

    fn run(
        self: Box<Self>,
        mut input: mpsc::Receiver<Record>,
        _output: mpsc::Sender<Record>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            while let Some(record) = input.recv().await {
                match record {
                    Record::Delta(delta) => {
                        if !self.app.delta(&self.provider_id, delta).await {
                            debug!("{}: server gone, stopping", self.provider_id);
                            break;
                        }
                    }
                    other => debug!("{}: dropping undecoded {}", self.provider_id, other.kind()),
                }
            }
        })
    }
}
