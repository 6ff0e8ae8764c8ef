//! External canboat analyzer as a decoding stage.
//!
//! Raw gateway lines are written to the analyzer's stdin; each JSON line it
//! prints becomes a [`PgnMessage`].

use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::frame::PgnMessage;
use crate::app::AppHandle;
use crate::record::Record;
use crate::stage::Stage;
use crate::transport::MAX_PENDING_WRITES;

pub const DEFAULT_ANALYZER_COMMAND: &str = "analyzer -json -si -camel";

/// How long to wait for the analyzer to print its last lines once input ended.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Analyzer {
    provider_id: String,
    command: String,
    app: AppHandle,
}

impl Analyzer {
    pub fn new(provider_id: &str, command: Option<&str>, app: AppHandle) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            command: command.unwrap_or(DEFAULT_ANALYZER_COMMAND).to_string(),
            app,
        }
    }

    async fn run_inner(self, mut input: mpsc::Receiver<Record>, output: mpsc::Sender<Record>) {
        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!("{}: cannot start '{}': {}", self.provider_id, self.command, e);
                self.app.error(&self.provider_id, format!("Cannot start analyzer: {}", e));
                return;
            }
        };
        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            error!("{}: analyzer stdio not captured", self.provider_id);
            return;
        };
        info!("{}: started '{}'", self.provider_id, self.command);

        let (to_analyzer, mut pending) = mpsc::channel::<String>(MAX_PENDING_WRITES);
        let writer = tokio::spawn(async move {
            while let Some(line) = pending.recv().await {
                let write = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await
                };
                if let Err(e) = write.await {
                    debug!("analyzer stdin closed: {}", e);
                    break;
                }
            }
            // dropping stdin closes the pipe
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut to_analyzer = Some(to_analyzer);
        let drain = tokio::time::sleep(Duration::MAX);
        tokio::pin!(drain);

        loop {
            tokio::select! {
                record = input.recv(), if to_analyzer.is_some() => match record {
                    Some(Record::Line(line)) => {
                        if let Some(tx) = &to_analyzer {
                            if tx.try_send(line).is_err() {
                                warn!("{}: analyzer is behind, dropping input", self.provider_id);
                            }
                        }
                    }
                    Some(other) => {
                        if output.send(other).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        to_analyzer = None;
                        drain.as_mut().reset(tokio::time::Instant::now() + DRAIN_TIMEOUT);
                    }
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match serde_json::from_str::<PgnMessage>(&line) {
                        Ok(msg) => {
                            if output.send(Record::Pgn(msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("{}: unparsable analyzer output '{}': {}", self.provider_id, line, e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("{}: analyzer output error: {}", self.provider_id, e);
                        break;
                    }
                },
                _ = &mut drain, if to_analyzer.is_none() => {
                    debug!("{}: analyzer did not finish in time", self.provider_id);
                    break;
                }
            }
        }
        writer.abort();
        if let Err(e) = child.kill().await {
            debug!("{}: analyzer already gone: {}", self.provider_id, e);
        }
    }
}

impl Stage for Analyzer {
    fn name(&self) -> &str {
        "analyzer"
    }

    fn run(
        self: Box<Self>,
        input: mpsc::Receiver<Record>,
        output: mpsc::Sender<Record>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(self.run_inner(input, output))
    }
}
