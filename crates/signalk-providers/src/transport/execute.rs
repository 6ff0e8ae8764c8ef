//! Runs a shell command and reads its standard output. Outbound data goes to
//! its standard input. The command is restarted when it exits.

use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{pump, wait_or_end, Backoff, PumpEnd};
use crate::app::AppHandle;
use crate::record::Record;
use crate::stage::Stage;

pub struct ExecuteTransport {
    provider_id: String,
    command: String,
    app: AppHandle,
    backoff: Backoff,
}

impl ExecuteTransport {
    pub fn new(provider_id: &str, command: &str, app: AppHandle) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            command: command.to_string(),
            app,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn run_inner(mut self, mut input: mpsc::Receiver<Record>, output: mpsc::Sender<Record>) {
        let id = self.provider_id.clone();
        loop {
            let spawned = Command::new("sh")
                .arg("-c")
                .arg(&self.command)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn();
            match spawned {
                Ok(mut child) => {
                    info!("{}: started `{}`", id, self.command);
                    self.backoff.reset();
                    self.app.status(&id, format!("Started {}", self.command));
                    let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
                        self.app.error(&id, "Command has no stdio");
                        return;
                    };
                    let end = pump(&id, stdout, stdin, &mut input, &output, None).await;
                    match end {
                        PumpEnd::InputClosed | PumpEnd::OutputClosed => return,
                        PumpEnd::Disconnected(_) | PumpEnd::Idle => {
                            let status = child
                                .wait()
                                .await
                                .map(|s| s.to_string())
                                .unwrap_or_else(|e| e.to_string());
                            warn!("{}: `{}` exited: {}", id, self.command, status);
                            self.app.error(&id, format!("{} exited: {}", self.command, status));
                        }
                    }
                }
                Err(e) => {
                    warn!("{}: cannot start `{}`: {}", id, self.command, e);
                    self.app.error(&id, format!("Cannot start {}: {}", self.command, e));
                }
            }
            if !wait_or_end(&mut input, self.backoff.next_delay()).await {
                return;
            }
        }
    }
}

impl Stage for ExecuteTransport {
    fn name(&self) -> &str {
        "execute"
    }

    fn run(
        self: Box<Self>,
        input: mpsc::Receiver<Record>,
        output: mpsc::Sender<Record>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(self.run_inner(input, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppEvent;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reads_command_output() {
        let (app, _events) = AppHandle::channel(16);
        let transport = ExecuteTransport::new("x", "printf 'a\\nb\\n'; sleep 5", app);
        let (input, input_rx) = mpsc::channel(8);
        let (output_tx, mut output) = mpsc::channel(8);
        let task = tokio::spawn(Box::new(transport).run(input_rx, output_tx));

        let mut received = Vec::new();
        while received.len() < 4 {
            match output.recv().await {
                Some(Record::Bytes(bytes)) => received.extend(bytes),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(received, b"a\nb\n");

        drop(input);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_restarts_after_exit() {
        let (app, mut events) = AppHandle::channel(16);
        let transport = ExecuteTransport::new("x", "echo hi", app)
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(10)));
        let (input, input_rx) = mpsc::channel(8);
        let (output_tx, mut output) = mpsc::channel(8);
        let task = tokio::spawn(Box::new(transport).run(input_rx, output_tx));

        assert_eq!(output.recv().await, Some(Record::Bytes(b"hi\n".to_vec())));
        assert_eq!(output.recv().await, Some(Record::Bytes(b"hi\n".to_vec())));

        drop(input);
        task.await.unwrap();

        let mut exits = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, AppEvent::ProviderError { .. }) {
                exits += 1;
            }
        }
        assert!(exits >= 1);
    }

    #[tokio::test]
    async fn test_restart_delay_resets_after_start() {
        let (app, _events) = AppHandle::channel(64);
        let transport = ExecuteTransport::new("x", "echo hi", app)
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_secs(60)));
        let (input, input_rx) = mpsc::channel(8);
        let (output_tx, mut output) = mpsc::channel(8);
        let task = tokio::spawn(Box::new(transport).run(input_rx, output_tx));

        // doubling delays would need over five seconds for ten runs
        let runs = tokio::time::timeout(Duration::from_secs(3), async {
            let mut runs = 0;
            while runs < 10 {
                if let Some(Record::Bytes(_)) = output.recv().await {
                    runs += 1;
                }
            }
            runs
        })
        .await
        .expect("restarted at the base delay");
        assert_eq!(runs, 10);

        drop(input);
        task.await.unwrap();
    }
}
