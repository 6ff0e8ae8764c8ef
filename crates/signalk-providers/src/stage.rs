//! Pipeline stages.
//!
//! A pipeline is a chain of [`Stage`]s, each running as its own task and
//! connected to its neighbours by bounded channels. A stage reads the next
//! record only after its previous output was accepted downstream, so a slow
//! consumer pauses the whole chain instead of growing buffers.
//!
//! Most stages are synchronous record transformers. They implement
//! [`Transform`] in a sans-IO style: the driver in [`TransformStage`] feeds
//! records, asks for the next deadline and fires timeouts, which keeps timer
//! behaviour testable with a paused tokio clock.
//!
//! Termination flows downstream: when a stage's input closes it flushes,
//! finishes its pending deadlines and drops its output.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::record::Record;

/// Capacity of the channel between two stages.
pub const CHANNEL_CAPACITY: usize = 64;

/// One asynchronous step of a pipeline.
pub trait Stage: Send + 'static {
    fn name(&self) -> &str;

    /// Process `input` until it closes, writing to `output`.
    fn run(
        self: Box<Self>,
        input: mpsc::Receiver<Record>,
        output: mpsc::Sender<Record>,
    ) -> BoxFuture<'static, ()>;
}

/// Synchronous record transformer with optional deadlines.
pub trait Transform: Send + 'static {
    fn name(&self) -> &str;

    /// Consume one record, appending any output to `out`.
    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>);

    /// False while the transform holds a record it may not release yet.
    fn ready(&self) -> bool {
        true
    }

    /// Next instant at which [`Transform::handle_timeout`] wants to run.
    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    fn handle_timeout(&mut self, _now: Instant, _out: &mut Vec<Record>) {}

    /// Input closed. Flush what can be flushed now.
    fn close(&mut self, _out: &mut Vec<Record>) {}
}

/// Runs a [`Transform`] as a [`Stage`].
pub struct TransformStage<T>(pub T);

/// Box a transform as a stage.
pub fn transform<T: Transform>(t: T) -> Box<dyn Stage> {
    Box::new(TransformStage(t))
}

impl<T: Transform> Stage for TransformStage<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn run(
        self: Box<Self>,
        mut input: mpsc::Receiver<Record>,
        output: mpsc::Sender<Record>,
    ) -> BoxFuture<'static, ()> {
        let mut transform = self.0;
        Box::pin(async move {
            let mut out = Vec::new();
            let mut open = true;
            loop {
                let deadline = transform.poll_timeout();
                if !open && deadline.is_none() {
                    break;
                }
                let sleep = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));
                let accepting = open && transform.ready();

                tokio::select! {
                    biased;
                    _ = sleep, if deadline.is_some() => {
                        transform.handle_timeout(Instant::now(), &mut out);
                    }
                    record = input.recv(), if accepting => match record {
                        Some(record) => transform.handle_read(record, &mut out),
                        None => {
                            open = false;
                            transform.close(&mut out);
                        }
                    },
                    else => {
                        warn!("{}: not ready and no deadline, stopping", transform.name());
                        break;
                    }
                }

                for record in out.drain(..) {
                    if output.send(record).await.is_err() {
                        debug!("{}: downstream closed", transform.name());
                        return;
                    }
                }
            }
            debug!("{}: finished", transform.name());
        })
    }
}

/// A running chain of stages.
pub struct StageChain {
    pub input: mpsc::Sender<Record>,
    pub output: mpsc::Receiver<Record>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Spawn `stages` in order, wiring each one's output to the next one's input.
///
/// `input_capacity` bounds the channel feeding the first stage.
pub fn spawn_chain(stages: Vec<Box<dyn Stage>>, input_capacity: usize) -> StageChain {
    let (input, mut rx) = mpsc::channel(input_capacity.max(1));
    let mut tasks = Vec::with_capacity(stages.len());
    for stage in stages {
        let (tx, next_rx) = mpsc::channel(CHANNEL_CAPACITY);
        debug!("Starting stage {}", stage.name());
        tasks.push(tokio::spawn(stage.run(rx, tx)));
        rx = next_rx;
    }
    StageChain {
        input,
        output: rx,
        tasks,
    }
}

/// Feed `records` through `stages` and collect everything that comes out.
#[cfg(test)]
pub(crate) async fn run_to_end(stages: Vec<Box<dyn Stage>>, records: Vec<Record>) -> Vec<Record> {
    let StageChain {
        input, mut output, ..
    } = spawn_chain(stages, CHANNEL_CAPACITY);
    tokio::spawn(async move {
        for record in records {
            if input.send(record).await.is_err() {
                break;
            }
        }
    });
    let mut collected = Vec::new();
    while let Some(record) = output.recv().await {
        collected.push(record);
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Holds each line until one second after it arrived.
    struct Delay {
        pending: Option<(Instant, Record)>,
    }

    impl Transform for Delay {
        fn name(&self) -> &str {
            "delay"
        }

        fn handle_read(&mut self, record: Record, _out: &mut Vec<Record>) {
            self.pending = Some((Instant::now() + Duration::from_secs(1), record));
        }

        fn ready(&self) -> bool {
            self.pending.is_none()
        }

        fn poll_timeout(&self) -> Option<Instant> {
            self.pending.as_ref().map(|(at, _)| *at)
        }

        fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Record>) {
            if let Some((at, record)) = self.pending.take() {
                if now >= at {
                    out.push(record);
                } else {
                    self.pending = Some((at, record));
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_deadlines_survive_input_close() {
        let start = Instant::now();
        let out = run_to_end(
            vec![transform(Delay { pending: None })],
            vec![Record::Line("a".into()), Record::Line("b".into())],
        )
        .await;

        assert_eq!(out, vec![Record::Line("a".into()), Record::Line("b".into())]);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
