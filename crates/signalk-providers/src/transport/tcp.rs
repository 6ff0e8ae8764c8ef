//! TCP client transport.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{or_end, pump, wait_or_end, Backoff, PumpEnd};
use crate::app::AppHandle;
use crate::record::Record;
use crate::stage::Stage;

pub struct TcpTransport {
    provider_id: String,
    host: String,
    port: u16,
    idle_timeout: Option<Duration>,
    app: AppHandle,
    backoff: Backoff,
}

impl TcpTransport {
    pub fn new(
        provider_id: &str,
        host: &str,
        port: u16,
        idle_timeout: Option<Duration>,
        app: AppHandle,
    ) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            host: host.to_string(),
            port,
            idle_timeout,
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
        let address = format!("{}:{}", self.host, self.port);
        loop {
            let Some(connected) = or_end(&mut input, TcpStream::connect(&address)).await else {
                return;
            };
            match connected {
                Ok(stream) => {
                    self.backoff.reset();
                    info!("{}: connected to {}", id, address);
                    self.app.status(&id, format!("Connected to {}", address));
                    let (reader, writer) = stream.into_split();
                    match pump(&id, reader, writer, &mut input, &output, self.idle_timeout).await {
                        PumpEnd::InputClosed | PumpEnd::OutputClosed => return,
                        PumpEnd::Disconnected(reason) => {
                            warn!("{}: {} disconnected: {}", id, address, reason);
                            self.app.error(&id, format!("Disconnected from {}: {}", address, reason));
                        }
                        PumpEnd::Idle => {
                            warn!("{}: no data from {}, reconnecting", id, address);
                            self.app.error(&id, format!("No data from {}, reconnecting", address));
                        }
                    }
                }
                Err(e) => {
                    warn!("{}: cannot connect to {}: {}", id, address, e);
                    self.app.error(&id, format!("Cannot connect to {}: {}", address, e));
                }
            }
            if !wait_or_end(&mut input, self.backoff.next_delay()).await {
                return;
            }
        }
    }
}

impl Stage for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    fn run(
        self: Box<Self>,
        input: mpsc::Receiver<Record>,
        output: mpsc::Sender<Record>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(self.run_inner(input, output))
    }
}
