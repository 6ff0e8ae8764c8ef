//! Serial port transport.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use super::{pump, wait_or_end, Backoff, PumpEnd};
use crate::app::AppHandle;
use crate::record::Record;
use crate::stage::Stage;

pub struct SerialTransport {
    provider_id: String,
    device: String,
    baud_rate: u32,
    app: AppHandle,
}

impl SerialTransport {
    pub fn new(provider_id: &str, device: &str, baud_rate: u32, app: AppHandle) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            device: device.to_string(),
            baud_rate,
            app,
        }
    }

    async fn run_inner(self, mut input: mpsc::Receiver<Record>, output: mpsc::Sender<Record>) {
        let id = self.provider_id.as_str();
        let mut backoff = Backoff::default();
        loop {
            match tokio_serial::new(&self.device, self.baud_rate).open_native_async() {
                Ok(port) => {
                    backoff.reset();
                    info!("{}: opened {} at {} baud", id, self.device, self.baud_rate);
                    self.app.status(id, format!("Connected to {}", self.device));
                    let (reader, writer) = tokio::io::split(port);
                    match pump(id, reader, writer, &mut input, &output, None).await {
                        PumpEnd::InputClosed | PumpEnd::OutputClosed => return,
                        PumpEnd::Disconnected(reason) => {
                            warn!("{}: {} closed: {}", id, self.device, reason);
                            self.app.error(id, format!("{} closed: {}", self.device, reason));
                        }
                        PumpEnd::Idle => {}
                    }
                }
                Err(e) => {
                    warn!("{}: cannot open {}: {}", id, self.device, e);
                    self.app.error(id, format!("Cannot open {}: {}", self.device, e));
                }
            }
            if !wait_or_end(&mut input, backoff.next_delay()).await {
                return;
            }
        }
    }
}

impl Stage for SerialTransport {
    fn name(&self) -> &str {
        "serial"
    }

    fn run(
        self: Box<Self>,
        input: mpsc::Receiver<Record>,
        output: mpsc::Sender<Record>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(self.run_inner(input, output))
    }
}
