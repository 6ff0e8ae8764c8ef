//! Transports: the first stage of every pipeline.
//!
//! A transport stage reads outbound data from its input channel and writes
//! what it receives to its output. Closing its input is `end()`: the stage
//! releases its socket, port or child process and drops its output, which
//! ends the rest of the pipeline. Connection oriented transports reconnect
//! with [`Backoff`] until then.

pub mod backoff;
pub mod execute;
pub mod file;
pub mod serial;
pub mod tcp;
pub mod tcp_server;
pub mod udp;
pub mod websocket;

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use backoff::Backoff;

use crate::app::AppHandle;
use crate::config::{ConnectionConfig, TransportSettings};
use crate::liner::{Liner, NonBufferingLiner};
use crate::record::Record;
use crate::stage::{transform, Stage};
use crate::throttle::RateThrottle;

/// Outbound writes queued per connection before new ones are dropped.
pub const MAX_PENDING_WRITES: usize = 64;

const READ_BUFFER: usize = 4096;

/// Bytes to send for an outbound record.
pub(crate) fn outbound_bytes(record: Record) -> Option<Vec<u8>> {
    match record {
        Record::Bytes(bytes) => Some(bytes),
        Record::Line(mut line) => {
            line.push_str("\r\n");
            Some(line.into_bytes())
        }
        other => {
            debug!("Not writing {} record to transport", other.kind());
            None
        }
    }
}

/// Run `fut` unless the input closes first. Writes arriving meanwhile are
/// dropped since there is nowhere to send them.
pub(crate) async fn or_end<F: Future>(
    input: &mut mpsc::Receiver<Record>,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            record = input.recv() => match record {
                Some(_) => debug!("Not connected, dropping outbound write"),
                None => return None,
            },
        }
    }
}

/// Wait out a reconnect delay. False when the input closed meanwhile.
pub(crate) async fn wait_or_end(input: &mut mpsc::Receiver<Record>, delay: Duration) -> bool {
    or_end(input, tokio::time::sleep(delay)).await.is_some()
}

/// Why a connection stopped pumping.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PumpEnd {
    /// `end()` was called.
    InputClosed,
    /// The rest of the pipeline is gone.
    OutputClosed,
    Disconnected(String),
    /// Nothing received within the idle timeout.
    Idle,
}

/// Move data both ways until one side closes.
///
/// Reads become [`Record::Bytes`]. Writes go through a queue of
/// [`MAX_PENDING_WRITES`]; when it is full new writes are dropped.
pub(crate) async fn pump<R, W>(
    provider_id: &str,
    mut reader: R,
    writer: W,
    input: &mut mpsc::Receiver<Record>,
    output: &mpsc::Sender<Record>,
    idle_timeout: Option<Duration>,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (pending, mut queue) = mpsc::channel::<Vec<u8>>(MAX_PENDING_WRITES);
    let mut writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(bytes) = queue.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                return e.to_string();
            }
        }
        String::from("writer closed")
    });

    let mut buf = vec![0u8; READ_BUFFER];
    let idle = tokio::time::sleep(idle_timeout.unwrap_or(Duration::MAX));
    tokio::pin!(idle);

    let end = loop {
        tokio::select! {
            record = input.recv() => match record {
                Some(record) => {
                    if let Some(bytes) = outbound_bytes(record) {
                        if pending.try_send(bytes).is_err() {
                            warn!("{}: too many pending writes, dropping", provider_id);
                        }
                    }
                }
                None => break PumpEnd::InputClosed,
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => break PumpEnd::Disconnected("closed by peer".into()),
                Ok(n) => {
                    if let Some(timeout) = idle_timeout {
                        idle.as_mut().reset(Instant::now() + timeout);
                    }
                    if output.send(Record::Bytes(buf[..n].to_vec())).await.is_err() {
                        break PumpEnd::OutputClosed;
                    }
                }
                Err(e) => break PumpEnd::Disconnected(e.to_string()),
            },
            result = &mut writer_task => {
                let reason = result.unwrap_or_else(|e| e.to_string());
                break PumpEnd::Disconnected(reason);
            }
            _ = &mut idle, if idle_timeout.is_some() => break PumpEnd::Idle,
        }
    };
    writer_task.abort();
    end
}

/// The transport stage for `config` followed by its line splitter.
pub fn transport_stages(config: &ConnectionConfig, app: &AppHandle) -> Vec<Box<dyn Stage>> {
    let id = config.provider_id.as_str();
    let liner = || transform(Liner::new(&config.separator));
    match &config.transport {
        TransportSettings::Serial { device, baud_rate } => vec![
            Box::new(serial::SerialTransport::new(id, device, *baud_rate, app.clone())),
            liner(),
        ],
        TransportSettings::Tcp {
            host,
            port,
            idle_timeout,
        } => vec![
            Box::new(tcp::TcpTransport::new(id, host, *port, *idle_timeout, app.clone())),
            liner(),
        ],
        TransportSettings::TcpServer { port } => vec![Box::new(tcp_server::TcpServerTransport::new(
            id,
            *port,
            &config.separator,
            app.clone(),
        ))],
        TransportSettings::Udp { host, port } => vec![
            Box::new(udp::UdpTransport::new(id, host.as_deref(), *port, app.clone())),
            transform(NonBufferingLiner::new(&config.separator)),
        ],
        TransportSettings::Execute { command } => vec![
            Box::new(execute::ExecuteTransport::new(id, command, app.clone())),
            liner(),
        ],
        TransportSettings::FileStream {
            path,
            keep_running,
            throttle_rate,
        } => {
            let mut stages: Vec<Box<dyn Stage>> = vec![
                Box::new(
                    file::FileTransport::file(id, path, *keep_running, app.clone())
                        .with_separator(&config.separator),
                ),
                liner(),
            ];
            if let Some(rate) = throttle_rate {
                stages.push(transform(RateThrottle::new(*rate)));
            }
            stages
        }
        TransportSettings::FolderStream {
            folder,
            keep_running,
        } => vec![
            Box::new(
                file::FileTransport::folder(id, folder, *keep_running, app.clone())
                    .with_separator(&config.separator),
            ),
            liner(),
        ],
        TransportSettings::WebSocket {
            host,
            port,
            subscription,
        } => vec![Box::new(websocket::WebSocketTransport::new(
            id,
            host,
            *port,
            subscription.clone(),
            app.clone(),
        ))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_until_end() {
        let (client, mut server) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(client);
        let (input_tx, mut input) = mpsc::channel(8);
        let (output, mut output_rx) = mpsc::channel(8);

        let task = tokio::spawn(async move {
            pump("t", reader, writer, &mut input, &output, None).await
        });

        server.write_all(b"hello").await.unwrap();
        assert_eq!(output_rx.recv().await, Some(Record::Bytes(b"hello".to_vec())));

        input_tx.send(Record::Line("out".into())).await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"out\r\n");

        drop(input_tx);
        assert_eq!(task.await.unwrap(), PumpEnd::InputClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_idle_timeout() {
        let (client, _server) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(client);
        let (_input_tx, mut input) = mpsc::channel(8);
        let (output, _output_rx) = mpsc::channel(8);
        let end = pump("t", reader, writer, &mut input, &output, Some(Duration::from_secs(3))).await;
        assert_eq!(end, PumpEnd::Idle);
    }

    #[tokio::test]
    async fn test_peer_close_is_disconnect() {
        let (client, server) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(client);
        let (_input_tx, mut input) = mpsc::channel(8);
        let (output, _output_rx) = mpsc::channel(8);
        drop(server);
        let end = pump("t", reader, writer, &mut input, &output, None).await;
        assert!(matches!(end, PumpEnd::Disconnected(_)));
    }
}
