//! UDP transport. Each datagram is one chunk; replies go to the last sender.

use std::net::SocketAddr;

use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::outbound_bytes;
use crate::app::AppHandle;
use crate::record::Record;
use crate::stage::Stage;

const MAX_DATAGRAM: usize = 65_535;

pub struct UdpTransport {
    provider_id: String,
    bind: String,
    app: AppHandle,
}

impl UdpTransport {
    pub fn new(provider_id: &str, host: Option<&str>, port: u16, app: AppHandle) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            bind: format!("{}:{}", host.unwrap_or("0.0.0.0"), port),
            app,
        }
    }

    async fn run_inner(self, mut input: mpsc::Receiver<Record>, output: mpsc::Sender<Record>) {
        let id = self.provider_id.as_str();
        let socket = match UdpSocket::bind(&self.bind).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("{}: cannot bind {}: {}", id, self.bind, e);
                self.app.error(id, format!("Cannot bind {}: {}", self.bind, e));
                return;
            }
        };
        info!("{}: listening on udp {}", id, self.bind);
        self.app.status(id, format!("Listening on udp {}", self.bind));

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut last_peer: Option<SocketAddr> = None;
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => {
                        last_peer = Some(peer);
                        if output.send(Record::Bytes(buf[..n].to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!("{}: receive error: {}", id, e),
                },
                record = input.recv() => match record {
                    Some(record) => match (outbound_bytes(record), last_peer) {
                        (Some(bytes), Some(peer)) => {
                            if let Err(e) = socket.send_to(&bytes, peer).await {
                                warn!("{}: send to {} failed: {}", id, peer, e);
                            }
                        }
                        (Some(_), None) => debug!("{}: no peer yet, dropping write", id),
                        (None, _) => {}
                    },
                    None => return,
                },
            }
        }
    }
}

impl Stage for UdpTransport {
    fn name(&self) -> &str {
        "udp"
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

    #[tokio::test]
    async fn test_datagrams_and_reply() {
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (app, _events) = AppHandle::channel(16);
        let transport = UdpTransport::new("u", Some("127.0.0.1"), port, app);
        let (input, input_rx) = mpsc::channel(8);
        let (output_tx, mut output) = mpsc::channel(8);
        let task = tokio::spawn(Box::new(transport).run(input_rx, output_tx));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // the transport may not be bound yet; resend until something arrives
        let received = loop {
            sender.send_to(b"a\nb", ("127.0.0.1", port)).await.unwrap();
            if let Ok(Some(record)) =
                tokio::time::timeout(std::time::Duration::from_millis(50), output.recv()).await
            {
                break record;
            }
        };
        assert_eq!(received, Record::Bytes(b"a\nb".to_vec()));

        input.send(Record::Bytes(b"ack".to_vec())).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = sender.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ack");

        drop(input);
        task.await.unwrap();
    }
}
