//! TCP server transport: every client's lines feed the pipeline, and
//! outbound data goes to every client.

use std::net::SocketAddr;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{outbound_bytes, MAX_PENDING_WRITES};
use crate::app::AppHandle;
use crate::liner::Liner;
use crate::record::Record;
use crate::stage::Stage;

pub struct TcpServerTransport {
    provider_id: String,
    bind: SocketAddr,
    separator: String,
    app: AppHandle,
}

impl TcpServerTransport {
    pub fn new(provider_id: &str, port: u16, separator: &str, app: AppHandle) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            bind: SocketAddr::from(([0, 0, 0, 0], port)),
            separator: separator.to_string(),
            app,
        }
    }

    /// Bind to a specific address instead of every interface.
    pub fn bind_to(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    async fn run_inner(self, mut input: mpsc::Receiver<Record>, output: mpsc::Sender<Record>) {
        let id = self.provider_id.clone();
        let listener = match TcpListener::bind(self.bind).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("{}: cannot listen on {}: {}", id, self.bind, e);
                self.app.error(&id, format!("Cannot listen on {}: {}", self.bind, e));
                return;
            }
        };
        let local = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
        info!("{}: listening on {}", id, local);
        self.app.status(&id, format!("Listening on {}", local));

        let (outbound, _) = broadcast::channel::<Vec<u8>>(MAX_PENDING_WRITES);
        // dropped on return, which aborts every client task
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        info!("{}: client {} connected", id, peer);
                        self.app.status(&id, format!("Client {} connected", peer));
                        clients.spawn(serve_client(
                            id.clone(),
                            socket,
                            peer,
                            Liner::new(&self.separator),
                            output.clone(),
                            outbound.subscribe(),
                        ));
                    }
                    Err(e) => warn!("{}: accept failed: {}", id, e),
                },
                record = input.recv() => match record {
                    Some(record) => {
                        broadcast_outbound(&id, &outbound, record);
                    }
                    None => break,
                },
                Some(_) = clients.join_next() => {}
            }
        }
        debug!("{}: closing {} client(s)", id, clients.len());
    }
}

/// Queue `record` for every connected client. Returns how many got it.
fn broadcast_outbound(provider_id: &str, outbound: &broadcast::Sender<Vec<u8>>, record: Record) -> usize {
    let Some(bytes) = outbound_bytes(record) else {
        return 0;
    };
    match outbound.send(bytes) {
        Ok(clients) => clients,
        Err(_) => {
            debug!("{}: no client connected, dropping outbound write", provider_id);
            0
        }
    }
}

async fn serve_client(
    provider_id: String,
    socket: TcpStream,
    peer: SocketAddr,
    mut liner: Liner,
    output: mpsc::Sender<Record>,
    mut outbound: broadcast::Receiver<Vec<u8>>,
) {
    let (mut reader, mut writer) = socket.into_split();
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in liner.push(&buf[..n]) {
                        if output.send(Record::Line(line)).await.is_err() {
                            return;
                        }
                    }
                }
            },
            bytes = outbound.recv() => match bytes {
                Ok(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{}: client {} too slow, dropped {} writes", provider_id, peer, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    if let Some(line) = liner.flush() {
        let _ = output.send(Record::Line(line)).await;
    }
    info!("{}: client {} disconnected", provider_id, peer);
}

impl Stage for TcpServerTransport {
    fn name(&self) -> &str {
        "tcpserver"
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
    use std::time::Duration;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn connect(port: u16) -> TcpStream {
        for _ in 0..50 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("server did not start");
    }

    #[tokio::test]
    async fn test_lines_in_and_broadcast_out() {
        let port = free_port().await;
        let (app, _events) = AppHandle::channel(16);
        let transport = TcpServerTransport::new("srv", port, "\n", app)
            .bind_to(SocketAddr::from(([127, 0, 0, 1], port)));
        let (input, input_rx) = mpsc::channel(8);
        let (output_tx, mut output) = mpsc::channel(8);
        let task = tokio::spawn(Box::new(transport).run(input_rx, output_tx));

        let mut a = connect(port).await;
        let mut b = connect(port).await;
        a.write_all(b"$GPHDT,1").await.unwrap();
        a.write_all(b",T\n").await.unwrap();
        assert_eq!(output.recv().await, Some(Record::Line("$GPHDT,1,T".into())));
        b.write_all(b"$IIMTW,15,C\n").await.unwrap();
        assert_eq!(output.recv().await, Some(Record::Line("$IIMTW,15,C".into())));

        input.send(Record::Bytes(b"hi".to_vec())).await.unwrap();
        for client in [&mut a, &mut b] {
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hi");
        }

        drop(input);
        task.await.unwrap();
        // clients were closed with the server
        let mut buf = [0u8; 1];
        assert_eq!(a.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_outbound_without_clients_is_dropped() {
        let (outbound, _) = broadcast::channel(4);
        assert_eq!(broadcast_outbound("srv", &outbound, Record::Line("x".into())), 0);

        let mut client = outbound.subscribe();
        assert_eq!(broadcast_outbound("srv", &outbound, Record::Line("x".into())), 1);
        assert_eq!(client.try_recv().unwrap(), b"x\r\n".to_vec());
    }
}
