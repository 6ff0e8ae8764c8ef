//! Websocket client for another Signal K server.
//!
//! Connects with `subscribe=none`, waits for the hello and then sends its own
//! subscription. Every text frame becomes one [`Record::Line`].

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use signalk_protocol::{decode_server_message, encode_client_message, ClientMessage, ServerMessage, SubscribeRequest};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{or_end, wait_or_end, Backoff, PumpEnd};
use crate::app::AppHandle;
use crate::config::Subscription;
use crate::record::Record;
use crate::stage::Stage;

pub struct WebSocketTransport {
    provider_id: String,
    url: String,
    subscription: Subscription,
    app: AppHandle,
    backoff: Backoff,
}

impl WebSocketTransport {
    pub fn new(provider_id: &str, host: &str, port: u16, subscription: Subscription, app: AppHandle) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            url: format!("ws://{}:{}/signalk/v1/stream?subscribe=none", host, port),
            subscription,
            app,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn subscribe_message(&self) -> Option<Message> {
        let request = SubscribeRequest::single(&self.subscription.context, &self.subscription.path);
        match encode_client_message(&ClientMessage::Subscribe(request)) {
            Ok(text) => Some(Message::Text(text)),
            Err(e) => {
                warn!("{}: cannot encode subscription: {}", self.provider_id, e);
                None
            }
        }
    }

    async fn session<S>(&self, stream: S, input: &mut mpsc::Receiver<Record>, output: &mpsc::Sender<Record>) -> PumpEnd
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let id = self.provider_id.as_str();
        let (mut sink, mut frames) = stream.split();
        let mut subscribed = false;
        loop {
            tokio::select! {
                record = input.recv() => match record {
                    Some(record) => {
                        let text = match record {
                            Record::Line(line) => line,
                            Record::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                            other => {
                                debug!("{}: not sending {} record", id, other.kind());
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            return PumpEnd::Disconnected(e.to_string());
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return PumpEnd::InputClosed;
                    }
                },
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !subscribed && matches!(decode_server_message(&text), Ok(ServerMessage::Hello(_))) {
                            subscribed = true;
                            if let Some(message) = self.subscribe_message() {
                                if let Err(e) = sink.send(message).await {
                                    return PumpEnd::Disconnected(e.to_string());
                                }
                            }
                        }
                        if output.send(Record::Line(text)).await.is_err() {
                            return PumpEnd::OutputClosed;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return PumpEnd::Disconnected("closed by server".into()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return PumpEnd::Disconnected(e.to_string()),
                },
            }
        }
    }

    async fn run_inner(mut self, mut input: mpsc::Receiver<Record>, output: mpsc::Sender<Record>) {
        let id = self.provider_id.clone();
        loop {
            let Some(connected) = or_end(&mut input, tokio_tungstenite::connect_async(self.url.as_str())).await else {
                return;
            };
            match connected {
                Ok((stream, _)) => {
                    self.backoff.reset();
                    info!("{}: connected to {}", id, self.url);
                    self.app.status(&id, format!("Connected to {}", self.url));
                    match self.session(stream, &mut input, &output).await {
                        PumpEnd::InputClosed | PumpEnd::OutputClosed => return,
                        PumpEnd::Disconnected(reason) => {
                            warn!("{}: {} disconnected: {}", id, self.url, reason);
                            self.app.error(&id, format!("Disconnected from {}: {}", self.url, reason));
                        }
                        PumpEnd::Idle => {}
                    }
                }
                Err(e) => {
                    warn!("{}: cannot connect to {}: {}", id, self.url, e);
                    self.app.error(&id, format!("Cannot connect to {}: {}", self.url, e));
                }
            }
            if !wait_or_end(&mut input, self.backoff.next_delay()).await {
                return;
            }
        }
    }
}

impl Stage for WebSocketTransport {
    fn name(&self) -> &str {
        "websocket"
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
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_subscribes_after_hello() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            ws.send(Message::Text(
                r#"{"name":"remote","version":"1.7.0","self":"vessels.urn:mrn:signalk:uuid:x","roles":["main"],"timestamp":"2024-01-01T00:00:00.000Z"}"#.into(),
            ))
            .await
            .unwrap();
            let subscribe = match ws.next().await {
                Some(Ok(Message::Text(text))) => text,
                other => panic!("expected subscription, got {:?}", other),
            };
            ws.send(Message::Text(r#"{"updates":[]}"#.into())).await.unwrap();
            // wait for the client to go away
            while let Some(Ok(_)) = ws.next().await {}
            subscribe
        });

        let (app, _events) = AppHandle::channel(16);
        let subscription = Subscription {
            context: "vessels.self".into(),
            path: "navigation.*".into(),
        };
        let transport = WebSocketTransport::new("ws", "127.0.0.1", port, subscription, app)
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(10)));
        let (input, input_rx) = mpsc::channel(8);
        let (output_tx, mut output) = mpsc::channel(8);
        let task = tokio::spawn(Box::new(transport).run(input_rx, output_tx));

        match output.recv().await {
            Some(Record::Line(hello)) => assert!(hello.contains("\"remote\"")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(output.recv().await, Some(Record::Line(r#"{"updates":[]}"#.into())));

        drop(input);
        task.await.unwrap();
        let subscribe: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(subscribe["context"], "vessels.self");
        assert_eq!(subscribe["subscribe"][0]["path"], "navigation.*");
    }
}
