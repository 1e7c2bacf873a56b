#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use parse_livequery::{
    LiveQueryConfig, LiveQuerySocket, Parse, ParseError, ParseLiveQuery, ParseLiveQueryDelegate,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

static INIT_LOGGER: Once = Once::new();

pub fn initialize_logger_once() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A LiveQuery server on 127.0.0.1 that hands every accepted WebSocket to the test.
pub struct MockServer {
    pub port: u16,
    connections: mpsc::UnboundedReceiver<MockConnection>,
}

/// One accepted WebSocket. Dropping it closes the connection without a close frame payload.
pub struct MockConnection {
    pub headers: HashMap<String, String>,
    incoming: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        initialize_logger_once();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();
        let (connections_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let captured = Arc::new(Mutex::new(HashMap::new()));
                let callback_headers = captured.clone();
                let callback = move |request: &Request, response: Response| {
                    let mut headers = callback_headers.lock().unwrap();
                    for (name, value) in request.headers() {
                        if let Ok(value) = value.to_str() {
                            headers.insert(name.as_str().to_string(), value.to_string());
                        }
                    }
                    Ok::<Response, ErrorResponse>(response)
                };
                let Ok(websocket) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let (incoming_tx, incoming) = mpsc::unbounded_channel();
                let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
                let headers = captured.lock().unwrap().clone();
                if connections_tx
                    .send(MockConnection {
                        headers,
                        incoming,
                        outgoing,
                    })
                    .is_err()
                {
                    return;
                }

                tokio::spawn(async move {
                    let (mut write, mut read) = websocket.split();
                    loop {
                        tokio::select! {
                            frame = read.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let value: Value = serde_json::from_str(text.as_str())
                                        .expect("client sent invalid JSON");
                                    let _ = incoming_tx.send(value);
                                }
                                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                                Some(Ok(_)) => {}
                            },
                            command = outgoing_rx.recv() => match command {
                                Some(message) => {
                                    let closing = matches!(message, Message::Close(_));
                                    if write.send(message).await.is_err() || closing {
                                        break;
                                    }
                                }
                                None => {
                                    let _ = write.close().await;
                                    break;
                                }
                            },
                        }
                    }
                });
            }
        });

        MockServer { port, connections }
    }

    /// The REST-style URL a `Parse` instance is configured with.
    pub fn http_url(&self) -> String {
        format!("http://127.0.0.1:{}/parse", self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/parse", self.port)
    }

    pub async fn accept(&mut self) -> MockConnection {
        tokio::time::timeout(TIMEOUT, self.connections.recv())
            .await
            .expect("timed out waiting for a LiveQuery connection")
            .expect("mock server stopped")
    }

    /// `true` if a client connects within `wait`.
    pub async fn has_connection_within(&mut self, wait: Duration) -> bool {
        matches!(
            tokio::time::timeout(wait, self.connections.recv()).await,
            Ok(Some(_))
        )
    }
}

impl MockConnection {
    pub async fn next_message(&mut self) -> Value {
        tokio::time::timeout(TIMEOUT, self.incoming.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("connection closed")
    }

    /// The next client message, or `None` if nothing arrives within `wait`.
    pub async fn next_message_within(&mut self, wait: Duration) -> Option<Value> {
        tokio::time::timeout(wait, self.incoming.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn send(&self, message: Value) {
        self.outgoing
            .send(Message::text(message.to_string()))
            .expect("connection task stopped");
    }

    pub fn send_raw(&self, text: &str) {
        self.outgoing
            .send(Message::text(text.to_string()))
            .expect("connection task stopped");
    }

    pub fn close_with(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.outgoing.send(Message::Close(Some(frame)));
    }

    /// Reads the `connect` handshake, answers `connected` and returns the handshake.
    pub async fn handshake(&mut self, client_id: &str) -> Value {
        let connect = self.next_message().await;
        assert_eq!(connect["op"], "connect");
        self.send(json!({ "op": "connected", "clientId": client_id }));
        connect
    }
}

/// Backoff small enough that reconnect tests finish quickly.
pub fn fast_config() -> LiveQueryConfig {
    LiveQueryConfig::default()
        .reconnect_backoff(Duration::from_millis(10), Duration::from_millis(50))
}

pub fn setup_parse(server: &MockServer) -> Parse {
    Parse::new(&server.http_url(), "test-app-id", Some("test-client-key"), None)
        .expect("valid test server url")
}

/// A client on its own socket registry, so tests do not share connections.
pub fn setup_live_query(server: &MockServer) -> ParseLiveQuery {
    ParseLiveQuery::with_socket(setup_parse(server), fast_config(), LiveQuerySocket::new())
        .expect("live query client")
}

/// Opens `live_query` against `connection`'s server and completes the handshake.
pub async fn open_and_handshake(
    live_query: &ParseLiveQuery,
    server: &mut MockServer,
    client_id: &str,
) -> (MockConnection, Value) {
    let opening = {
        let live_query = live_query.clone();
        tokio::spawn(async move { live_query.open(true).await })
    };
    let mut connection = server.accept().await;
    let connect = connection.handshake(client_id).await;
    tokio::time::timeout(TIMEOUT, opening)
        .await
        .expect("open timed out")
        .expect("open task panicked")
        .expect("open failed");
    (connection, connect)
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn recv_within<T>(receiver: &mut mpsc::UnboundedReceiver<T>, what: &str) -> T {
    tokio::time::timeout(TIMEOUT, receiver.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
        .unwrap_or_else(|| panic!("channel closed waiting for {}", what))
}

/// Records connection-level notifications.
#[derive(Default)]
pub struct RecordingDelegate {
    pub errors: Mutex<Vec<ParseError>>,
    pub unsupported: Mutex<Vec<String>>,
    pub closed: Mutex<Vec<(Option<u16>, Option<String>)>>,
}

impl ParseLiveQueryDelegate for RecordingDelegate {
    fn received_error(&self, error: &ParseError) {
        self.errors.lock().unwrap().push(error.clone());
    }

    fn received_unsupported(&self, text: &str) {
        self.unsupported.lock().unwrap().push(text.to_string());
    }

    fn closed_socket(&self, code: Option<u16>, reason: Option<&str>) {
        self.closed
            .lock()
            .unwrap()
            .push((code, reason.map(str::to_string)));
    }
}
