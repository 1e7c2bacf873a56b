// src/live_query/socket.rs

//! Physical WebSocket connections shared by LiveQuery clients.
//!
//! [`LiveQuerySocket`] owns every connection it opens. Each connection runs on its
//! own task; frames are read and written there and reported back to the owning
//! client through [`LiveQuerySocketDelegate`]. The registry lock is never held
//! while a delegate runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::ParseError;
use crate::live_query::lock;

/// Identifies one physical connection opened by a [`LiveQuerySocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ws#{}", self.0)
    }
}

/// Lifecycle callbacks for one connection.
///
/// A connection that fails or is closed by the server produces `on_error` (when
/// there is an error to report) followed by exactly one `on_close`. Connections
/// closed through [`LiveQuerySocket::close`] produce no further callbacks;
/// [`LiveQuerySocket::close_all`] reports `on_cancelled` instead.
pub trait LiveQuerySocketDelegate: Send + Sync {
    fn on_open(&self, handle: ConnectionHandle);
    fn on_close(&self, handle: ConnectionHandle, code: Option<u16>, reason: Option<String>);
    fn on_error(&self, handle: ConnectionHandle, error: ParseError);
    fn on_message(&self, handle: ConnectionHandle, text: String);
    fn on_cancelled(&self, _handle: ConnectionHandle) {}
}

/// Supplies extra headers for the WebSocket upgrade request, e.g. an
/// `Authorization` header expected by a proxy in front of the LiveQuery server.
pub trait LiveQueryAuthenticationDelegate: Send + Sync {
    fn handshake_headers(&self, url: &Url) -> Vec<(String, String)>;
}

enum Outbound {
    Text(String),
    Ping(oneshot::Sender<Result<(), ParseError>>),
    Close,
}

struct ConnectionEntry {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct SocketRegistry {
    delegates: HashMap<ConnectionHandle, Weak<dyn LiveQuerySocketDelegate>>,
    receiving_tasks: HashMap<ConnectionHandle, bool>,
    connections: HashMap<ConnectionHandle, ConnectionEntry>,
    authentication_delegate: Option<Arc<dyn LiveQueryAuthenticationDelegate>>,
}

/// Registry of live WebSocket connections.
///
/// [`LiveQuerySocket::shared`] is the process-wide instance clients use by default;
/// [`LiveQuerySocket::new`] builds an isolated one.
pub struct LiveQuerySocket {
    registry: Mutex<SocketRegistry>,
    next_handle: AtomicU64,
}

impl std::fmt::Debug for LiveQuerySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuerySocket")
            .field("connections", &self.connection_count())
            .finish()
    }
}

static SHARED_SOCKET: OnceLock<Arc<LiveQuerySocket>> = OnceLock::new();

impl LiveQuerySocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(SocketRegistry::default()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// The process-wide socket registry.
    pub fn shared() -> Arc<Self> {
        SHARED_SOCKET.get_or_init(LiveQuerySocket::new).clone()
    }

    /// Reserves a handle for a connection that will be started with
    /// [`LiveQuerySocket::create_task_for`].
    pub fn next_handle(&self) -> ConnectionHandle {
        ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Opens a connection to `url` and reports its lifecycle to `delegate`.
    pub fn create_task(
        self: &Arc<Self>,
        url: &Url,
        delegate: Weak<dyn LiveQuerySocketDelegate>,
    ) -> Result<ConnectionHandle, ParseError> {
        let handle = self.next_handle();
        self.create_task_for(handle, url, delegate)?;
        Ok(handle)
    }

    /// Opens a connection under a handle obtained from [`LiveQuerySocket::next_handle`].
    ///
    /// Must be called from within a Tokio runtime. Network failures are reported
    /// through the delegate, not through the returned `Result`.
    pub fn create_task_for(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        url: &Url,
        delegate: Weak<dyn LiveQuerySocketDelegate>,
    ) -> Result<(), ParseError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ParseError::SdkError("LiveQuery connections require a Tokio runtime".to_string())
        })?;

        let authentication_delegate = lock(&self.registry).authentication_delegate.clone();
        let headers = authentication_delegate
            .map(|delegate| delegate.handshake_headers(url))
            .unwrap_or_default();
        let request = build_request(url, &headers)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        {
            let mut registry = lock(&self.registry);
            if registry.delegates.contains_key(&handle) {
                return Err(ParseError::SdkError(format!(
                    "Connection {} is already registered",
                    handle
                )));
            }
            registry.delegates.insert(handle, delegate);
            registry.connections.insert(
                handle,
                ConnectionEntry {
                    outbound: outbound_tx,
                    task: None,
                },
            );
        }

        log::debug!("Opening LiveQuery connection {} to {}", handle, url);
        let task = runtime.spawn(run_connection(self.clone(), handle, request, outbound_rx));

        let mut registry = lock(&self.registry);
        match registry.connections.get_mut(&handle) {
            Some(entry) => entry.task = Some(task),
            // closed before the task handle could be stored
            None => task.abort(),
        }
        Ok(())
    }

    /// Queues a text frame on an open connection.
    pub fn send(&self, handle: ConnectionHandle, text: String) -> Result<(), ParseError> {
        let registry = lock(&self.registry);
        let entry = Self::open_entry(&registry, handle)?;
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("LiveQuery {} -> {}", handle, text);
        }
        entry
            .outbound
            .send(Outbound::Text(text))
            .map_err(|_| ParseError::SocketNotEstablished(format!("{} is closing", handle)))
    }

    /// Sends a ping frame. The returned receiver resolves when the pong arrives,
    /// or with an error if the connection goes away first.
    pub fn send_ping(
        &self,
        handle: ConnectionHandle,
    ) -> Result<oneshot::Receiver<Result<(), ParseError>>, ParseError> {
        let registry = lock(&self.registry);
        let entry = Self::open_entry(&registry, handle)?;
        let (tx, rx) = oneshot::channel();
        entry
            .outbound
            .send(Outbound::Ping(tx))
            .map_err(|_| ParseError::SocketNotEstablished(format!("{} is closing", handle)))?;
        Ok(rx)
    }

    fn open_entry(
        registry: &SocketRegistry,
        handle: ConnectionHandle,
    ) -> Result<&ConnectionEntry, ParseError> {
        let entry = registry.connections.get(&handle).ok_or_else(|| {
            ParseError::SocketNotEstablished(format!("{} is not a live connection", handle))
        })?;
        if registry.receiving_tasks.get(&handle) != Some(&true) {
            return Err(ParseError::SocketNotEstablished(format!(
                "{} is not open yet",
                handle
            )));
        }
        Ok(entry)
    }

    /// Closes one connection. The delegate receives no further callbacks.
    pub fn close(&self, handle: ConnectionHandle) {
        let entry = {
            let mut registry = lock(&self.registry);
            registry.delegates.remove(&handle);
            registry.receiving_tasks.remove(&handle);
            registry.connections.remove(&handle)
        };
        if let Some(entry) = entry {
            log::debug!("Closing LiveQuery connection {}", handle);
            shut_down(entry);
        }
    }

    /// Closes every connection and notifies each delegate with `on_cancelled`.
    /// Safe to call when nothing is open.
    pub fn close_all(&self) {
        let (entries, delegates) = {
            let mut registry = lock(&self.registry);
            registry.receiving_tasks.clear();
            let entries: Vec<_> = registry.connections.drain().collect();
            let delegates: Vec<_> = registry.delegates.drain().collect();
            (entries, delegates)
        };
        if !entries.is_empty() {
            log::debug!("Closing {} LiveQuery connection(s)", entries.len());
        }
        for (_, entry) in entries {
            shut_down(entry);
        }
        for (handle, delegate) in delegates {
            if let Some(delegate) = delegate.upgrade() {
                delegate.on_cancelled(handle);
            }
        }
    }

    /// Installs or clears the authentication delegate. The last call wins.
    pub fn set_authentication_delegate(
        &self,
        delegate: Option<Arc<dyn LiveQueryAuthenticationDelegate>>,
    ) {
        lock(&self.registry).authentication_delegate = delegate;
    }

    pub fn authentication_delegate(&self) -> Option<Arc<dyn LiveQueryAuthenticationDelegate>> {
        lock(&self.registry).authentication_delegate.clone()
    }

    /// Whether a delegate is registered for `handle`.
    pub fn is_registered(&self, handle: ConnectionHandle) -> bool {
        lock(&self.registry).delegates.contains_key(&handle)
    }

    /// Whether the receive loop of `handle` is running.
    pub fn is_receiving(&self, handle: ConnectionHandle) -> bool {
        lock(&self.registry).receiving_tasks.get(&handle) == Some(&true)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.registry).connections.len()
    }

    /// Marks the receive loop of `handle` as running. `false` if it already runs
    /// or the connection was closed in the meantime.
    fn mark_receiving(&self, handle: ConnectionHandle) -> bool {
        let mut registry = lock(&self.registry);
        if !registry.delegates.contains_key(&handle) {
            return false;
        }
        let receiving = registry.receiving_tasks.entry(handle).or_insert(false);
        if *receiving {
            return false;
        }
        *receiving = true;
        true
    }

    fn delegate(&self, handle: ConnectionHandle) -> Option<Arc<dyn LiveQuerySocketDelegate>> {
        lock(&self.registry)
            .delegates
            .get(&handle)
            .and_then(Weak::upgrade)
    }

    fn unregister(&self, handle: ConnectionHandle) -> Option<Arc<dyn LiveQuerySocketDelegate>> {
        let mut registry = lock(&self.registry);
        registry.receiving_tasks.remove(&handle);
        registry.connections.remove(&handle);
        registry.delegates.remove(&handle).and_then(|d| d.upgrade())
    }
}

fn shut_down(entry: ConnectionEntry) {
    if entry.outbound.send(Outbound::Close).is_err() {
        if let Some(task) = entry.task {
            task.abort();
        }
    }
}

fn build_request(url: &Url, headers: &[(String, String)]) -> Result<Request, ParseError> {
    let mut request = url.as_str().into_client_request()?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ParseError::InvalidInput(format!("Invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ParseError::InvalidInput(format!("Invalid header value: {}", e)))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

async fn run_connection(
    socket: Arc<LiveQuerySocket>,
    handle: ConnectionHandle,
    request: Request,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let connected = tokio::select! {
        result = connect_async(request) => result,
        _ = outbound.recv() => {
            log::debug!("LiveQuery connection {} closed while connecting", handle);
            return;
        }
    };

    let stream = match connected {
        Ok((stream, _response)) => stream,
        Err(e) => {
            log::warn!("LiveQuery connection {} failed: {}", handle, e);
            if let Some(delegate) = socket.unregister(handle) {
                delegate.on_error(handle, ParseError::ConnectionFailed(e.to_string()));
                delegate.on_close(handle, None, None);
            }
            return;
        }
    };

    if !socket.mark_receiving(handle) {
        log::debug!("LiveQuery connection {} no longer wanted", handle);
        return;
    }

    let (mut write, mut read) = stream.split();
    if let Some(delegate) = socket.delegate(handle) {
        delegate.on_open(handle);
    }

    let mut pending_pongs: VecDeque<oneshot::Sender<Result<(), ParseError>>> = VecDeque::new();
    let mut close_frame: (Option<u16>, Option<String>) = (None, None);
    let mut failure: Option<ParseError> = None;

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if log::log_enabled!(log::Level::Debug) {
                        log::debug!("LiveQuery {} <- {}", handle, text.as_str());
                    }
                    match socket.delegate(handle) {
                        Some(delegate) => delegate.on_message(handle, text.as_str().to_owned()),
                        None => break,
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => match socket.delegate(handle) {
                        Some(delegate) => delegate.on_message(handle, text),
                        None => break,
                    },
                    Err(_) => log::warn!("LiveQuery {} ignored a non UTF-8 binary frame", handle),
                },
                Some(Ok(Message::Pong(_))) => {
                    if let Some(waiter) = pending_pongs.pop_front() {
                        let _ = waiter.send(Ok(()));
                    }
                }
                // tungstenite answers pings itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        close_frame = (Some(u16::from(frame.code)), Some(frame.reason.as_str().to_owned()));
                    }
                    break;
                }
                Some(Err(e)) => {
                    failure = Some(e.into());
                    break;
                }
                None => break,
            },
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::text(text)).await {
                        failure = Some(e.into());
                        break;
                    }
                }
                Some(Outbound::Ping(waiter)) => match write.send(Message::Ping(Default::default())).await {
                    Ok(()) => pending_pongs.push_back(waiter),
                    Err(e) => {
                        let error: ParseError = e.into();
                        let _ = waiter.send(Err(error.clone()));
                        failure = Some(error);
                        break;
                    }
                },
                Some(Outbound::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    fail_pongs(&mut pending_pongs, handle);
                    return;
                }
            }
        }
    }

    fail_pongs(&mut pending_pongs, handle);
    let _ = write.close().await;
    if let Some(delegate) = socket.unregister(handle) {
        log::debug!(
            "LiveQuery connection {} closed (code {:?}, reason {:?})",
            handle,
            close_frame.0,
            close_frame.1
        );
        if let Some(error) = failure {
            delegate.on_error(handle, error);
        }
        delegate.on_close(handle, close_frame.0, close_frame.1);
    }
}

fn fail_pongs(
    pending_pongs: &mut VecDeque<oneshot::Sender<Result<(), ParseError>>>,
    handle: ConnectionHandle,
) {
    for waiter in pending_pongs.drain(..) {
        let _ = waiter.send(Err(ParseError::SocketNotEstablished(format!(
            "{} closed before the pong arrived",
            handle
        ))));
    }
}
