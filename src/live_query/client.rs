// src/live_query/client.rs

use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use crate::client::{to_websocket_url, Parse};
use crate::config::LiveQueryConfig;
use crate::error::ParseError;
use crate::live_query::lock;
use crate::live_query::messages::{
    self, ClientOperation, RequestId, RequestIdGenerator, ServerResponse, StandardMessage,
    SubscribeMessage, UnsubscribeMessage,
};
use crate::live_query::registry::{SubscriptionRecord, SubscriptionRegistry};
use crate::live_query::socket::{
    ConnectionHandle, LiveQueryAuthenticationDelegate, LiveQuerySocket, LiveQuerySocketDelegate,
};
use crate::live_query::state::{ConnectionFlags, ConnectionState};
use crate::live_query::subscription::{
    Event, Subscription, SubscriptionCallback, SubscriptionHandler,
};
use crate::query::ParseQuery;

/// Connection-level notifications of a [`ParseLiveQuery`] client.
///
/// All methods have empty default implementations.
pub trait ParseLiveQueryDelegate: Send + Sync {
    /// A server `error` message, a socket failure, or a frame that could not be decoded.
    fn received_error(&self, _error: &ParseError) {}

    /// A frame the client does not understand, as received.
    fn received_unsupported(&self, _text: &str) {}

    /// The socket closed, with the close frame's code and reason when the server sent one.
    fn closed_socket(&self, _code: Option<u16>, _reason: Option<&str>) {}
}

type OpenWaiter = oneshot::Sender<Result<(), ParseError>>;

struct ClientState {
    flags: ConnectionFlags,
    url: Url,
    registry: SubscriptionRegistry,
    handle: Option<ConnectionHandle>,
    open_waiters: Vec<OpenWaiter>,
    receive_delegate: Option<Arc<dyn ParseLiveQueryDelegate>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl ClientState {
    fn resolve_waiters(&mut self, result: Result<(), ParseError>) {
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

/// Work collected under the state lock and carried out after it is released.
enum Notification {
    Subscribed(Arc<dyn SubscriptionHandler>, ParseQuery, bool),
    Unsubscribed(Arc<dyn SubscriptionHandler>, ParseQuery),
    Event(Arc<dyn SubscriptionHandler>, ParseQuery, Event<Value>),
    HandlerError(Arc<dyn SubscriptionHandler>, ParseQuery, ParseError),
    Error(Arc<dyn ParseLiveQueryDelegate>, ParseError),
    Unsupported(Arc<dyn ParseLiveQueryDelegate>, String),
    ClosedSocket(Arc<dyn ParseLiveQueryDelegate>, Option<u16>, Option<String>),
}

fn deliver(notifications: Vec<Notification>) {
    for notification in notifications {
        match notification {
            Notification::Subscribed(handler, query, is_new) => {
                handler.on_subscribed(&query, is_new)
            }
            Notification::Unsubscribed(handler, query) => handler.on_unsubscribed(&query),
            Notification::Event(handler, query, event) => handler.on_event(&query, event),
            Notification::HandlerError(handler, query, error) => handler.on_error(&query, error),
            Notification::Error(delegate, error) => delegate.received_error(&error),
            Notification::Unsupported(delegate, text) => delegate.received_unsupported(&text),
            Notification::ClosedSocket(delegate, code, reason) => {
                delegate.closed_socket(code, reason.as_deref())
            }
        }
    }
}

struct LiveQueryInner {
    parse: Parse,
    config: LiveQueryConfig,
    socket: Arc<LiveQuerySocket>,
    request_ids: RequestIdGenerator,
    state: Mutex<ClientState>,
    this: Weak<LiveQueryInner>,
}

/// A LiveQuery client: one logical connection to a LiveQuery server carrying
/// any number of query subscriptions.
///
/// The client keeps its subscriptions across socket failures. After every
/// reconnect the server's `connected` handshake triggers a replay of all
/// subscriptions, and a server `redirect` moves the connection to a new URL
/// without losing them.
///
/// `ParseLiveQuery` is cheap to clone; clones share the same connection. When the
/// last clone is dropped the connection is closed.
///
/// # Example
///
/// ```rust,no_run
/// use parse_livequery::{LiveQueryConfig, Parse, ParseLiveQuery, ParseObject, ParseQuery};
/// # use parse_livequery::ParseError;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), ParseError> {
/// let parse = Parse::new("http://localhost:1338/parse", "myAppId", None, None)?;
/// let live_query = ParseLiveQuery::new(parse, LiveQueryConfig::default())?;
/// live_query.open(true).await?;
///
/// let mut query = ParseQuery::new("GameScore");
/// query.greater_than("points", 9);
/// let subscription = live_query.subscribe::<ParseObject>(&query)?;
/// # let _ = subscription;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ParseLiveQuery {
    inner: Arc<LiveQueryInner>,
}

impl std::fmt::Debug for ParseLiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("ParseLiveQuery")
            .field("url", &state.url.as_str())
            .field("state", &state.flags.state())
            .field("pending", &state.registry.pending_len())
            .field("active", &state.registry.active_len())
            .finish()
    }
}

static DEFAULT_CLIENT: OnceLock<RwLock<Option<ParseLiveQuery>>> = OnceLock::new();

fn default_slot() -> &'static RwLock<Option<ParseLiveQuery>> {
    DEFAULT_CLIENT.get_or_init(|| RwLock::new(None))
}

impl ParseLiveQuery {
    /// Creates a client for `parse.live_query_url()` on the process-wide socket.
    pub fn new(parse: Parse, config: LiveQueryConfig) -> Result<Self, ParseError> {
        Self::with_socket(parse, config, LiveQuerySocket::shared())
    }

    /// Creates a client whose connection lives on the given socket registry.
    pub fn with_socket(
        parse: Parse,
        config: LiveQueryConfig,
        socket: Arc<LiveQuerySocket>,
    ) -> Result<Self, ParseError> {
        let url = parse.live_query_url()?;
        log::debug!("LiveQuery client created for {}", url);
        let inner = Arc::new_cyclic(|this| LiveQueryInner {
            parse,
            config,
            socket,
            request_ids: RequestIdGenerator::new(),
            state: Mutex::new(ClientState {
                flags: ConnectionFlags::new(),
                url,
                registry: SubscriptionRegistry::new(),
                handle: None,
                open_waiters: Vec::new(),
                receive_delegate: None,
                reconnect_task: None,
            }),
            this: this.clone(),
        });
        Ok(Self { inner })
    }

    /// Makes `client` the process default.
    pub fn set_default(client: ParseLiveQuery) {
        *default_slot()
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(client);
    }

    /// The process default client, if one was set.
    pub fn default_client() -> Option<ParseLiveQuery> {
        default_slot()
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Removes the process default client and returns it.
    pub fn clear_default() -> Option<ParseLiveQuery> {
        default_slot()
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Whether both handles refer to the same client.
    pub fn ptr_eq(&self, other: &ParseLiveQuery) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // --- Connection ---

    /// Connects to the server and performs the `connect` handshake.
    ///
    /// Resolves once the server answered with `connected`, or with an error when
    /// the socket could not be established or the client was closed meanwhile.
    /// Returns immediately when already connected.
    ///
    /// `is_user_wants_to_connect` clears a previous [`ParseLiveQuery::close`]; with
    /// `false` a closed client stays closed and this returns `Ok(())` without connecting.
    pub async fn open(&self, is_user_wants_to_connect: bool) -> Result<(), ParseError> {
        match self.inner.start_open(is_user_wants_to_connect)? {
            None => Ok(()),
            Some(waiter) => waiter.await.unwrap_or_else(|_| {
                Err(ParseError::ConnectionFailed(
                    "LiveQuery client dropped before connecting".to_string(),
                ))
            }),
        }
    }

    /// Closes the connection. The client will not reconnect until [`ParseLiveQuery::open`]
    /// is called with `is_user_wants_to_connect = true`. Subscriptions are kept and
    /// replayed on the next handshake.
    pub fn close(&self) {
        self.inner.close_by_user();
    }

    /// Closes every connection of this client's socket registry, including
    /// connections owned by other clients.
    pub fn close_all(&self) {
        self.inner.close_by_user();
        self.inner.socket.close_all();
    }

    /// Sends a WebSocket ping and waits for the pong.
    ///
    /// Fails immediately with [`ParseError::SocketNotEstablished`] when there is no
    /// open socket; this never opens one.
    pub async fn send_ping(&self) -> Result<(), ParseError> {
        let handle = {
            let state = lock(&self.inner.state);
            match (state.flags.is_socket_established(), state.handle) {
                (true, Some(handle)) => handle,
                _ => {
                    return Err(ParseError::SocketNotEstablished(
                        "Need to open the websocket first".to_string(),
                    ))
                }
            }
        };
        let pong = self.inner.socket.send_ping(handle)?;
        pong.await.unwrap_or_else(|_| {
            Err(ParseError::SocketNotEstablished(
                "Connection closed before the pong arrived".to_string(),
            ))
        })
    }

    /// Feeds one text frame to the protocol state machine, exactly as if it had
    /// arrived on the socket.
    pub fn received(&self, text: &str) {
        self.inner.received(text);
    }

    // --- Subscriptions ---

    /// Subscribes to `query` with a property-style [`Subscription`].
    ///
    /// The subscription is sent right away when connected, otherwise on the next
    /// `connected` handshake.
    pub fn subscribe<T>(&self, query: &ParseQuery) -> Result<Arc<Subscription<T>>, ParseError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.subscribe_handler(query, Arc::new(Subscription::new()))
    }

    /// Subscribes to `query` with closure callbacks.
    pub fn subscribe_callback<T>(
        &self,
        query: &ParseQuery,
        callbacks: SubscriptionCallback<T>,
    ) -> Result<Arc<SubscriptionCallback<T>>, ParseError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.subscribe_handler(query, Arc::new(callbacks))
    }

    /// Subscribes to `query` with any [`SubscriptionHandler`].
    pub fn subscribe_handler<H: SubscriptionHandler>(
        &self,
        query: &ParseQuery,
        handler: Arc<H>,
    ) -> Result<Arc<H>, ParseError> {
        if query.class_name().is_empty() {
            return Err(ParseError::InvalidQuery(
                "A LiveQuery subscription needs a class name".to_string(),
            ));
        }
        let dyn_handler: Arc<dyn SubscriptionHandler> = handler.clone();
        let request_id = self.inner.request_ids.next_id();
        let session_token = self.inner.parse.session_token();

        let mut state = lock(&self.inner.state);
        state.registry.insert_pending(
            request_id,
            SubscriptionRecord::new(query.clone(), dyn_handler),
        );
        log::debug!(
            "Subscribing to {} with request {}",
            query.class_name(),
            request_id
        );
        if state.flags.is_connected() {
            let message =
                SubscribeMessage::new(ClientOperation::Subscribe, request_id, query, session_token);
            if let Err(e) = self.inner.send_locked(&state, &message) {
                log::warn!(
                    "Subscribe request {} will be sent after reconnecting: {}",
                    request_id,
                    e
                );
            }
        }
        Ok(handler)
    }

    /// Replaces the query of an existing subscription, keeping its handler and
    /// request id.
    ///
    /// Until the server acknowledges the update the subscription stays active for
    /// the old query, so no events are lost; the acknowledgment is reported with
    /// `is_new = false`.
    pub fn update<H: SubscriptionHandler>(
        &self,
        handler: &Arc<H>,
        query: &ParseQuery,
    ) -> Result<(), ParseError> {
        let dyn_handler: Arc<dyn SubscriptionHandler> = handler.clone();
        let session_token = self.inner.parse.session_token();

        let mut state = lock(&self.inner.state);
        let request_id = state
            .registry
            .request_id_for_handler(&dyn_handler)
            .ok_or_else(|| {
                ParseError::InvalidQuery("The handler is not subscribed".to_string())
            })?;
        state.registry.insert_pending(
            request_id,
            SubscriptionRecord::new(query.clone(), dyn_handler),
        );
        if state.flags.is_connected() {
            let message =
                SubscribeMessage::new(ClientOperation::Update, request_id, query, session_token);
            self.inner.send_locked(&state, &message)?;
        }
        Ok(())
    }

    /// Unsubscribes from `query`.
    ///
    /// While connected the subscription is removed when the server acknowledges the
    /// request. Without a connection there is nothing to tell the server; the
    /// subscription is removed right away and its handler notified.
    pub fn unsubscribe(&self, query: &ParseQuery) -> Result<(), ParseError> {
        let request_id = {
            let state = lock(&self.inner.state);
            state.registry.request_id_for_query(query)
        }
        .ok_or_else(|| {
            ParseError::InvalidQuery(format!(
                "Not subscribed to a query on {}",
                query.class_name()
            ))
        })?;
        self.inner.unsubscribe_request(request_id)
    }

    /// Unsubscribes whatever query `handler` is registered for.
    pub fn unsubscribe_handler<H: SubscriptionHandler>(
        &self,
        handler: &Arc<H>,
    ) -> Result<(), ParseError> {
        let dyn_handler: Arc<dyn SubscriptionHandler> = handler.clone();
        let request_id = {
            let state = lock(&self.inner.state);
            state.registry.request_id_for_handler(&dyn_handler)
        }
        .ok_or_else(|| ParseError::InvalidQuery("The handler is not subscribed".to_string()))?;
        self.inner.unsubscribe_request(request_id)
    }

    pub fn is_subscribed(&self, query: &ParseQuery) -> bool {
        lock(&self.inner.state).registry.is_subscribed(query)
    }

    pub fn is_pending_subscription(&self, query: &ParseQuery) -> bool {
        lock(&self.inner.state)
            .registry
            .is_pending_subscription(query)
    }

    /// Forgets an active subscription locally, without telling the server.
    pub fn remove_subscription(&self, query: &ParseQuery) {
        lock(&self.inner.state).registry.remove_subscription(query);
    }

    /// Forgets a pending subscription locally, without telling the server.
    pub fn remove_pending_subscription(&self, query: &ParseQuery) {
        lock(&self.inner.state)
            .registry
            .remove_pending_subscription(query);
    }

    pub fn pending_request_ids(&self) -> Vec<RequestId> {
        lock(&self.inner.state).registry.pending_request_ids()
    }

    pub fn active_request_ids(&self) -> Vec<RequestId> {
        lock(&self.inner.state).registry.active_request_ids()
    }

    // --- Delegates ---

    /// Installs or clears the receiver of connection-level notifications.
    pub fn set_receive_delegate(&self, delegate: Option<Arc<dyn ParseLiveQueryDelegate>>) {
        lock(&self.inner.state).receive_delegate = delegate;
    }

    /// Installs or clears the authentication delegate of this client's socket
    /// registry. The registry holds a single delegate; the last call wins.
    pub fn set_authentication_delegate(
        &self,
        delegate: Option<Arc<dyn LiveQueryAuthenticationDelegate>>,
    ) {
        self.inner.socket.set_authentication_delegate(delegate);
    }

    // --- State ---

    pub fn url(&self) -> Url {
        lock(&self.inner.state).url.clone()
    }

    pub fn client_id(&self) -> Option<String> {
        lock(&self.inner.state)
            .flags
            .client_id()
            .map(str::to_string)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).flags.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        lock(&self.inner.state).flags.is_connecting()
    }

    pub fn is_socket_established(&self) -> bool {
        lock(&self.inner.state).flags.is_socket_established()
    }

    pub fn is_disconnected_by_user(&self) -> bool {
        lock(&self.inner.state).flags.is_disconnected_by_user()
    }

    /// Consecutive failed reconnects since the last successful handshake.
    pub fn attempts(&self) -> usize {
        lock(&self.inner.state).flags.attempts()
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inner.state).flags.state()
    }

    /// Snapshot of the connection flags.
    pub fn flags(&self) -> ConnectionFlags {
        lock(&self.inner.state).flags.clone()
    }

    pub fn connection_handle(&self) -> Option<ConnectionHandle> {
        lock(&self.inner.state).handle
    }

    pub fn socket(&self) -> &Arc<LiveQuerySocket> {
        &self.inner.socket
    }

    pub fn config(&self) -> &LiveQueryConfig {
        &self.inner.config
    }
}

impl LiveQueryInner {
    fn delegate_weak(&self) -> Weak<dyn LiveQuerySocketDelegate> {
        self.this.clone()
    }

    /// Starts a connection attempt. `None` when there is nothing to wait for.
    fn start_open(
        &self,
        is_user_wants_to_connect: bool,
    ) -> Result<Option<oneshot::Receiver<Result<(), ParseError>>>, ParseError> {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        let (handle, url) = {
            let mut state = lock(&self.state);
            if is_user_wants_to_connect {
                state.flags.set_disconnected_by_user(false);
            }
            if state.flags.is_connected() || state.flags.is_disconnected_by_user() {
                return Ok(None);
            }
            state.open_waiters.push(waiter_tx);
            if state.flags.is_connecting() {
                return Ok(Some(waiter_rx));
            }
            if state.flags.is_socket_established() {
                if let Some(handle) = state.handle {
                    state.flags.set_connecting(true);
                    if let Err(e) = self.send_connect_locked(&state, handle) {
                        state.flags.set_connecting(false);
                        state.resolve_waiters(Err(e.clone()));
                        return Err(e);
                    }
                    return Ok(Some(waiter_rx));
                }
            }
            state.cancel_reconnect();
            state.flags.set_connecting(true);
            let handle = self.socket.next_handle();
            state.handle = Some(handle);
            (handle, state.url.clone())
        };

        // The authentication delegate runs inside create_task_for; keep it outside the state lock.
        if let Err(e) = self
            .socket
            .create_task_for(handle, &url, self.delegate_weak())
        {
            let mut state = lock(&self.state);
            if state.handle == Some(handle) {
                state.handle = None;
                state.flags.set_connecting(false);
            }
            state.resolve_waiters(Err(e.clone()));
            return Err(e);
        }
        Ok(Some(waiter_rx))
    }

    fn send_locked<M: serde::Serialize>(
        &self,
        state: &ClientState,
        message: &M,
    ) -> Result<(), ParseError> {
        let handle = state.handle.ok_or_else(|| {
            ParseError::SocketNotEstablished("No LiveQuery connection".to_string())
        })?;
        let text = messages::encode(message)?;
        self.socket.send(handle, text)
    }

    fn send_connect_locked(
        &self,
        state: &ClientState,
        handle: ConnectionHandle,
    ) -> Result<(), ParseError> {
        let message = StandardMessage::new(ClientOperation::Connect, true, &self.parse);
        log::debug!("Sending LiveQuery connect handshake on {}", handle);
        self.send_locked(state, &message)
    }

    fn close_by_user(&self) {
        let handle = {
            let mut state = lock(&self.state);
            state.flags.close_by_user();
            state.cancel_reconnect();
            state.resolve_waiters(Err(ParseError::SocketNotEstablished(
                "LiveQuery client was closed".to_string(),
            )));
            state.handle.take()
        };
        if let Some(handle) = handle {
            log::debug!("LiveQuery client closing {}", handle);
            self.socket.close(handle);
        }
    }

    fn unsubscribe_request(&self, request_id: RequestId) -> Result<(), ParseError> {
        let mut notifications = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.flags.is_connected() {
                log::debug!("Unsubscribing request {}", request_id);
                return self.send_locked(&state, &UnsubscribeMessage::new(request_id));
            }
            if let Some(record) = state.registry.remove_request(request_id) {
                notifications.push(Notification::Unsubscribed(record.handler, record.query));
            }
        }
        deliver(notifications);
        Ok(())
    }

    fn received(&self, text: &str) {
        let mut notifications = Vec::new();
        let response = match messages::decode(text) {
            Ok(response) => response,
            Err(error) => {
                log::warn!("Could not decode LiveQuery message: {}", error);
                let delegate = lock(&self.state).receive_delegate.clone();
                if let Some(delegate) = delegate {
                    notifications.push(Notification::Unsupported(delegate.clone(), text.to_string()));
                    notifications.push(Notification::Error(delegate, error));
                }
                deliver(notifications);
                return;
            }
        };

        let session_token = match &response {
            ServerResponse::Connected(_) => self.parse.session_token(),
            _ => None,
        };
        let mut reconnect_to_redirect = false;

        {
            let mut state = lock(&self.state);
            match response.into_event() {
                Ok((kind, event)) => match state.registry.active(event.request_id) {
                    Some(record) => notifications.push(Notification::Event(
                        record.handler.clone(),
                        record.query.clone(),
                        Event::new(kind, event.object),
                    )),
                    None => log::debug!(
                        "Dropping {:?} event for inactive request {}",
                        kind,
                        event.request_id
                    ),
                },
                Err(ServerResponse::Connected(connected)) => {
                    if state.flags.complete_handshake(connected.client_id) {
                        log::debug!(
                            "LiveQuery connected as {:?} to {}",
                            state.flags.client_id(),
                            state.url
                        );
                        state.resolve_waiters(Ok(()));
                        state.registry.demote_all();
                        self.replay_locked(&state, session_token);
                    } else {
                        log::warn!("Ignoring LiveQuery 'connected' without an open socket");
                    }
                }
                Err(ServerResponse::Subscribed(response)) => {
                    match state.registry.promote(response.request_id) {
                        Some((record, is_new)) => notifications.push(Notification::Subscribed(
                            record.handler,
                            record.query,
                            is_new,
                        )),
                        None => log::debug!(
                            "Ignoring 'subscribed' for unknown request {}",
                            response.request_id
                        ),
                    }
                }
                Err(ServerResponse::Unsubscribed(response)) => {
                    match state.registry.remove_request(response.request_id) {
                        Some(record) => notifications
                            .push(Notification::Unsubscribed(record.handler, record.query)),
                        None => log::debug!(
                            "Ignoring 'unsubscribed' for unknown request {}",
                            response.request_id
                        ),
                    }
                }
                Err(ServerResponse::Error(response)) => {
                    let error = ParseError::from_live_query_error(response.code, response.message);
                    log::warn!(
                        "LiveQuery server error (reconnect: {}): {}",
                        response.reconnect,
                        error
                    );
                    if let Some(delegate) = state.receive_delegate.clone() {
                        notifications.push(Notification::Error(delegate, error.clone()));
                    }
                    if let Some(record) = response
                        .request_id
                        .and_then(|request_id| state.registry.get(request_id))
                    {
                        notifications.push(Notification::HandlerError(
                            record.handler.clone(),
                            record.query.clone(),
                            error.clone(),
                        ));
                    }
                    if !response.reconnect {
                        state.flags.close_by_user();
                        state.cancel_reconnect();
                        state.resolve_waiters(Err(error));
                        if let Some(handle) = state.handle.take() {
                            self.socket.close(handle);
                        }
                    }
                }
                Err(ServerResponse::Redirect(redirect)) => {
                    match Url::parse(&redirect.url)
                        .map_err(ParseError::from)
                        .and_then(|url| to_websocket_url(&url))
                    {
                        Ok(url) => {
                            log::info!("LiveQuery redirected from {} to {}", state.url, url);
                            state.url = url;
                            if state.flags.is_socket_established() || state.flags.is_connecting() {
                                if let Some(handle) = state.handle.take() {
                                    self.socket.close(handle);
                                }
                                state.flags.set_socket_established(false);
                                reconnect_to_redirect = !state.flags.is_disconnected_by_user();
                            }
                        }
                        Err(error) => {
                            log::warn!("Ignoring redirect to '{}': {}", redirect.url, error);
                            if let Some(delegate) = state.receive_delegate.clone() {
                                notifications.push(Notification::Error(delegate, error));
                            }
                        }
                    }
                }
                Err(other) => {
                    log::warn!("Unhandled LiveQuery message {:?}", other);
                }
            }
        }

        deliver(notifications);

        if reconnect_to_redirect {
            if let Err(e) = self.start_open(false) {
                log::warn!("Could not reconnect after redirect: {}", e);
            }
        }
    }

    /// Re-sends every pending subscription. Called right after a handshake.
    fn replay_locked(&self, state: &ClientState, session_token: Option<String>) {
        for (request_id, record) in state.registry.pending() {
            let message = SubscribeMessage::new(
                ClientOperation::Subscribe,
                request_id,
                &record.query,
                session_token.clone(),
            );
            if let Err(e) = self.send_locked(state, &message) {
                log::warn!("Could not replay subscription {}: {}", request_id, e);
            }
        }
    }

    fn schedule_reconnect(&self, state: &mut ClientState, attempts: usize) {
        let delay = self.config.reconnect_interval(attempts);
        log::debug!(
            "LiveQuery reconnect attempt {} of {} in {:?}",
            attempts,
            self.config.max_connection_attempts,
            delay
        );
        let this = self.this.clone();
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                log::warn!("No Tokio runtime to schedule a LiveQuery reconnect");
                return;
            }
        };
        state.cancel_reconnect();
        state.reconnect_task = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = this.upgrade() else {
                return;
            };
            {
                let mut state = lock(&inner.state);
                state.reconnect_task = None;
                if state.flags.is_disconnected_by_user() || state.handle.is_some() {
                    return;
                }
            }
            if let Err(e) = inner.start_open(false) {
                log::warn!("LiveQuery reconnect failed: {}", e);
            }
        }));
    }
}

impl LiveQuerySocketDelegate for LiveQueryInner {
    fn on_open(&self, handle: ConnectionHandle) {
        let mut state = lock(&self.state);
        if state.handle != Some(handle) {
            return;
        }
        state.flags.set_socket_established(true);
        state.flags.set_connecting(true);
        if let Err(e) = self.send_connect_locked(&state, handle) {
            log::warn!("Could not send LiveQuery handshake: {}", e);
        }
    }

    fn on_close(&self, handle: ConnectionHandle, code: Option<u16>, reason: Option<String>) {
        let mut notifications = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.handle != Some(handle) {
                return;
            }
            state.handle = None;
            state.flags.set_socket_established(false);
            if let Some(delegate) = state.receive_delegate.clone() {
                notifications.push(Notification::ClosedSocket(delegate, code, reason));
            }
            state.resolve_waiters(Err(ParseError::ConnectionFailed(
                "LiveQuery socket closed before the handshake completed".to_string(),
            )));

            if !state.flags.is_disconnected_by_user() {
                let attempts = state.flags.attempts() + 1;
                if state
                    .flags
                    .set_attempts(attempts, self.config.max_connection_attempts)
                {
                    log::warn!(
                        "LiveQuery giving up after {} reconnect attempts",
                        self.config.max_connection_attempts
                    );
                    if let Some(delegate) = state.receive_delegate.clone() {
                        notifications.push(Notification::Error(
                            delegate,
                            ParseError::MaxConnectionAttempts(self.config.max_connection_attempts),
                        ));
                    }
                } else {
                    self.schedule_reconnect(&mut state, attempts);
                }
            }
        }
        deliver(notifications);
    }

    fn on_error(&self, handle: ConnectionHandle, error: ParseError) {
        let mut notifications = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.handle != Some(handle) {
                return;
            }
            state.resolve_waiters(Err(error.clone()));
            if let Some(delegate) = state.receive_delegate.clone() {
                notifications.push(Notification::Error(delegate, error));
            }
        }
        deliver(notifications);
    }

    fn on_message(&self, handle: ConnectionHandle, text: String) {
        if lock(&self.state).handle != Some(handle) {
            log::debug!("Ignoring frame from stale connection {}", handle);
            return;
        }
        self.received(&text);
    }

    fn on_cancelled(&self, handle: ConnectionHandle) {
        let owns_handle = lock(&self.state).handle == Some(handle);
        if owns_handle {
            self.close_by_user();
        }
    }
}

impl Drop for LiveQueryInner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.cancel_reconnect();
        if let Some(handle) = state.handle.take() {
            self.socket.close(handle);
        }
    }
}
