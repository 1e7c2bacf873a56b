// src/live_query/subscription.rs

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::ParseError;
use crate::live_query::lock;
use crate::live_query::messages::EventKind;
use crate::query::ParseQuery;

/// A change pushed by the server for a subscribed query.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    /// An object was updated and now matches the query.
    Entered(T),
    /// An object was updated and no longer matches the query.
    Left(T),
    /// A matching object was created.
    Created(T),
    /// A matching object was updated and still matches.
    Updated(T),
    /// A matching object was deleted.
    Deleted(T),
}

impl<T> Event<T> {
    pub fn new(kind: EventKind, object: T) -> Self {
        match kind {
            EventKind::Enter => Event::Entered(object),
            EventKind::Leave => Event::Left(object),
            EventKind::Create => Event::Created(object),
            EventKind::Update => Event::Updated(object),
            EventKind::Delete => Event::Deleted(object),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Entered(_) => EventKind::Enter,
            Event::Left(_) => EventKind::Leave,
            Event::Created(_) => EventKind::Create,
            Event::Updated(_) => EventKind::Update,
            Event::Deleted(_) => EventKind::Delete,
        }
    }

    pub fn object(&self) -> &T {
        match self {
            Event::Entered(object)
            | Event::Left(object)
            | Event::Created(object)
            | Event::Updated(object)
            | Event::Deleted(object) => object,
        }
    }

    pub fn into_object(self) -> T {
        match self {
            Event::Entered(object)
            | Event::Left(object)
            | Event::Created(object)
            | Event::Updated(object)
            | Event::Deleted(object) => object,
        }
    }

    /// Decodes a raw JSON event into a typed one.
    pub fn decode(event: Event<Value>) -> Result<Self, ParseError>
    where
        T: DeserializeOwned,
    {
        let kind = event.kind();
        let object = serde_json::from_value(event.into_object())
            .map_err(|e| ParseError::JsonDeserializationFailed(e.to_string()))?;
        Ok(Event::new(kind, object))
    }
}

/// Receives everything a LiveQuery client dispatches for one subscription.
///
/// The client calls these methods from its receive loop, never while holding
/// its internal lock, so implementations may call back into the client.
pub trait SubscriptionHandler: Send + Sync + 'static {
    /// The server acknowledged the subscription. `is_new` is `false` only when the
    /// acknowledgment completes an `update` of a subscription that was already active.
    fn on_subscribed(&self, query: &ParseQuery, is_new: bool);

    fn on_unsubscribed(&self, query: &ParseQuery);

    fn on_event(&self, query: &ParseQuery, event: Event<Value>);

    /// A server error tied to this subscription, or an event payload that could not be decoded.
    fn on_error(&self, _query: &ParseQuery, _error: ParseError) {}
}

type SubscribeFn = Arc<dyn Fn(&ParseQuery, bool) + Send + Sync>;
type UnsubscribeFn = Arc<dyn Fn(&ParseQuery) + Send + Sync>;
type EventFn<T> = Arc<dyn Fn(&ParseQuery, Event<T>) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&ParseQuery, ParseError) + Send + Sync>;

/// Closure-based subscription handler.
///
/// ```rust,no_run
/// use parse_livequery::{Event, ParseObject, SubscriptionCallback};
///
/// let callbacks = SubscriptionCallback::<ParseObject>::new()
///     .handle_subscribe(|query, is_new| println!("subscribed to {} (new: {})", query.class_name(), is_new))
///     .handle_event(|_, event| match event {
///         Event::Created(object) => println!("created {:?}", object.get_object_id()),
///         other => println!("{:?}", other.kind()),
///     });
/// ```
pub struct SubscriptionCallback<T> {
    subscribe: Mutex<Option<SubscribeFn>>,
    unsubscribe: Mutex<Option<UnsubscribeFn>>,
    event: Mutex<Option<EventFn<T>>>,
    error: Mutex<Option<ErrorFn>>,
}

impl<T> Default for SubscriptionCallback<T> {
    fn default() -> Self {
        Self {
            subscribe: Mutex::new(None),
            unsubscribe: Mutex::new(None),
            event: Mutex::new(None),
            error: Mutex::new(None),
        }
    }
}

impl<T> std::fmt::Debug for SubscriptionCallback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCallback").finish_non_exhaustive()
    }
}

impl<T: DeserializeOwned + Send + Sync + 'static> SubscriptionCallback<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_subscribe<F>(self, handler: F) -> Self
    where
        F: Fn(&ParseQuery, bool) + Send + Sync + 'static,
    {
        self.set_subscribe_handler(handler);
        self
    }

    pub fn handle_unsubscribe<F>(self, handler: F) -> Self
    where
        F: Fn(&ParseQuery) + Send + Sync + 'static,
    {
        self.set_unsubscribe_handler(handler);
        self
    }

    pub fn handle_event<F>(self, handler: F) -> Self
    where
        F: Fn(&ParseQuery, Event<T>) + Send + Sync + 'static,
    {
        self.set_event_handler(handler);
        self
    }

    pub fn handle_error<F>(self, handler: F) -> Self
    where
        F: Fn(&ParseQuery, ParseError) + Send + Sync + 'static,
    {
        self.set_error_handler(handler);
        self
    }

    /// Replaces the subscribe handler of an already registered subscription.
    pub fn set_subscribe_handler<F>(&self, handler: F)
    where
        F: Fn(&ParseQuery, bool) + Send + Sync + 'static,
    {
        *lock(&self.subscribe) = Some(Arc::new(handler));
    }

    pub fn set_unsubscribe_handler<F>(&self, handler: F)
    where
        F: Fn(&ParseQuery) + Send + Sync + 'static,
    {
        *lock(&self.unsubscribe) = Some(Arc::new(handler));
    }

    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(&ParseQuery, Event<T>) + Send + Sync + 'static,
    {
        *lock(&self.event) = Some(Arc::new(handler));
    }

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&ParseQuery, ParseError) + Send + Sync + 'static,
    {
        *lock(&self.error) = Some(Arc::new(handler));
    }
}

impl<T: DeserializeOwned + Send + Sync + 'static> SubscriptionHandler for SubscriptionCallback<T> {
    fn on_subscribed(&self, query: &ParseQuery, is_new: bool) {
        let handler = lock(&self.subscribe).clone();
        if let Some(handler) = handler {
            handler(query, is_new);
        }
    }

    fn on_unsubscribed(&self, query: &ParseQuery) {
        let handler = lock(&self.unsubscribe).clone();
        if let Some(handler) = handler {
            handler(query);
        }
    }

    fn on_event(&self, query: &ParseQuery, event: Event<Value>) {
        match Event::<T>::decode(event) {
            Ok(event) => {
                let handler = lock(&self.event).clone();
                if let Some(handler) = handler {
                    handler(query, event);
                }
            }
            Err(error) => self.on_error(query, error),
        }
    }

    fn on_error(&self, query: &ParseQuery, error: ParseError) {
        let handler = lock(&self.error).clone();
        match handler {
            Some(handler) => handler(query, error),
            None => log::warn!(
                "Unhandled LiveQuery error for class {}: {}",
                query.class_name(),
                error
            ),
        }
    }
}

/// Property-style subscription: the latest acknowledgment, event and error are kept
/// and can be read at any time or observed through `watch` receivers.
///
/// ```rust,no_run
/// # use parse_livequery::{Parse, ParseLiveQuery, ParseQuery, ParseObject, LiveQueryConfig};
/// # async fn run(live_query: ParseLiveQuery) -> Result<(), parse_livequery::ParseError> {
/// let subscription = live_query.subscribe::<ParseObject>(&ParseQuery::new("GameScore"))?;
/// let mut events = subscription.watch_event();
/// while events.changed().await.is_ok() {
///     if let Some((_, event)) = events.borrow().clone() {
///         println!("{:?}", event);
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Subscription<T> {
    subscribed: watch::Sender<Option<(ParseQuery, bool)>>,
    unsubscribed: watch::Sender<Option<ParseQuery>>,
    event: watch::Sender<Option<(ParseQuery, Event<T>)>>,
    error: watch::Sender<Option<ParseError>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for Subscription<T> {
    fn default() -> Self {
        Self {
            subscribed: watch::Sender::new(None),
            unsubscribed: watch::Sender::new(None),
            event: watch::Sender::new(None),
            error: watch::Sender::new(None),
            _marker: PhantomData,
        }
    }
}

impl<T: Clone> Subscription<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest subscribe acknowledgment and its `is_new` flag.
    pub fn subscribed(&self) -> Option<(ParseQuery, bool)> {
        self.subscribed.borrow().clone()
    }

    /// The query, once the server confirmed the unsubscription.
    pub fn unsubscribed(&self) -> Option<ParseQuery> {
        self.unsubscribed.borrow().clone()
    }

    /// The latest event.
    pub fn event(&self) -> Option<(ParseQuery, Event<T>)> {
        self.event.borrow().clone()
    }

    /// The latest server or decode error.
    pub fn error(&self) -> Option<ParseError> {
        self.error.borrow().clone()
    }

    pub fn watch_subscribed(&self) -> watch::Receiver<Option<(ParseQuery, bool)>> {
        self.subscribed.subscribe()
    }

    pub fn watch_unsubscribed(&self) -> watch::Receiver<Option<ParseQuery>> {
        self.unsubscribed.subscribe()
    }

    pub fn watch_event(&self) -> watch::Receiver<Option<(ParseQuery, Event<T>)>> {
        self.event.subscribe()
    }

    pub fn watch_error(&self) -> watch::Receiver<Option<ParseError>> {
        self.error.subscribe()
    }
}

impl<T> SubscriptionHandler for Subscription<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn on_subscribed(&self, query: &ParseQuery, is_new: bool) {
        self.subscribed.send_replace(Some((query.clone(), is_new)));
    }

    fn on_unsubscribed(&self, query: &ParseQuery) {
        self.unsubscribed.send_replace(Some(query.clone()));
    }

    fn on_event(&self, query: &ParseQuery, event: Event<Value>) {
        match Event::<T>::decode(event) {
            Ok(event) => {
                self.event.send_replace(Some((query.clone(), event)));
            }
            Err(error) => self.on_error(query, error),
        }
    }

    fn on_error(&self, _query: &ParseQuery, error: ParseError) {
        self.error.send_replace(Some(error));
    }
}
