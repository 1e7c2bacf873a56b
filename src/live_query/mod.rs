// src/live_query/mod.rs

//! Parse LiveQuery: push notifications for query results over a WebSocket.

pub mod client;
pub mod messages;
pub mod registry;
pub mod socket;
pub mod state;
pub mod subscription;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use crate::config::LiveQueryConfig;
pub use client::{ParseLiveQuery, ParseLiveQueryDelegate};
pub use messages::{EventKind, RequestId};
pub use registry::SubscriptionRegistry;
pub use socket::{
    ConnectionHandle, LiveQueryAuthenticationDelegate, LiveQuerySocket, LiveQuerySocketDelegate,
};
pub use state::{ConnectionFlags, ConnectionState};
pub use subscription::{Event, Subscription, SubscriptionCallback, SubscriptionHandler};

// A panicking user callback must not wedge the client.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
