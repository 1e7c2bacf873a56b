pub mod client;
pub mod config;
pub mod error;
pub mod live_query;
pub mod object;
pub mod query;
pub mod storage;
pub mod types;

pub use client::Parse;
pub use config::LiveQueryConfig;
pub use error::ParseError;
pub use object::ParseObject;
pub use query::{ParseQuery, QueryIdentity};
pub use storage::{InMemoryStorage, ParseStorage};

pub use live_query::{
    ConnectionHandle, ConnectionState, Event, EventKind, LiveQueryAuthenticationDelegate,
    LiveQuerySocket, LiveQuerySocketDelegate, ParseLiveQuery, ParseLiveQueryDelegate, RequestId,
    Subscription, SubscriptionCallback, SubscriptionHandler,
};

// Re-export key types from the types module if needed directly
pub use types::ParseDate;
