// src/client.rs

use std::sync::Arc;

use url::Url;

use crate::error::ParseError;
use crate::live_query::{LiveQueryConfig, ParseLiveQuery};
use crate::storage::{self, InMemoryStorage, ParseStorage, SESSION_TOKEN_KEY};

/// Connection details and credentials for a Parse Server instance.
///
/// `Parse` holds the server URL, the Application ID and the keys the LiveQuery
/// handshake sends, together with the [`ParseStorage`] backend that remembers
/// the current installation id and session token. It is cheap to clone; clones
/// share the same storage.
///
/// # Initialization
///
/// ```rust,no_run
/// use parse_livequery::Parse;
/// # use parse_livequery::ParseError;
///
/// # fn main() -> Result<(), ParseError> {
/// let server_url = "http://localhost:1338/parse";
/// let app_id = "myAppId";
///
/// let client = Parse::new(server_url, app_id, Some("myClientKey"), None)?;
///
/// // LiveQuery connects to ws://localhost:1338/parse
/// assert_eq!(client.live_query_url()?.scheme(), "ws");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Parse {
    pub server_url: String,
    pub(crate) app_id: String,
    pub(crate) client_key: Option<String>,
    pub(crate) master_key: Option<String>,
    pub(crate) live_query_server_url: Option<Url>,
    pub(crate) storage: Arc<dyn ParseStorage>,
}

impl Parse {
    /// Creates a new `Parse` instance backed by [`InMemoryStorage`].
    ///
    /// # Arguments
    ///
    /// * `server_url`: The base URL of your Parse Server (e.g., `"http://localhost:1338/parse"`).
    ///   A missing scheme defaults to `http://`; a trailing slash is removed.
    /// * `app_id`: Your Parse Application ID. Sent in the LiveQuery `connect` handshake.
    /// * `client_key`: Optional. Your Parse client (JavaScript) key.
    /// * `master_key`: Optional. Your Parse Master Key. When present it is sent with the
    ///   `connect` handshake, so events bypass ACLs. Use with caution.
    ///
    /// # Returns
    ///
    /// A `Result` containing the new `Parse` instance, or a `ParseError` if the URL is invalid.
    pub fn new(
        server_url: &str,
        app_id: &str,
        client_key: Option<&str>,
        master_key: Option<&str>,
    ) -> Result<Self, ParseError> {
        Self::with_storage(
            server_url,
            app_id,
            client_key,
            master_key,
            Arc::new(InMemoryStorage::new()),
        )
    }

    /// Same as [`Parse::new`], persisting identifiers in the given storage.
    pub fn with_storage(
        server_url: &str,
        app_id: &str,
        client_key: Option<&str>,
        master_key: Option<&str>,
        storage: Arc<dyn ParseStorage>,
    ) -> Result<Self, ParseError> {
        if app_id.is_empty() {
            return Err(ParseError::InvalidInput(
                "app_id cannot be empty".to_string(),
            ));
        }

        let mut temp_url_string = server_url.to_string();

        // Ensure scheme is present
        if !temp_url_string.contains("://") {
            temp_url_string = format!("http://{}", temp_url_string);
        }

        let parsed_server_url = Url::parse(&temp_url_string)?;

        if parsed_server_url.cannot_be_a_base() {
            return Err(ParseError::SdkError(format!(
                "The server_url '{}' resolved to '{}', which cannot be a base URL. Please provide a full base URL (e.g., http://localhost:1337/parse).",
                server_url, parsed_server_url
            )));
        }

        let final_server_url = parsed_server_url.as_str().trim_end_matches('/').to_string();

        // The installation id must exist before any LiveQuery client reads it.
        let installation_id = storage::ensure_installation_id(storage.as_ref());

        log::debug!(
            "Parse initialized with server_url: {} (installation {})",
            final_server_url,
            installation_id
        );

        Ok(Self {
            server_url: final_server_url,
            app_id: app_id.to_string(),
            client_key: client_key.map(|s| s.to_string()),
            master_key: master_key.map(|s| s.to_string()),
            live_query_server_url: None,
            storage,
        })
    }

    /// Uses an explicit LiveQuery server URL instead of deriving one from `server_url`.
    ///
    /// The scheme is normalized the same way as a derived URL (`https` becomes `wss`,
    /// `http` becomes `ws`).
    pub fn with_live_query_url(mut self, live_query_url: &str) -> Result<Self, ParseError> {
        let parsed = Url::parse(live_query_url)?;
        self.live_query_server_url = Some(to_websocket_url(&parsed)?);
        Ok(self)
    }

    /// The Application ID sent in the LiveQuery handshake.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn client_key(&self) -> Option<&str> {
        self.client_key.as_deref()
    }

    pub fn master_key(&self) -> Option<&str> {
        self.master_key.as_deref()
    }

    /// The URL LiveQuery clients connect to.
    ///
    /// Either the URL set with [`Parse::with_live_query_url`], or `server_url`
    /// with its scheme rewritten: `http`/`ws` → `ws`, `https`/`wss` → `wss`.
    pub fn live_query_url(&self) -> Result<Url, ParseError> {
        if let Some(url) = &self.live_query_server_url {
            return Ok(url.clone());
        }
        let server_url = Url::parse(&self.server_url)?;
        to_websocket_url(&server_url)
    }

    /// The current installation id, read from storage.
    pub fn installation_id(&self) -> String {
        storage::ensure_installation_id(self.storage.as_ref())
    }

    /// Returns the current session token, if one is stored.
    ///
    /// A session token is typically obtained after a user logs in. When present it is
    /// attached to the LiveQuery handshake and to every subscription so the server
    /// evaluates ACLs for that user.
    pub fn session_token(&self) -> Option<String> {
        self.storage.get(SESSION_TOKEN_KEY)
    }

    /// Checks if a session token is currently stored.
    pub fn is_authenticated(&self) -> bool {
        self.session_token().is_some()
    }

    /// Stores or clears the current session token.
    pub fn set_session_token(&self, token: Option<String>) {
        match token {
            Some(token) => self.storage.set(SESSION_TOKEN_KEY, token),
            None => self.storage.remove(SESSION_TOKEN_KEY),
        }
    }

    /// Creates a LiveQuery client for this server using the process-wide socket.
    ///
    /// When `is_default` is true the client also becomes the process default
    /// (see [`ParseLiveQuery::default_client`]).
    pub fn live_query(
        &self,
        config: LiveQueryConfig,
        is_default: bool,
    ) -> Result<ParseLiveQuery, ParseError> {
        let live_query = ParseLiveQuery::new(self.clone(), config)?;
        if is_default {
            ParseLiveQuery::set_default(live_query.clone());
        }
        Ok(live_query)
    }
}

/// Rewrites a REST server URL into its WebSocket counterpart.
pub(crate) fn to_websocket_url(url: &Url) -> Result<Url, ParseError> {
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ParseError::InvalidUrl(format!(
                "Unsupported scheme '{}' for LiveQuery URL {}",
                other, url
            )))
        }
    };
    let mut websocket_url = url.clone();
    websocket_url
        .set_scheme(scheme)
        .map_err(|_| ParseError::InvalidUrl(format!("Cannot use {} as a LiveQuery URL", url)))?;
    Ok(websocket_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_query_url_follows_server_scheme() {
        let parse = Parse::new("https://example.com/parse/", "app", None, None).unwrap();
        assert_eq!(parse.server_url, "https://example.com/parse");
        assert_eq!(
            parse.live_query_url().unwrap().as_str(),
            "wss://example.com/parse"
        );

        let parse = Parse::new("localhost:1338/parse", "app", None, None).unwrap();
        assert_eq!(
            parse.live_query_url().unwrap().as_str(),
            "ws://localhost:1338/parse"
        );

        let parse = parse.with_live_query_url("https://live.example.com").unwrap();
        assert_eq!(parse.live_query_url().unwrap().scheme(), "wss");
        assert_eq!(parse.live_query_url().unwrap().host_str(), Some("live.example.com"));
    }

    #[test]
    fn rejects_unsupported_live_query_schemes() {
        let parse = Parse::new("http://example.com", "app", None, None).unwrap();
        assert!(matches!(
            parse.with_live_query_url("ftp://example.com"),
            Err(ParseError::InvalidUrl(_))
        ));
        assert!(matches!(
            Parse::new("http://example.com", "", None, None),
            Err(ParseError::InvalidInput(_))
        ));
    }

    #[test]
    fn identifiers_live_in_shared_storage() {
        let storage: Arc<dyn ParseStorage> = Arc::new(InMemoryStorage::new());
        let first =
            Parse::with_storage("http://example.com", "app", None, None, storage.clone()).unwrap();
        let installation_id = first.installation_id();
        assert_eq!(installation_id, installation_id.to_lowercase());
        assert_eq!(installation_id.len(), 36);

        let second =
            Parse::with_storage("http://example.com", "app", None, None, storage).unwrap();
        assert_eq!(second.installation_id(), installation_id);

        assert!(!second.is_authenticated());
        first.set_session_token(Some("r:abc".to_string()));
        assert_eq!(second.session_token().as_deref(), Some("r:abc"));
        first.set_session_token(None);
        assert!(!second.is_authenticated());
    }
}
