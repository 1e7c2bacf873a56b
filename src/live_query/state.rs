// src/live_query/state.rs

/// Logical connection state of a LiveQuery client, derived from [`ConnectionFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket and no attempt in progress.
    Disconnected,
    /// Waiting for the transport to open a socket.
    Connecting,
    /// Socket open, `connect` handshake sent, waiting for `connected`.
    Authenticating,
    /// Handshake acknowledged; subscriptions are live.
    Connected,
    /// Closed through `close()`, or by a server error that forbids reconnecting.
    UserClosed,
}

/// The connection flags of one client.
///
/// Every mutation goes through a method that restores the invariants before
/// returning:
/// - no socket ⟹ not connected and no client id;
/// - connecting ⟹ not connected;
/// - no client id ⟹ not connected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionFlags {
    is_connecting: bool,
    is_connected: bool,
    is_socket_established: bool,
    is_disconnected_by_user: bool,
    client_id: Option<String>,
    attempts: usize,
}

impl ConnectionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connecting(&self) -> bool {
        self.is_connecting
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn is_socket_established(&self) -> bool {
        self.is_socket_established
    }

    pub fn is_disconnected_by_user(&self) -> bool {
        self.is_disconnected_by_user
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected {
            ConnectionState::Connected
        } else if self.is_socket_established {
            ConnectionState::Authenticating
        } else if self.is_connecting {
            ConnectionState::Connecting
        } else if self.is_disconnected_by_user {
            ConnectionState::UserClosed
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Marks the start or end of a connection attempt.
    pub fn set_connecting(&mut self, connecting: bool) {
        self.is_connecting = connecting;
        if connecting {
            self.is_connected = false;
            self.client_id = None;
        }
    }

    pub fn set_socket_established(&mut self, established: bool) {
        self.is_socket_established = established;
        if !established {
            self.is_connecting = false;
            self.is_connected = false;
            self.client_id = None;
        }
    }

    /// Sets `is_connected`. Returns `false` and leaves the flags untouched when
    /// asked to connect while an attempt is still in progress, without a socket,
    /// or without a client id.
    pub fn set_connected(&mut self, connected: bool) -> bool {
        if connected {
            if self.is_connecting || !self.is_socket_established || self.client_id.is_none() {
                return false;
            }
            self.is_connected = true;
        } else {
            self.is_connected = false;
            self.client_id = None;
        }
        true
    }

    /// Sets or clears the server-assigned client id. Returns `false` when a client
    /// id is offered without a socket.
    pub fn set_client_id(&mut self, client_id: Option<String>) -> bool {
        match client_id {
            Some(id) => {
                if !self.is_socket_established {
                    return false;
                }
                self.client_id = Some(id);
            }
            None => {
                self.client_id = None;
                self.is_connected = false;
            }
        }
        true
    }

    /// Applies a `connected` handshake: records the client id, ends the
    /// connection attempt and resets the attempt counter.
    pub fn complete_handshake(&mut self, client_id: String) -> bool {
        if !self.is_socket_established {
            return false;
        }
        self.is_connecting = false;
        self.client_id = Some(client_id);
        self.is_connected = true;
        self.attempts = 0;
        true
    }

    pub fn set_disconnected_by_user(&mut self, disconnected: bool) {
        self.is_disconnected_by_user = disconnected;
    }

    /// Sets the reconnect attempt counter. Returns `true` when the counter went
    /// past `max_attempts`, in which case the socket flags are cleared and the
    /// caller must close the underlying connection.
    pub fn set_attempts(&mut self, attempts: usize, max_attempts: usize) -> bool {
        self.attempts = attempts;
        if attempts > max_attempts {
            self.set_socket_established(false);
            self.is_connecting = false;
            return true;
        }
        false
    }

    /// Terminal transition requested by the user or by the server.
    pub fn close_by_user(&mut self) {
        self.is_disconnected_by_user = true;
        self.set_socket_established(false);
    }

    #[cfg(test)]
    pub(crate) fn invariants_hold(&self) -> bool {
        (self.is_socket_established || (!self.is_connected && self.client_id.is_none()))
            && !(self.is_connecting && self.is_connected)
            && (self.client_id.is_some() || !self.is_connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn dropping_the_socket_clears_connection() {
        let mut flags = ConnectionFlags::new();
        flags.set_connecting(true);
        flags.set_socket_established(true);
        assert!(flags.complete_handshake("yolo".to_string()));
        assert_eq!(flags.state(), ConnectionState::Connected);

        flags.set_socket_established(false);
        assert!(!flags.is_connected());
        assert_eq!(flags.client_id(), None);
        assert_eq!(flags.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn cannot_connect_while_connecting() {
        let mut flags = ConnectionFlags::new();
        flags.set_socket_established(true);
        assert!(flags.set_client_id(Some("yolo".to_string())));
        flags.set_connecting(true);
        assert!(!flags.set_connected(true));
        assert!(!flags.is_connected());
        assert!(flags.set_connected(false));
    }

    #[test]
    fn clearing_client_id_disconnects() {
        let mut flags = ConnectionFlags::new();
        flags.set_socket_established(true);
        flags.complete_handshake("yolo".to_string());
        flags.set_client_id(None);
        assert!(!flags.is_connected());
        assert!(flags.is_socket_established());
    }

    #[test]
    fn exceeding_attempts_closes_socket() {
        let mut flags = ConnectionFlags::new();
        flags.set_socket_established(true);
        flags.set_connecting(true);
        assert!(!flags.set_attempts(3, 3));
        assert!(flags.set_attempts(4, 3));
        assert!(!flags.is_socket_established());
        assert!(!flags.is_connecting());
        assert!(!flags.is_connected());
    }

    #[test]
    fn handshake_resets_attempts() {
        let mut flags = ConnectionFlags::new();
        flags.set_attempts(5, 20);
        flags.set_socket_established(true);
        flags.complete_handshake("yolo".to_string());
        assert_eq!(flags.attempts(), 0);
    }

    #[test]
    fn close_by_user_is_terminal_state() {
        let mut flags = ConnectionFlags::new();
        flags.set_socket_established(true);
        flags.complete_handshake("yolo".to_string());
        flags.close_by_user();
        assert_eq!(flags.state(), ConnectionState::UserClosed);
        assert!(flags.invariants_hold());
    }

    #[test]
    fn invariants_hold_for_random_mutation_sequences() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let mut flags = ConnectionFlags::new();
            for _ in 0..100 {
                match rng.gen_range(0..9) {
                    0 => flags.set_connecting(rng.gen()),
                    1 => flags.set_socket_established(rng.gen()),
                    2 => {
                        flags.set_connected(rng.gen());
                    }
                    3 => {
                        let id = rng.gen::<bool>().then(|| "client".to_string());
                        flags.set_client_id(id);
                    }
                    4 => {
                        flags.complete_handshake("client".to_string());
                    }
                    5 => flags.set_disconnected_by_user(rng.gen()),
                    6 => {
                        flags.set_attempts(rng.gen_range(0..6), 4);
                    }
                    7 => flags.close_by_user(),
                    _ => {
                        flags.set_connected(true);
                    }
                }
                assert!(flags.invariants_hold(), "{:?}", flags);
            }
        }
    }
}
