//! Configuration for signaling links and sessions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::transport::{TcpTransportFactory, TransportFactory};

/// First reconnect delay after a relay connection drops.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Reconnect delay ceiling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);
/// Keepalive ping period; a missing pong after one more period reconnects.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Relay used when a session names none (the bundled `peer-relay`).
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:4444";
/// How long a peer link may stay unconnected before it is dropped.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timings for a [`SignalingLink`](crate::signaling::SignalingLink).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub ping_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// Options for [`CollabHub::open`](crate::session::CollabHub::open).
#[derive(Clone)]
pub struct SessionOptions {
    /// Relays to announce on. Duplicates share one link.
    pub signaling_urls: Vec<String>,
    /// Room password. `None` leaves signaling unencrypted.
    pub password: Option<String>,
    /// How peer links are established.
    pub transport: Arc<dyn TransportFactory>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signaling_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signaling_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_transport(mut self, transport: impl TransportFactory + 'static) -> Self {
        self.transport = Arc::new(transport);
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            signaling_urls: vec![DEFAULT_SIGNALING_URL.to_string()],
            password: None,
            transport: Arc::new(TcpTransportFactory::default()),
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("signaling_urls", &self.signaling_urls)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}
