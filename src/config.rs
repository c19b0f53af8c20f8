//! Connection settings and request URL construction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;

use crate::callback::{CometCallback, ConnectionCallback};
use crate::channel::{Channel, ChannelAllocator};
use crate::retry::DEFAULT_RECONNECT_DELAYS;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(40);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Immutable connection settings, fixed per `prepare()` call.
///
/// Collaborators are shared trait objects: the allocator supplies the channel
/// session, the two callback sets receive message and lifecycle events. The
/// message callback is mandatory; the lifecycle callback is optional.
#[derive(Clone)]
pub struct CometConfig {
    /// Server host, optionally already carrying a scheme prefix.
    pub host: String,
    /// Server port. Omitted from the URL when unset or a scheme default.
    pub port: Option<u16>,
    /// Request path below the host, without a leading slash.
    pub path: String,
    /// Selects `https` when the host carries no scheme of its own.
    pub enable_ssl: bool,
    /// Transport connect timeout.
    pub connect_timeout: Duration,
    /// Transport read timeout between stream chunks.
    pub read_timeout: Duration,
    /// Transport write timeout. The streaming GET writes nothing after the
    /// request head, so this only matters for transports that enforce it.
    pub write_timeout: Duration,
    /// Backoff schedule, indexed by reconnect attempt.
    pub reconnect_delays: Vec<Duration>,
    /// Supplies the channel session on first prepare.
    pub channel_allocator: Arc<dyn ChannelAllocator>,
    /// Receives message-level events.
    pub comet_callback: Arc<dyn CometCallback>,
    /// Receives lifecycle events, when the application cares.
    pub connection_callback: Option<Arc<dyn ConnectionCallback>>,
}

impl CometConfig {
    /// Creates a config with the default timeouts and backoff schedule.
    pub fn new(
        host: impl Into<String>,
        path: impl Into<String>,
        channel_allocator: Arc<dyn ChannelAllocator>,
        comet_callback: Arc<dyn CometCallback>,
    ) -> Self {
        Self {
            host: host.into(),
            port: None,
            path: path.into(),
            enable_ssl: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            reconnect_delays: DEFAULT_RECONNECT_DELAYS.to_vec(),
            channel_allocator,
            comet_callback,
            connection_callback: None,
        }
    }

    /// Sets an explicit port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enables or disables TLS.
    pub fn with_ssl(mut self, enable: bool) -> Self {
        self.enable_ssl = enable;
        self
    }

    /// Overrides the transport timeouts.
    pub fn with_timeouts(mut self, connect: Duration, read: Duration, write: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Overrides the backoff schedule. An empty table falls back to the
    /// default schedule.
    pub fn with_reconnect_delays(mut self, delays: Vec<Duration>) -> Self {
        self.reconnect_delays = delays;
        self
    }

    /// Registers a lifecycle callback.
    pub fn with_connection_callback(mut self, callback: Arc<dyn ConnectionCallback>) -> Self {
        self.connection_callback = Some(callback);
        self
    }
}

impl fmt::Debug for CometConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CometConfig[{}://{}{}/{}]",
            if self.enable_ssl { "https" } else { "http" },
            self.host,
            self.port.map(|p| format!(":{p}")).unwrap_or_default(),
            self.path,
        )
    }
}

/// Builds the fully qualified request URL for one connect attempt.
///
/// The scheme is derived from the TLS flag unless `host` already carries one.
/// The port segment is skipped for the scheme defaults 80/443. Channel name,
/// cursor, and token travel as query parameters.
pub fn build_request_url(conf: &CometConfig, channel: &Channel) -> String {
    let mut url = String::new();
    if !conf.host.starts_with("http") {
        url.push_str(if conf.enable_ssl { "https://" } else { "http://" });
    }
    url.push_str(&conf.host);
    if let Some(port) = conf.port {
        if port != 80 && port != 443 {
            url.push(':');
            url.push_str(&port.to_string());
        }
    }
    if !conf.path.is_empty() {
        url.push('/');
        url.push_str(&conf.path);
    }
    url.push_str(&format!(
        "?cname={}&seq={}&token={}",
        channel.name,
        channel.cursor,
        channel.token.expose_secret(),
    ));
    url
}
