//! Connection state machine and lifecycle API.
//!
//! [`CometClient`] owns one long-lived streaming request per channel and
//! keeps it alive: transparently reconnecting with backoff, renewing expired
//! tokens, and re-deriving the request URL from session state. A background
//! worker owns the transport and the read loop; lifecycle calls from the
//! application are serialized against it through the shared state mutex.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::callback::ConnectionCallback;
use crate::channel::Channel;
use crate::config::{build_request_url, CometConfig};
use crate::dispatch::{Dispatch, MessageDispatcher};
use crate::proto::{LineBuffer, Message};
use crate::retry::{FailureClass, ReconnectPolicy};

/// Lifecycle states of one client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Freshly constructed, not yet prepared.
    New,
    /// Session and URL are built; a connect may start.
    Ready,
    /// Transport is open, response not yet streaming.
    Connected,
    /// Consuming frames from the response body.
    Streaming,
    /// Connection lost or torn down by the server.
    Disconnected,
    /// A reconnect attempt is scheduled or running.
    Reconnecting,
    /// Stop requested, teardown in progress.
    StopPending,
    /// Terminal. No further transitions.
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Ready => "ready",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::StopPending => "stop_pending",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Errors produced by transport acquisition and frame handling.
///
/// Nothing here escapes the client; failures surface through the
/// [`ConnectionCallback`] reasons.
#[derive(Debug, Error)]
pub enum CometError {
    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("http status {0}")]
    HttpStatus(StatusCode),

    /// An outer frame failed to decode.
    #[error("frame decode error: {0}")]
    Frame(#[from] serde_json::Error),

    /// The channel carries no credential.
    #[error("channel token is empty")]
    EmptyToken,
}

/// What the read loop decided should happen next.
enum AttemptOutcome {
    /// Schedule a reconnect, optionally skipping the backoff delay.
    Reconnect { immediate: bool },
    /// Stop permanently, optionally firing the stop callback.
    Stop { notify: bool },
    /// End the worker without any follow-up.
    Abandon,
}

/// Per-line verdict inside the read loop.
enum LineStep {
    Continue,
    End(AttemptOutcome),
}

/// Client for one Comet-style push channel.
///
/// Each client is an independently lifetimed state machine; create one per
/// channel. Clones share the same underlying connection.
///
/// `connect()` and the reconnect path spawn onto the ambient Tokio runtime,
/// so both must be called from within one.
#[derive(Clone)]
pub struct CometClient {
    inner: Arc<Inner>,
}

impl CometClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ConnectionState::New),
                conf: Mutex::new(None),
                channel: Mutex::new(None),
                url: Mutex::new(String::new()),
                http: Mutex::new(None),
                policy: OnceLock::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Builds or reuses the channel session and computes the request URL.
    ///
    /// A fresh channel is allocated only when no reconnect attempt is
    /// pending; otherwise the existing session is kept so the cursor and any
    /// renewed token survive.
    pub fn prepare(&self, conf: CometConfig) {
        info!(event = "prepare", conf = ?conf);
        *lock(&self.inner.conf) = Some(conf);
        self.inner.prepare_from_stored();
    }

    /// Opens the streaming transport and starts consuming frames.
    ///
    /// Requires state [`ConnectionState::Ready`]; ignored otherwise. The call
    /// returns immediately; results arrive through the callbacks.
    pub fn connect(&self) {
        if self.state() != ConnectionState::Ready {
            warn!(event = "connect_ignored", state = %self.state());
            return;
        }

        let mut worker = lock(&self.inner.worker);
        if worker.as_ref().is_some_and(|task| !task.is_finished()) {
            warn!(event = "connect_ignored_active_worker");
            return;
        }
        let inner = Arc::clone(&self.inner);
        *worker = Some(tokio::spawn(async move {
            inner.run_attempt().await;
        }));
    }

    /// Stops the client, cancelling the transport and any pending reconnect.
    ///
    /// This is the only caller-initiated terminal path; it wins any race
    /// against an in-flight reconnect. The stop callback fires iff
    /// `call_on_stop` is true.
    pub fn stop(&self, call_on_stop: bool) {
        info!(event = "stop_requested");
        self.inner.set_state(ConnectionState::StopPending);
        if let Some(task) = lock(&self.inner.worker).take() {
            task.abort();
        }
        self.inner.finish_stop(call_on_stop);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }
}

impl Default for CometClient {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    state: Mutex<ConnectionState>,
    conf: Mutex<Option<CometConfig>>,
    channel: Mutex<Option<Channel>>,
    url: Mutex<String>,
    http: Mutex<Option<reqwest::Client>>,
    policy: OnceLock<ReconnectPolicy>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Sets the state, returning whether it changed. Unchanged writes are
    /// no-ops so idempotent transitions stay silent.
    fn set_state(&self, to: ConnectionState) -> bool {
        let mut state = lock(&self.state);
        if *state == to {
            return false;
        }
        debug!(event = "state", from = %*state, to = %to);
        *state = to;
        true
    }

    fn stop_requested(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::StopPending | ConnectionState::Stopped
        )
    }

    fn connection_callback(&self) -> Option<Arc<dyn ConnectionCallback>> {
        lock(&self.conf)
            .as_ref()
            .and_then(|conf| conf.connection_callback.clone())
    }

    fn prepare_from_stored(&self) -> bool {
        let Some(conf) = lock(&self.conf).clone() else {
            warn!(event = "prepare_without_config");
            return false;
        };

        let policy = self
            .policy
            .get_or_init(|| ReconnectPolicy::new(conf.reconnect_delays.clone()));
        if policy.attempts() == 0 {
            *lock(&self.channel) = Some(conf.channel_allocator.allocate());
        }
        self.rebuild_url(&conf);
        self.set_state(ConnectionState::Ready);
        true
    }

    fn rebuild_url(&self, conf: &CometConfig) {
        if let Some(channel) = lock(&self.channel).as_ref() {
            // The URL embeds the token; it is never logged.
            *lock(&self.url) = build_request_url(conf, channel);
        }
    }

    fn http_client(&self, conf: &CometConfig) -> Result<reqwest::Client, reqwest::Error> {
        let mut cached = lock(&self.http);
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(conf.connect_timeout)
            .read_timeout(conf.read_timeout)
            .build()?;
        *cached = Some(client.clone());
        Ok(client)
    }

    async fn run_attempt(self: Arc<Self>) {
        match self.connect_and_stream().await {
            AttemptOutcome::Reconnect { immediate } => self.schedule_reconnect(immediate),
            AttemptOutcome::Stop { notify } => self.finish_stop(notify),
            AttemptOutcome::Abandon => {}
        }
    }

    /// One transport acquisition plus its read loop.
    async fn connect_and_stream(&self) -> AttemptOutcome {
        let Some(conf) = lock(&self.conf).clone() else {
            return AttemptOutcome::Abandon;
        };

        let token_empty = lock(&self.channel)
            .as_ref()
            .map(Channel::token_is_empty)
            .unwrap_or(true);
        if token_empty {
            // An empty credential must never reach the connected state.
            warn!(event = "connect_refused_empty_token");
            self.report_failure(&conf, FailureClass::Generic, &CometError::EmptyToken.to_string());
            self.mark_disconnected(&conf);
            return AttemptOutcome::Abandon;
        }

        let http = match self.http_client(&conf) {
            Ok(http) => http,
            Err(err) => {
                let reason = CometError::Transport(err).to_string();
                warn!(event = "http_client_build_failed", error = %reason);
                self.report_failure(&conf, FailureClass::Generic, &reason);
                self.mark_disconnected(&conf);
                return AttemptOutcome::Reconnect { immediate: false };
            }
        };

        let url = lock(&self.url).clone();
        debug!(event = "connect", conf = ?conf);
        let response = match http.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                let class = FailureClass::from_reqwest(&err);
                let reason = CometError::Transport(err).to_string();
                warn!(event = "connect_failed", class = ?class, error = %reason);
                self.report_failure(&conf, class, &reason);
                self.mark_disconnected(&conf);
                return if class.is_retryable() {
                    AttemptOutcome::Reconnect { immediate: false }
                } else {
                    AttemptOutcome::Abandon
                };
            }
        };

        self.set_state(ConnectionState::Connected);
        if let Some(callback) = conf.connection_callback.as_ref() {
            match self.policy.get().map(ReconnectPolicy::attempts) {
                Some(attempt) if attempt > 0 => callback.on_reconnect_success(attempt),
                _ => callback.on_connect_success(),
            }
        }
        if let Some(policy) = self.policy.get() {
            policy.reset();
        }

        let status = response.status();
        if !status.is_success() {
            let reason = CometError::HttpStatus(status).to_string();
            warn!(event = "bad_status", status = %status);
            self.report_failure(&conf, FailureClass::Generic, &reason);
            self.mark_disconnected(&conf);
            return AttemptOutcome::Reconnect { immediate: false };
        }

        self.set_state(ConnectionState::Streaming);
        self.stream_frames(&conf, response).await
    }

    async fn stream_frames(&self, conf: &CometConfig, response: reqwest::Response) -> AttemptOutcome {
        let dispatcher = MessageDispatcher::new(Arc::clone(&conf.comet_callback));
        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::new();

        loop {
            if self.stop_requested() {
                return AttemptOutcome::Abandon;
            }

            match stream.next().await {
                Some(Ok(chunk)) => {
                    lines.extend(&chunk);
                    while let Some(line) = lines.next_line() {
                        match self.handle_line(conf, &dispatcher, &line) {
                            LineStep::Continue => {}
                            // Abandon the remaining body on any hard verdict.
                            LineStep::End(outcome) => return outcome,
                        }
                    }
                }
                Some(Err(err)) => {
                    if self.stop_requested() {
                        return AttemptOutcome::Abandon;
                    }
                    let class = FailureClass::from_reqwest(&err);
                    let reason = CometError::Transport(err).to_string();
                    warn!(event = "stream_error", class = ?class, error = %reason);
                    self.report_failure(conf, class, &reason);
                    self.mark_disconnected(conf);
                    return if class.is_retryable() {
                        AttemptOutcome::Reconnect { immediate: false }
                    } else {
                        AttemptOutcome::Abandon
                    };
                }
                None => {
                    debug!(event = "stream_end", state = %self.state());
                    if matches!(
                        self.state(),
                        ConnectionState::Connected | ConnectionState::Streaming
                    ) {
                        self.mark_disconnected(conf);
                        return AttemptOutcome::Reconnect { immediate: false };
                    }
                    return AttemptOutcome::Abandon;
                }
            }
        }
    }

    fn handle_line(
        &self,
        conf: &CometConfig,
        dispatcher: &MessageDispatcher,
        line: &str,
    ) -> LineStep {
        if line.is_empty() {
            // A blank line is the server's way of ending the poll quietly.
            debug!(event = "blank_line_stream_end");
            self.mark_disconnected(conf);
            return LineStep::End(AttemptOutcome::Reconnect { immediate: false });
        }

        let message = match Message::from_line(line) {
            Ok(message) => message,
            Err(err) => {
                let reason = CometError::Frame(err).to_string();
                warn!(event = "frame_decode_failed", error = %reason);
                self.report_failure(conf, FailureClass::Generic, &reason);
                self.mark_disconnected(conf);
                return LineStep::End(AttemptOutcome::Reconnect { immediate: false });
            }
        };

        // Dispatch against a session snapshot so callbacks never run under
        // the channel lock; the read loop is the only mid-stream writer.
        let Some(mut session) = lock(&self.channel).clone() else {
            return LineStep::End(AttemptOutcome::Abandon);
        };
        let signal = dispatcher.dispatch(&message, &mut session);
        *lock(&self.channel) = Some(session);

        match signal {
            Dispatch::Continue => LineStep::Continue,
            Dispatch::Reconnect => {
                info!(event = "token_renewed_reconnect");
                self.rebuild_url(conf);
                LineStep::End(AttemptOutcome::Reconnect { immediate: true })
            }
            Dispatch::Stop => LineStep::End(AttemptOutcome::Stop { notify: true }),
        }
    }

    /// Schedules one reconnect attempt on the delay facility.
    ///
    /// At most one retry may be outstanding: entering `Reconnecting` while
    /// already reconnecting is rejected, and a requested stop pre-empts the
    /// timer both before and after it fires.
    fn schedule_reconnect(self: Arc<Self>, immediate: bool) {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Reconnecting => {
                    debug!(event = "reconnect_already_pending");
                    return;
                }
                ConnectionState::StopPending | ConnectionState::Stopped => return,
                _ => {
                    debug!(event = "state", from = %*state, to = %ConnectionState::Reconnecting);
                    *state = ConnectionState::Reconnecting;
                }
            }
        }

        let Some(policy) = self.policy.get() else {
            return;
        };
        let delay = if immediate {
            Duration::ZERO
        } else {
            policy.next_delay()
        };
        debug!(
            event = "reconnect_scheduled",
            attempt = policy.attempts() + 1,
            delay_ms = delay.as_millis() as u64,
        );

        let inner = Arc::clone(&self);
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if inner.stop_requested() {
                debug!(event = "reconnect_pre_empted_by_stop");
                return;
            }
            let Some(policy) = inner.policy.get() else {
                return;
            };
            let attempt = policy.begin_attempt();
            let callback = inner.connection_callback();
            if callback.is_some_and(|cb| cb.on_reconnect(attempt)) {
                info!(event = "reconnect_aborted_by_callback", attempt);
                inner.finish_stop(true);
                return;
            }
            if inner.state() != ConnectionState::Ready {
                inner.prepare_from_stored();
            }
            info!(event = "reconnect_start", attempt);
            inner.run_attempt().await;
        });
        *lock(&self.worker) = Some(task);
    }

    /// Transitions into `Disconnected` and notifies, unless the machine has
    /// already moved on to reconnecting or stopping.
    fn mark_disconnected(&self, conf: &CometConfig) {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Disconnected
                | ConnectionState::Reconnecting
                | ConnectionState::StopPending
                | ConnectionState::Stopped => return,
                _ => {
                    debug!(event = "state", from = %*state, to = %ConnectionState::Disconnected);
                    *state = ConnectionState::Disconnected;
                }
            }
        }
        if let Some(callback) = conf.connection_callback.as_ref() {
            callback.on_disconnect();
        }
    }

    fn report_failure(&self, conf: &CometConfig, class: FailureClass, reason: &str) {
        let Some(callback) = conf.connection_callback.as_ref() else {
            return;
        };
        match class {
            FailureClass::Timeout => callback.on_timeout(),
            FailureClass::NetworkChanged => callback.on_network_changed(),
            FailureClass::Generic => callback.on_fail(reason),
            // Locally cancelled teardown is not reported.
            FailureClass::Terminal => {}
        }
    }

    fn finish_stop(&self, notify: bool) {
        self.set_state(ConnectionState::StopPending);
        self.set_state(ConnectionState::Stopped);
        info!(event = "stopped");
        if notify {
            if let Some(callback) = self.connection_callback() {
                callback.on_stop();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use secrecy::SecretString;

    use super::{CometClient, ConnectionState};
    use crate::callback::{CometCallback, ConnectionCallback};
    use crate::channel::{Channel, ChannelAllocator};
    use crate::config::CometConfig;
    use crate::proto::{Content, Message};

    #[derive(Default)]
    struct CountingAllocator {
        calls: AtomicUsize,
    }

    impl ChannelAllocator for CountingAllocator {
        fn allocate(&self) -> Channel {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Channel::with_token("room1", SecretString::new("abc".to_string()), 0)
        }
    }

    struct NullCallback;

    impl CometCallback for NullCallback {
        fn on_message_arrived(&self, _message: &Message) {}
        fn on_data_arrived(&self, _content: Content) {}
        fn on_error_message_arrived(&self, _message: &Message) {}
        fn on_format_error(&self, _message: &Message) {}
        fn on_unauthorized(&self) -> Option<String> {
            None
        }
    }

    #[derive(Default)]
    struct CountingLifecycle {
        stops: AtomicUsize,
        reconnect_checks: AtomicUsize,
    }

    impl ConnectionCallback for CountingLifecycle {
        fn on_stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn on_reconnect(&self, _attempt: u32) -> bool {
            self.reconnect_checks.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn config(
        allocator: Arc<CountingAllocator>,
        lifecycle: Arc<CountingLifecycle>,
    ) -> CometConfig {
        CometConfig::new("127.0.0.1", "sub", allocator, Arc::new(NullCallback))
            .with_port(9)
            .with_connection_callback(lifecycle)
    }

    #[test]
    fn initial_state_is_new() {
        assert_eq!(CometClient::new().state(), ConnectionState::New);
    }

    #[test]
    fn prepare_allocates_channel_and_reaches_ready() {
        let allocator = Arc::new(CountingAllocator::default());
        let lifecycle = Arc::new(CountingLifecycle::default());
        let client = CometClient::new();

        client.prepare(config(allocator.clone(), lifecycle));

        assert_eq!(client.state(), ConnectionState::Ready);
        assert_eq!(allocator.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connect_outside_ready_is_ignored() {
        let client = CometClient::new();
        client.connect();
        assert_eq!(client.state(), ConnectionState::New);
    }

    #[test]
    fn stop_reaches_stopped_and_fires_callback_when_asked() {
        let allocator = Arc::new(CountingAllocator::default());
        let lifecycle = Arc::new(CountingLifecycle::default());
        let client = CometClient::new();
        client.prepare(config(allocator, lifecycle.clone()));

        client.stop(true);

        assert_eq!(client.state(), ConnectionState::Stopped);
        assert_eq!(lifecycle.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn silent_stop_skips_the_callback() {
        let allocator = Arc::new(CountingAllocator::default());
        let lifecycle = Arc::new(CountingLifecycle::default());
        let client = CometClient::new();
        client.prepare(config(allocator, lifecycle.clone()));

        client.stop(false);

        assert_eq!(client.state(), ConnectionState::Stopped);
        assert_eq!(lifecycle.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_cancels_a_pending_reconnect_timer() {
        let allocator = Arc::new(CountingAllocator::default());
        let lifecycle = Arc::new(CountingLifecycle::default());
        let conf = config(allocator, lifecycle.clone())
            .with_reconnect_delays(vec![Duration::from_millis(50)]);

        let client = CometClient::new();
        client.prepare(conf);
        client.inner.set_state(ConnectionState::Disconnected);
        Arc::clone(&client.inner).schedule_reconnect(false);
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        client.stop(false);
        assert_eq!(client.state(), ConnectionState::Stopped);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            lifecycle.reconnect_checks.load(Ordering::SeqCst),
            0,
            "cancelled timer must never initiate an attempt"
        );
    }

    #[tokio::test]
    async fn second_reconnect_request_does_not_schedule_again() {
        let allocator = Arc::new(CountingAllocator::default());
        let lifecycle = Arc::new(CountingLifecycle::default());
        let conf = config(allocator, lifecycle.clone())
            .with_reconnect_delays(vec![Duration::from_secs(30)]);

        let client = CometClient::new();
        client.prepare(conf);
        client.inner.set_state(ConnectionState::Disconnected);
        Arc::clone(&client.inner).schedule_reconnect(false);
        Arc::clone(&client.inner).schedule_reconnect(false);

        assert_eq!(client.state(), ConnectionState::Reconnecting);
        client.stop(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lifecycle.reconnect_checks.load(Ordering::SeqCst), 0);
    }
}
