//! Application-facing callback contracts.
//!
//! Two capability sets mirror the protocol split: [`CometCallback`] receives
//! message-level events from the dispatcher, [`ConnectionCallback`] observes
//! connection lifecycle transitions. Implementations must not block for long;
//! they run on the client's read loop.

use crate::proto::{Content, Message};

/// Message-level events. Required for every client.
pub trait CometCallback: Send + Sync {
    /// Called for every successfully parsed frame, regardless of type, before
    /// any type-specific handling.
    fn on_message_arrived(&self, message: &Message);

    /// Called with the decoded payload of a `data` or `broadcast` frame.
    fn on_data_arrived(&self, content: Content);

    /// Called for frames of an unrecognized type.
    fn on_error_message_arrived(&self, message: &Message);

    /// Called when a `data`/`broadcast` payload fails to decode. The
    /// connection itself stays up.
    fn on_format_error(&self, message: &Message);

    /// Called when the server signals an expired token.
    ///
    /// Return the renewed token to resume with a forced reconnect; return
    /// `None` (or an empty string) to stop the client permanently.
    fn on_unauthorized(&self) -> Option<String>;
}

/// Connection lifecycle events. All methods default to no-ops so callers
/// implement only what they observe.
pub trait ConnectionCallback: Send + Sync {
    /// First successful connect after `prepare()`.
    fn on_connect_success(&self) {}

    /// Successful connect on reconnect attempt `attempt` (1-based).
    fn on_reconnect_success(&self, _attempt: u32) {}

    /// Transport failure with no more specific classification.
    fn on_fail(&self, _reason: &str) {}

    /// Transport-level timeout.
    fn on_timeout(&self) {}

    /// Secure-transport error mid-stream, typically an underlying network
    /// interface change.
    fn on_network_changed(&self) {}

    /// Connection lost or torn down by the server.
    fn on_disconnect(&self) {}

    /// Client reached its terminal stopped state.
    fn on_stop(&self) {}

    /// Asked before reconnect attempt `attempt` (1-based) is initiated.
    /// Return `true` to abort reconnection and stop the client.
    fn on_reconnect(&self, _attempt: u32) -> bool {
        false
    }
}
