//! Client for Comet-style long-lived HTTP push channels.
//!
//! One streaming request per logical channel: the server pushes
//! newline-delimited JSON frames over the open response body, and the client
//! keeps the connection alive across failures, renewing short-lived tokens
//! and re-deriving the request URL from session state.
//!
//! The crate is organized by concern:
//! - `client`: connection state machine, read loop, and reconnect handling.
//! - `proto`: wire frames shared with the push server.
//! - `dispatch`: routing of parsed frames to application callbacks.
//! - `retry`: backoff schedule and failure classification.
//! - `channel`, `config`, `callback`: session identity, connection settings,
//!   and the application-facing callback contracts.

/// Application-facing callback contracts.
pub mod callback;
/// Channel session identity and the allocation contract.
pub mod channel;
/// Connection state machine and lifecycle API.
pub mod client;
/// Connection settings and request URL construction.
pub mod config;
/// Frame-to-callback routing.
pub mod dispatch;
/// Wire protocol frames and line framing.
pub mod proto;
/// Reconnect backoff schedule and failure classification.
pub mod retry;
