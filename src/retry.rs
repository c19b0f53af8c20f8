//! Reconnect backoff schedule and transport failure classification.
//!
//! The helpers in this module are transport-agnostic: the policy is a fixed
//! delay table plus an attempt counter, and classification works over any
//! error chain.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Default backoff table: one second, then two, capped at two.
pub const DEFAULT_RECONNECT_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(2),
];

/// Backoff schedule over reconnect attempts.
///
/// Attempts are numbered from 1. The delay before attempt `n` is the table
/// entry at `n - 1`; attempts past the end of the table reuse the last entry,
/// giving a monotone, capped schedule. The counter advances only when an
/// attempt is actually initiated, not when it is scheduled, and resets to
/// zero on a successful connect.
#[derive(Debug)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
    attempts: AtomicU32,
}

impl ReconnectPolicy {
    /// Creates a policy over the given delay table. An empty table falls
    /// back to [`DEFAULT_RECONNECT_DELAYS`].
    pub fn new(delays: Vec<Duration>) -> Self {
        let delays = if delays.is_empty() {
            DEFAULT_RECONNECT_DELAYS.to_vec()
        } else {
            delays
        };
        Self {
            delays,
            attempts: AtomicU32::new(0),
        }
    }

    /// Number of attempts initiated since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Marks one attempt as initiated and returns its 1-based number.
    pub fn begin_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Resets the attempt counter after a successful connect.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Computes the delay to apply before the given attempt.
    ///
    /// `attempt` is 1-based; `0` is treated as the first attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[index]
    }

    /// Delay for the next attempt that would be initiated.
    pub fn next_delay(&self) -> Duration {
        self.delay_for_attempt(self.attempts() + 1)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// What a transport failure means for the reconnect machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureClass {
    /// Locally cancelled, or the socket was already closed by this client.
    /// No reconnection is scheduled.
    Terminal,
    /// Transport-level timeout. Reported distinctly; reconnection proceeds.
    Timeout,
    /// Secure-transport failure mid-stream, typically an underlying network
    /// interface change. Reported distinctly; reconnection proceeds.
    NetworkChanged,
    /// Everything else. Reported; reconnection proceeds.
    Generic,
}

impl FailureClass {
    /// Classifies an arbitrary error by walking its source chain.
    pub fn classify(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(cause) = current {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                let class = Self::from_io_kind(io_err.kind());
                if class != Self::Generic {
                    return class;
                }
            }
            let text = cause.to_string().to_ascii_lowercase();
            if text.contains("tls") || text.contains("certificate") {
                return Self::NetworkChanged;
            }
            if text.contains("canceled") || text.contains("cancelled") {
                return Self::Terminal;
            }
            current = cause.source();
        }
        Self::Generic
    }

    /// Classifies a transport error, honoring reqwest's own timeout flag
    /// before falling back to chain inspection.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        Self::classify(err)
    }

    /// Whether a reconnect attempt should be scheduled for this failure.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Terminal)
    }

    fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::NetworkDown
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable => Self::NetworkChanged,
            io::ErrorKind::NotConnected => Self::Terminal,
            _ => Self::Generic,
        }
    }
}
