//! Channel subscription identity and the allocation contract.

use secrecy::{ExposeSecret, SecretString};

/// Identity triple for one push subscription.
///
/// A channel is identified by `name`, authenticated by `token`, and positioned
/// by `cursor`. The token is issued and renewed server-side; the cursor is the
/// last consumed message sequence position. A cursor of `0` skips history,
/// any positive value asks the server to replay its retained backlog from
/// that position onward.
#[derive(Clone, Debug)]
pub struct Channel {
    /// Subscription channel name.
    pub name: String,
    /// Opaque credential, never logged in clear text.
    pub token: SecretString,
    /// Message sequence position.
    pub cursor: u64,
}

impl Channel {
    /// Creates a channel with an empty token and no replay position.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_token(name, SecretString::new(String::new()), 0)
    }

    /// Creates a fully specified channel.
    pub fn with_token(name: impl Into<String>, token: SecretString, cursor: u64) -> Self {
        Self {
            name: name.into(),
            token,
            cursor,
        }
    }

    /// True when the channel carries no credential.
    ///
    /// A channel with an empty token must never reach the connected state;
    /// the client refuses to open a transport for it.
    pub fn token_is_empty(&self) -> bool {
        self.token.expose_secret().is_empty()
    }
}

/// Source of fresh [`Channel`] instances.
///
/// Consulted once per client lifetime, on the first `prepare()`. Reconnects
/// reuse the existing channel so the cursor and any renewed token survive.
/// How names and initial tokens are obtained is the application's business.
pub trait ChannelAllocator: Send + Sync {
    /// Returns a fresh channel session.
    fn allocate(&self) -> Channel;
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::Channel;

    #[test]
    fn new_channel_has_empty_token_and_zero_cursor() {
        let channel = Channel::new("room1");
        assert_eq!(channel.name, "room1");
        assert_eq!(channel.cursor, 0);
        assert!(channel.token_is_empty());
    }

    #[test]
    fn channel_with_token_is_not_empty() {
        let channel = Channel::with_token("room1", SecretString::new("abc".to_string()), 3);
        assert_eq!(channel.cursor, 3);
        assert!(!channel.token_is_empty());
    }

    #[test]
    fn debug_output_redacts_token() {
        let channel = Channel::with_token("room1", SecretString::new("abc".to_string()), 0);
        let rendered = format!("{channel:?}");
        assert!(!rendered.contains("abc"), "token leaked: {rendered}");
    }
}
