//! Routing of parsed frames to application callbacks.
//!
//! The dispatcher owns the message-level callback set and tells the
//! connection machine what to do next via an explicit [`Dispatch`] signal;
//! per-message failures never escalate past it.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, warn};

use crate::callback::CometCallback;
use crate::channel::Channel;
use crate::proto::{Content, Message, MessageType};

/// Control signal returned by [`MessageDispatcher::dispatch`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dispatch {
    /// Keep consuming the stream.
    Continue,
    /// Token was renewed; rebuild the request URL and reconnect immediately.
    Reconnect,
    /// Token renewal yielded no credential; stop the client permanently.
    Stop,
}

/// Routes one frame at a time to the application.
///
/// Every frame first hits the generic message callback, then branches on its
/// type. Only `401` handling may touch the channel's identity fields; data
/// frames advance the cursor and nothing else.
pub struct MessageDispatcher {
    callback: Arc<dyn CometCallback>,
}

impl MessageDispatcher {
    pub fn new(callback: Arc<dyn CometCallback>) -> Self {
        Self { callback }
    }

    /// Dispatches one frame, mutating `session` where the protocol says so.
    pub fn dispatch(&self, message: &Message, session: &mut Channel) -> Dispatch {
        debug!(event = "frame", kind = ?message.kind, seq = %message.seq);
        self.callback.on_message_arrived(message);

        match message.kind {
            MessageType::Data | MessageType::Broadcast => {
                self.handle_payload(message, session);
                Dispatch::Continue
            }
            // Heartbeat and initial-sync marker need no handling.
            MessageType::Noop | MessageType::NextSeq => Dispatch::Continue,
            MessageType::Unauthorized => self.handle_unauthorized(session),
            MessageType::ChannelOverflow | MessageType::Unknown => {
                self.callback.on_error_message_arrived(message);
                Dispatch::Continue
            }
        }
    }

    fn handle_payload(&self, message: &Message, session: &mut Channel) {
        if let Ok(seq) = message.seq.parse::<u64>() {
            session.cursor = seq;
        }

        match message.content.as_deref().map(Content::from_payload) {
            Some(Ok(content)) => self.callback.on_data_arrived(content),
            Some(Err(err)) => {
                warn!(event = "content_decode_failed", error = %err);
                self.callback.on_format_error(message);
            }
            None => {
                warn!(event = "content_missing", seq = %message.seq);
                self.callback.on_format_error(message);
            }
        }
    }

    fn handle_unauthorized(&self, session: &mut Channel) -> Dispatch {
        warn!(event = "token_expired");
        match self.callback.on_unauthorized() {
            Some(token) if !token.is_empty() => {
                session.token = SecretString::new(token);
                Dispatch::Reconnect
            }
            _ => {
                warn!(event = "token_renewal_empty");
                Dispatch::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use secrecy::{ExposeSecret, SecretString};

    use super::{Dispatch, MessageDispatcher};
    use crate::callback::CometCallback;
    use crate::channel::Channel;
    use crate::proto::{Content, Message, MessageType};

    #[derive(Default)]
    struct Recording {
        messages: Mutex<Vec<Message>>,
        data: Mutex<Vec<Content>>,
        errors: Mutex<Vec<Message>>,
        format_errors: Mutex<Vec<Message>>,
        unauthorized_calls: AtomicUsize,
        renewal: Mutex<Option<String>>,
    }

    impl Recording {
        fn with_renewal(token: &str) -> Self {
            Self {
                renewal: Mutex::new(Some(token.to_string())),
                ..Self::default()
            }
        }
    }

    impl CometCallback for Recording {
        fn on_message_arrived(&self, message: &Message) {
            self.messages.lock().unwrap().push(message.clone());
        }

        fn on_data_arrived(&self, content: Content) {
            self.data.lock().unwrap().push(content);
        }

        fn on_error_message_arrived(&self, message: &Message) {
            self.errors.lock().unwrap().push(message.clone());
        }

        fn on_format_error(&self, message: &Message) {
            self.format_errors.lock().unwrap().push(message.clone());
        }

        fn on_unauthorized(&self) -> Option<String> {
            self.unauthorized_calls.fetch_add(1, Ordering::SeqCst);
            self.renewal.lock().unwrap().clone()
        }
    }

    fn frame(kind: MessageType, seq: &str, content: Option<&str>) -> Message {
        Message {
            kind,
            cname: "room1".to_string(),
            seq: seq.to_string(),
            content: content.map(str::to_string),
        }
    }

    fn session() -> Channel {
        Channel::with_token("room1", SecretString::new("abc".to_string()), 0)
    }

    #[test]
    fn data_frame_advances_cursor_and_delivers_content() {
        let callback = Arc::new(Recording::default());
        let dispatcher = MessageDispatcher::new(callback.clone());
        let mut session = session();

        let message = frame(
            MessageType::Data,
            "7",
            Some(r#"{"id":"1","type":2,"body":{}}"#),
        );
        assert_eq!(dispatcher.dispatch(&message, &mut session), Dispatch::Continue);

        assert_eq!(session.cursor, 7);
        assert_eq!(callback.messages.lock().unwrap().len(), 1);
        let data = callback.data.lock().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].id, "1");
        assert!(callback.errors.lock().unwrap().is_empty());
        assert!(callback.format_errors.lock().unwrap().is_empty());
    }

    #[test]
    fn broadcast_frame_is_handled_like_data() {
        let callback = Arc::new(Recording::default());
        let dispatcher = MessageDispatcher::new(callback.clone());
        let mut session = session();

        let message = frame(
            MessageType::Broadcast,
            "3",
            Some(r#"{"id":"2","type":1,"body":{}}"#),
        );
        dispatcher.dispatch(&message, &mut session);

        assert_eq!(session.cursor, 3);
        assert_eq!(callback.data.lock().unwrap().len(), 1);
    }

    #[test]
    fn bad_payload_reports_format_error_and_continues() {
        let callback = Arc::new(Recording::default());
        let dispatcher = MessageDispatcher::new(callback.clone());
        let mut session = session();

        let message = frame(MessageType::Data, "9", Some("not json"));
        assert_eq!(dispatcher.dispatch(&message, &mut session), Dispatch::Continue);

        assert_eq!(session.cursor, 9);
        assert!(callback.data.lock().unwrap().is_empty());
        assert_eq!(callback.format_errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn missing_payload_reports_format_error() {
        let callback = Arc::new(Recording::default());
        let dispatcher = MessageDispatcher::new(callback.clone());
        let mut session = session();

        dispatcher.dispatch(&frame(MessageType::Data, "4", None), &mut session);
        assert_eq!(callback.format_errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn heartbeats_only_hit_the_generic_callback() {
        let callback = Arc::new(Recording::default());
        let dispatcher = MessageDispatcher::new(callback.clone());
        let mut session = session();

        dispatcher.dispatch(&frame(MessageType::Noop, "", None), &mut session);
        dispatcher.dispatch(&frame(MessageType::NextSeq, "1", None), &mut session);

        assert_eq!(session.cursor, 0);
        assert_eq!(callback.messages.lock().unwrap().len(), 2);
        assert!(callback.data.lock().unwrap().is_empty());
        assert!(callback.errors.lock().unwrap().is_empty());
        assert!(callback.format_errors.lock().unwrap().is_empty());
    }

    #[test]
    fn unrecognized_frames_hit_the_error_callback() {
        let callback = Arc::new(Recording::default());
        let dispatcher = MessageDispatcher::new(callback.clone());
        let mut session = session();

        dispatcher.dispatch(&frame(MessageType::Unknown, "", None), &mut session);
        dispatcher.dispatch(&frame(MessageType::ChannelOverflow, "", None), &mut session);

        assert_eq!(callback.errors.lock().unwrap().len(), 2);
    }

    #[test]
    fn renewed_token_updates_session_and_requests_reconnect() {
        let callback = Arc::new(Recording::with_renewal("fresh-token"));
        let dispatcher = MessageDispatcher::new(callback.clone());
        let mut session = session();
        session.cursor = 5;

        let signal = dispatcher.dispatch(&frame(MessageType::Unauthorized, "", None), &mut session);

        assert_eq!(signal, Dispatch::Reconnect);
        assert_eq!(session.token.expose_secret(), "fresh-token");
        assert_eq!(session.cursor, 5, "renewal must not move the cursor");
        assert_eq!(callback.unauthorized_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_renewal_requests_permanent_stop() {
        let callback = Arc::new(Recording::with_renewal(""));
        let dispatcher = MessageDispatcher::new(callback.clone());
        let mut session = session();

        let signal = dispatcher.dispatch(&frame(MessageType::Unauthorized, "", None), &mut session);

        assert_eq!(signal, Dispatch::Stop);
        assert_eq!(session.token.expose_secret(), "abc", "token must be kept");
    }

    #[test]
    fn absent_renewal_requests_permanent_stop() {
        let callback = Arc::new(Recording::default());
        let dispatcher = MessageDispatcher::new(callback.clone());
        let mut session = session();

        let signal = dispatcher.dispatch(&frame(MessageType::Unauthorized, "", None), &mut session);
        assert_eq!(signal, Dispatch::Stop);
    }

    #[test]
    fn generic_callback_fires_for_every_frame_type() {
        let callback = Arc::new(Recording::with_renewal("t"));
        let dispatcher = MessageDispatcher::new(callback.clone());
        let mut session = session();

        for kind in [
            MessageType::Data,
            MessageType::Broadcast,
            MessageType::Noop,
            MessageType::NextSeq,
            MessageType::Unauthorized,
            MessageType::ChannelOverflow,
            MessageType::Unknown,
        ] {
            dispatcher.dispatch(&frame(kind, "1", None), &mut session);
        }

        assert_eq!(callback.messages.lock().unwrap().len(), 7);
    }
}
