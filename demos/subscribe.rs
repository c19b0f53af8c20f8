use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use comet_client::callback::{CometCallback, ConnectionCallback};
use comet_client::channel::{Channel, ChannelAllocator};
use comet_client::client::CometClient;
use comet_client::config::CometConfig;
use comet_client::proto::{Content, Message};
use secrecy::SecretString;

struct StaticAllocator;

impl ChannelAllocator for StaticAllocator {
    fn allocate(&self) -> Channel {
        Channel::with_token(
            "REPLACE_WITH_CHANNEL_NAME",
            SecretString::new("REPLACE_WITH_TOKEN".to_string()),
            0,
        )
    }
}

struct PrintCallback;

impl CometCallback for PrintCallback {
    fn on_message_arrived(&self, message: &Message) {
        println!("frame kind={:?} seq={}", message.kind, message.seq);
    }

    fn on_data_arrived(&self, content: Content) {
        println!("data id={} body={}", content.id, content.body);
    }

    fn on_error_message_arrived(&self, message: &Message) {
        println!("server error frame: {message:?}");
    }

    fn on_format_error(&self, message: &Message) {
        println!("undecodable payload at seq={}", message.seq);
    }

    fn on_unauthorized(&self) -> Option<String> {
        // Fetch a renewed token from your auth backend here; returning None
        // stops the client.
        None
    }
}

struct PrintLifecycle;

impl ConnectionCallback for PrintLifecycle {
    fn on_connect_success(&self) {
        println!("connected");
    }

    fn on_reconnect_success(&self, attempt: u32) {
        println!("reconnected on attempt {attempt}");
    }

    fn on_fail(&self, reason: &str) {
        println!("failed: {reason}");
    }

    fn on_disconnect(&self) {
        println!("disconnected");
    }

    fn on_stop(&self) {
        println!("stopped");
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let conf = CometConfig::new(
            "REPLACE_WITH_HOST",
            "stream",
            Arc::new(StaticAllocator),
            Arc::new(PrintCallback),
        )
        .with_port(8100)
        .with_connection_callback(Arc::new(PrintLifecycle));

        let client = CometClient::new();
        client.prepare(conf);
        client.connect();

        tokio::time::sleep(Duration::from_secs(60)).await;
        client.stop(true);
    });

    Ok(())
}
