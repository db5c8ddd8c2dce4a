use anyhow::Result;
use dualshock_session::{CallRegistry, Event, Invokable, Session, SessionConfig, WsTransport};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

struct Echo;

impl Invokable for Echo {
    const NAME: &'static str = "echo";
    type Args = String;
    type Returns = u64;
}

#[derive(Debug, Serialize, Deserialize)]
struct Tick {
    seq: u64,
}

struct Ticks;

impl Event for Ticks {
    const NAME: &'static str = "ticks";
    type Payload = Tick;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let url = std::env::var("RPC_URL").unwrap_or_else(|_| "ws://localhost:9000/rpc".to_string());
    let count: usize = std::env::var("TICK_COUNT")
        .ok()
        .and_then(|count| count.parse().ok())
        .unwrap_or(5);

    let registry = CallRegistry::builder()
        .invokable::<Echo>()
        .event::<Ticks>()
        .build()?;

    let config = SessionConfig::builder()
        .endpoint(url.parse()?)
        .registry(registry)
        .build();

    let session = Session::new(config, WsTransport::new());

    let length = session.invoke::<Echo>("hello".to_string()).await?;
    info!(length = length, "Echo returned");

    let mut ticks = session.subscribe::<Ticks>()?.take(count);
    while let Some(tick) = ticks.next().await {
        match tick {
            Ok(tick) => info!(seq = tick.seq, "Received tick"),
            Err(err) => warn!(error = %err, "Subscription error"),
        }
    }

    Ok(())
}
