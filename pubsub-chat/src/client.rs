use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    channel::relay,
    cli::ChatArgs,
    console::{Console, StdinLines},
    envelope::Identity,
    session::{Session, SessionConfig},
};

pub async fn run(args: ChatArgs) -> Result<()> {
    let identity = Identity::new(args.nick.clone());
    let (topic, subscription) = relay::connect(args.relay, &identity.peer_id())
        .await
        .with_context(|| format!("failed to subscribe through relay at {}", args.relay))?;
    info!(relay = %args.relay, peer_id = %identity.peer_id(), "connected");

    let topic = Arc::new(topic);
    let console = Arc::new(Console::new(tokio::io::stdout()));
    let input = StdinLines::spawn().context("failed to start reading stdin")?;

    let session = Session::new(
        session_config(identity, &args),
        Arc::clone(&topic),
        subscription,
        console,
    );
    let outcome = session.run(input).await;

    topic.shutdown().await;
    outcome.context("chat session ended with an error")
}

fn session_config(identity: Identity, args: &ChatArgs) -> SessionConfig {
    let mut config = SessionConfig::new(identity);
    config.presence_interval = Duration::from_millis(args.presence_interval_ms);
    config.presence_settle = Duration::from_millis(args.presence_settle_ms);
    config.probe_ttl = match args.probe_ttl_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    config
}
