use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use pubsub_chat::{
    channel::{
        ChannelError, Subscription, Topic,
        relay::{self, RelaySubscription, RelayTopic},
    },
    relay::Relay,
};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const STEP: Duration = Duration::from_secs(1);

async fn start_relay() -> Result<(SocketAddr, oneshot::Sender<()>, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let relay = Relay::new(listener);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = relay.run_until(shutdown).await;
    });
    Ok((addr, shutdown_tx, server))
}

async fn next(inbox: &mut RelaySubscription) -> Result<Vec<u8>> {
    Ok(timeout(STEP, inbox.next()).await??)
}

/// Publishes a marker and reads it back, which also applies any roster
/// changes the relay sent before it.
async fn sync(topic: &RelayTopic, inbox: &mut RelaySubscription) -> Result<()> {
    topic.publish(b"sync".to_vec()).await?;
    loop {
        if next(inbox).await? == b"sync" {
            return Ok(());
        }
    }
}

#[tokio::test]
async fn payloads_reach_every_subscriber_including_the_publisher() -> Result<()> {
    let (addr, shutdown, server) = start_relay().await?;

    let (alice, mut alice_inbox) = relay::connect(addr, "alice@1").await?;
    let (bob, mut bob_inbox) = relay::connect(addr, "bob@2").await?;
    assert_eq!(bob.list_peers().into_iter().collect::<Vec<_>>(), ["alice@1"]);

    alice.publish(b"hello bob".to_vec()).await?;
    assert_eq!(next(&mut bob_inbox).await?, b"hello bob");
    assert_eq!(next(&mut alice_inbox).await?, b"hello bob");

    // Reading past bob's join frame taught alice about him.
    assert_eq!(alice.list_peers().into_iter().collect::<Vec<_>>(), ["bob@2"]);

    alice.shutdown().await;
    bob.shutdown().await;
    let _ = shutdown.send(());
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn duplicate_peer_id_is_rejected() -> Result<()> {
    let (addr, shutdown, server) = start_relay().await?;

    let (_alice, _alice_inbox) = relay::connect(addr, "alice@1").await?;
    match relay::connect(addr, "alice@1").await {
        Err(ChannelError::Rejected(message)) => assert!(message.contains("alice@1")),
        Err(other) => panic!("expected rejection, got {other}"),
        Ok(_) => panic!("duplicate peer id was accepted"),
    }

    let _ = shutdown.send(());
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn departed_peer_is_dropped_from_the_list() -> Result<()> {
    let (addr, shutdown, server) = start_relay().await?;

    let (alice, mut alice_inbox) = relay::connect(addr, "alice@1").await?;
    let (bob, _bob_inbox) = relay::connect(addr, "bob@2").await?;
    sync(&alice, &mut alice_inbox).await?;
    assert!(alice.list_peers().contains("bob@2"));

    bob.shutdown().await;
    for _ in 0..50 {
        sync(&alice, &mut alice_inbox).await?;
        if alice.list_peers().is_empty() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(alice.list_peers().is_empty());

    // The id is free again once the relay has seen the connection go.
    let (_bob_again, _inbox) = relay::connect(addr, "bob@2").await?;

    let _ = shutdown.send(());
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn relay_shutdown_closes_subscriptions() -> Result<()> {
    let (addr, shutdown, server) = start_relay().await?;
    let (_alice, mut alice_inbox) = relay::connect(addr, "alice@1").await?;

    let _ = shutdown.send(());
    let _ = server.await;

    let result = timeout(STEP, alice_inbox.next()).await?;
    assert!(matches!(result, Err(ChannelError::Closed)), "{result:?}");
    Ok(())
}
