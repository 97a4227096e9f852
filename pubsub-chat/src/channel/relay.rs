use std::{collections::BTreeSet, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::{debug, info, warn};

use super::{ChannelError, PeerId, Subscription, Topic};
use crate::relay::protocol::{ClientToRelay, RelayToClient, read_frame, write_frame};

type PeerSet = Arc<Mutex<BTreeSet<PeerId>>>;

/// Connects to a [`Relay`](crate::relay::Relay) and subscribes as `peer_id`.
///
/// The peer list is maintained from the relay's join/leave frames, which are
/// consumed by [`RelaySubscription::next`]; it only stays current while
/// somebody keeps reading the subscription.
pub async fn connect(
    addr: SocketAddr,
    peer_id: &str,
) -> Result<(RelayTopic, RelaySubscription), ChannelError> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).lines();

    write_frame(
        &mut writer,
        &ClientToRelay::Hello {
            peer_id: peer_id.to_string(),
        },
    )
    .await?;

    let roster = match read_frame::<_, RelayToClient>(&mut reader).await? {
        Some(RelayToClient::Welcome { peers, .. }) => peers,
        Some(RelayToClient::Error { message }) => return Err(ChannelError::Rejected(message)),
        Some(other) => {
            return Err(ChannelError::Protocol(format!(
                "expected welcome, got {other:?}"
            )));
        }
        None => return Err(ChannelError::Closed),
    };

    info!(%addr, peer_id, peers = roster.len(), "subscribed to relay");
    let peers: PeerSet = Arc::new(Mutex::new(
        roster.into_iter().filter(|peer| peer != peer_id).collect(),
    ));

    let topic = RelayTopic {
        writer: tokio::sync::Mutex::new(writer),
        peers: Arc::clone(&peers),
    };
    let subscription = RelaySubscription {
        reader,
        peers,
        peer_id: peer_id.to_string(),
    };
    Ok((topic, subscription))
}

pub struct RelayTopic {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    peers: PeerSet,
}

impl RelayTopic {
    /// Half-closes the connection; the relay then drops this subscriber.
    pub async fn shutdown(&self) {
        if let Err(error) = self.writer.lock().await.shutdown().await {
            warn!(?error, "failed to shut down relay connection cleanly");
        }
    }
}

impl Topic for RelayTopic {
    async fn publish(&self, data: Vec<u8>) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &ClientToRelay::Publish { data }).await?;
        Ok(())
    }

    fn list_peers(&self) -> BTreeSet<PeerId> {
        self.peers.lock().clone()
    }
}

pub struct RelaySubscription {
    reader: Lines<BufReader<OwnedReadHalf>>,
    peers: PeerSet,
    peer_id: PeerId,
}

impl Subscription for RelaySubscription {
    async fn next(&mut self) -> Result<Vec<u8>, ChannelError> {
        loop {
            let frame = read_frame::<_, RelayToClient>(&mut self.reader)
                .await?
                .ok_or(ChannelError::Closed)?;

            match frame {
                RelayToClient::Message { data, .. } => return Ok(data),
                RelayToClient::PeerJoined { peer_id } => {
                    if peer_id != self.peer_id {
                        debug!(%peer_id, "peer joined topic");
                        self.peers.lock().insert(peer_id);
                    }
                }
                RelayToClient::PeerLeft { peer_id } => {
                    debug!(%peer_id, "peer left topic");
                    self.peers.lock().remove(&peer_id);
                }
                RelayToClient::Error { message } => warn!(%message, "relay reported an error"),
                RelayToClient::Welcome { .. } => {
                    return Err(ChannelError::Protocol("unexpected second welcome".into()));
                }
            }
        }
    }
}
