//! A single-topic relay for local use.
//!
//! Subscribers connect over TCP, introduce themselves with a peer id and then
//! publish opaque payloads. Every payload is fanned out to all subscribers,
//! the publisher included, the way a gossip topic hands a node its own
//! messages back.

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader, Lines},
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, broadcast},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod protocol;

use protocol::{ClientToRelay, RelayToClient, read_frame, write_frame};

type ConnectionId = u64;

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl Relay {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    state.closing.cancel();
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => spawn_subscriber(stream, peer, &state),
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_subscriber(stream: TcpStream, addr: SocketAddr, state: &Arc<RelayState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %addr, error = ?err, "subscriber connection closed with error");
        }
    });
}

struct RelayState {
    subscribers: Mutex<HashMap<ConnectionId, String>>,
    broadcaster: broadcast::Sender<RelayToClient>,
    next_id: AtomicU64,
    closing: CancellationToken,
}

#[derive(Debug)]
enum RegisterError {
    PeerIdTaken,
}

impl RelayState {
    fn new() -> Self {
        // Subscribers that fall this far behind are told how much they missed.
        let (broadcaster, _) = broadcast::channel(256);
        Self {
            subscribers: Mutex::new(HashMap::new()),
            broadcaster,
            next_id: AtomicU64::new(1),
            closing: CancellationToken::new(),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `peer_id` and returns the peers that were already present.
    async fn register(
        &self,
        id: ConnectionId,
        peer_id: &str,
    ) -> Result<Vec<String>, RegisterError> {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.values().any(|existing| existing == peer_id) {
            return Err(RegisterError::PeerIdTaken);
        }

        let mut roster: Vec<String> = subscribers.values().cloned().collect();
        roster.sort();
        subscribers.insert(id, peer_id.to_string());
        Ok(roster)
    }

    async fn unregister(&self, id: ConnectionId) -> Option<String> {
        self.subscribers.lock().await.remove(&id)
    }

    fn broadcast(&self, frame: RelayToClient) {
        if self.broadcaster.send(frame).is_err() {
            debug!("no subscribers to receive frame");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayToClient> {
        self.broadcaster.subscribe()
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<RelayState>) -> Result<()> {
    let addr = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).lines();

    let peer_id = read_hello(&mut reader, &mut writer).await?;

    // Subscribe before announcing so no frame between join and first read is lost.
    let mut inbox = state.subscribe();
    let id = state.next_id();
    let roster = match state.register(id, &peer_id).await {
        Ok(roster) => roster,
        Err(RegisterError::PeerIdTaken) => {
            write_frame(
                &mut writer,
                &RelayToClient::Error {
                    message: format!("peer id '{peer_id}' is already subscribed"),
                },
            )
            .await?;
            anyhow::bail!("peer id already subscribed");
        }
    };

    write_frame(
        &mut writer,
        &RelayToClient::Welcome {
            peer_id: peer_id.clone(),
            peers: roster,
        },
    )
    .await?;

    info!(?addr, %peer_id, "subscriber joined");
    state.broadcast(RelayToClient::PeerJoined {
        peer_id: peer_id.clone(),
    });

    let session = relay_frames(&state, &mut inbox, &mut reader, &mut writer, &peer_id).await;

    if let Some(peer_id) = state.unregister(id).await {
        info!(?addr, %peer_id, "subscriber left");
        state.broadcast(RelayToClient::PeerLeft { peer_id });
    }

    session
}

async fn read_hello<R, W>(reader: &mut Lines<R>, writer: &mut W) -> Result<String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let peer_id = match read_frame::<_, ClientToRelay>(reader).await? {
        Some(ClientToRelay::Hello { peer_id }) => peer_id.trim().to_string(),
        Some(_) => anyhow::bail!("expected hello frame first"),
        None => anyhow::bail!("connection closed before hello"),
    };

    if peer_id.is_empty() {
        write_frame(
            writer,
            &RelayToClient::Error {
                message: "peer id cannot be empty".to_string(),
            },
        )
        .await?;
        anyhow::bail!("peer id cannot be empty");
    }

    Ok(peer_id)
}

async fn relay_frames<R, W>(
    state: &RelayState,
    inbox: &mut broadcast::Receiver<RelayToClient>,
    reader: &mut Lines<R>,
    writer: &mut W,
    peer_id: &str,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            _ = state.closing.cancelled() => {
                let farewell = RelayToClient::Error {
                    message: "relay shutting down".to_string(),
                };
                if let Err(err) = write_frame(writer, &farewell).await {
                    debug!(?err, "failed to tell subscriber about shutdown");
                }
                return Ok(());
            }
            incoming = read_frame::<_, ClientToRelay>(reader) => {
                match incoming? {
                    Some(ClientToRelay::Publish { data }) => {
                        state.broadcast(RelayToClient::Message {
                            from: peer_id.to_string(),
                            data,
                        });
                    }
                    Some(ClientToRelay::Hello { .. }) => {
                        write_frame(
                            writer,
                            &RelayToClient::Error {
                                message: "already subscribed".to_string(),
                            },
                        )
                        .await?;
                    }
                    None => return Ok(()),
                }
            }
            outgoing = inbox.recv() => {
                if !forward_frame(outgoing, writer).await {
                    return Ok(());
                }
            }
        }
    }
}

async fn forward_frame<W>(
    frame: Result<RelayToClient, broadcast::error::RecvError>,
    writer: &mut W,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    let frame = match frame {
        Ok(frame) => frame,
        Err(broadcast::error::RecvError::Lagged(skipped)) => RelayToClient::Error {
            message: format!("you are behind by {skipped} frames; some messages were dropped"),
        },
        Err(broadcast::error::RecvError::Closed) => return false,
    };

    match write_frame(writer, &frame).await {
        Ok(()) => true,
        Err(err) => {
            debug!(?err, "failed to deliver frame to subscriber");
            false
        }
    }
}
