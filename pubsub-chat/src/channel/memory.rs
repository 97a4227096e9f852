use std::{collections::BTreeSet, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use super::{ChannelError, PeerId, Subscription, Topic};

/// In-process topic backed by a Tokio `broadcast` channel.
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<HubState>,
}

struct HubState {
    members: Mutex<BTreeSet<PeerId>>,
    broadcaster: Mutex<Option<broadcast::Sender<Vec<u8>>>>,
}

impl MemoryHub {
    pub fn new(capacity: usize) -> Self {
        let (broadcaster, _) = broadcast::channel(capacity);
        Self {
            state: Arc::new(HubState {
                members: Mutex::new(BTreeSet::new()),
                broadcaster: Mutex::new(Some(broadcaster)),
            }),
        }
    }

    /// Subscribes `peer_id` and returns its publishing and receiving halves.
    ///
    /// The peer stays listed until its [`MemoryTopic`] is dropped.
    pub fn join(
        &self,
        peer_id: impl Into<PeerId>,
    ) -> Result<(MemoryTopic, MemorySubscription), ChannelError> {
        let peer_id = peer_id.into();
        let inbox = self.tap()?;

        let mut members = self.state.members.lock();
        if !members.insert(peer_id.clone()) {
            return Err(ChannelError::Rejected(format!(
                "peer id '{peer_id}' is already subscribed"
            )));
        }

        let topic = MemoryTopic {
            peer_id,
            state: Arc::clone(&self.state),
        };
        Ok((topic, inbox))
    }

    /// Receives everything published without being listed as a peer.
    pub fn tap(&self) -> Result<MemorySubscription, ChannelError> {
        let broadcaster = self.state.broadcaster.lock();
        let sender = broadcaster.as_ref().ok_or(ChannelError::Closed)?;
        Ok(MemorySubscription {
            inbox: sender.subscribe(),
        })
    }

    /// Delivers a raw datum as if some unlisted publisher had sent it.
    pub fn inject(&self, data: Vec<u8>) -> Result<(), ChannelError> {
        self.state.send(data)
    }

    /// Closes the topic; pending and future `next` calls fail with `Closed`.
    pub fn close(&self) {
        self.state.broadcaster.lock().take();
    }
}

impl HubState {
    fn send(&self, data: Vec<u8>) -> Result<(), ChannelError> {
        let broadcaster = self.broadcaster.lock();
        let sender = broadcaster.as_ref().ok_or(ChannelError::Closed)?;
        // No subscribers is not an error for a broadcast topic.
        let _ = sender.send(data);
        Ok(())
    }
}

pub struct MemoryTopic {
    peer_id: PeerId,
    state: Arc<HubState>,
}

impl Topic for MemoryTopic {
    async fn publish(&self, data: Vec<u8>) -> Result<(), ChannelError> {
        self.state.send(data)
    }

    fn list_peers(&self) -> BTreeSet<PeerId> {
        let members = self.state.members.lock();
        members
            .iter()
            .filter(|peer| **peer != self.peer_id)
            .cloned()
            .collect()
    }
}

impl Drop for MemoryTopic {
    fn drop(&mut self) {
        self.state.members.lock().remove(&self.peer_id);
    }
}

pub struct MemorySubscription {
    inbox: broadcast::Receiver<Vec<u8>>,
}

impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Vec<u8>, ChannelError> {
        loop {
            match self.inbox.recv().await {
                Ok(data) => return Ok(data),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscription lagged behind the topic");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ChannelError::Closed),
            }
        }
    }
}
