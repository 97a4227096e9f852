//! The broadcast topic a session talks over.
//!
//! A topic is split the way pub/sub libraries split it: a shareable
//! [`Topic`] handle for publishing and peer listing, and a single
//! [`Subscription`] that yields every datum published on the topic,
//! including the subscriber's own.

use std::{collections::BTreeSet, future::Future, io};

use thiserror::Error;

pub mod memory;
pub mod relay;

pub type PeerId = String;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("rejected by the topic: {0}")]
    Rejected(String),
    #[error("unexpected frame from the topic: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub trait Topic: Send + Sync + 'static {
    fn publish(&self, data: Vec<u8>) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Remote peers currently subscribed to the topic.
    fn list_peers(&self) -> BTreeSet<PeerId>;
}

pub trait Subscription: Send + 'static {
    /// Waits for the next datum. Dropping the future must be safe.
    fn next(&mut self) -> impl Future<Output = Result<Vec<u8>, ChannelError>> + Send;
}
