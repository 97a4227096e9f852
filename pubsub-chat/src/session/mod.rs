//! A chat session over one topic.
//!
//! Three tasks share a single [`CancellationToken`]:
//!
//! - the receiver drains the subscription, answers probes and renders traffic,
//! - the sender turns terminal lines into chat envelopes or local commands,
//! - the presence announcer waits for a first remote peer and says hello once.
//!
//! Whichever of the receiver or sender stops first (an error, `/quit`, or
//! the token being cancelled from outside) cancels the token, and
//! [`Session::run`] returns only after all three tasks have been joined.
//! The announcer finishing does not end the session; it panicking does.

use std::{future::Future, io, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelError, Subscription, Topic},
    console::{self, Console, LineReader},
    envelope::Identity,
    probe::ProbeTracker,
};

mod presence;
mod receiver;
mod sender;

pub use presence::PresenceLatch;
pub use sender::Command;

pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_millis(250);
/// Shorter poll intervals are raised to this.
pub const MIN_PRESENCE_INTERVAL: Duration = Duration::from_millis(1);
pub const DEFAULT_PRESENCE_SETTLE: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("channel failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("terminal input closed")]
    InputClosed,
    #[error("terminal i/o failed: {0}")]
    Terminal(#[from] io::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Where a session is in its lifetime.
///
/// `Announcing` and `Active` are both fully interactive. `Active` is reached
/// when this session's presence announcement goes out, or once the settle
/// timeout passes with no peer in sight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Announcing,
    Active,
    Closing,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub identity: Identity,
    pub presence_interval: Duration,
    /// How long a session with no peers stays `Announcing` before it is
    /// considered `Active` anyway.
    pub presence_settle: Duration,
    /// How long an unanswered probe is remembered. `None` keeps it forever.
    pub probe_ttl: Option<Duration>,
}

impl SessionConfig {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            presence_interval: DEFAULT_PRESENCE_INTERVAL,
            presence_settle: DEFAULT_PRESENCE_SETTLE,
            probe_ttl: Some(DEFAULT_PROBE_TTL),
        }
    }
}

/// State shared by the session's tasks.
pub(crate) struct SessionContext<T> {
    pub(crate) identity: Identity,
    pub(crate) topic: Arc<T>,
    pub(crate) console: Arc<Console>,
    pub(crate) probes: ProbeTracker,
    pub(crate) presence: PresenceLatch,
    pub(crate) phase: watch::Sender<Phase>,
    pub(crate) token: CancellationToken,
}

impl<T: Topic> SessionContext<T> {
    pub(crate) fn new(
        identity: Identity,
        topic: Arc<T>,
        console: Arc<Console>,
        probe_ttl: Option<Duration>,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            identity,
            topic,
            console,
            probes: ProbeTracker::new(probe_ttl),
            presence: PresenceLatch::new(),
            phase,
            token: CancellationToken::new(),
        }
    }
}

pub struct Session<T, S> {
    context: Arc<SessionContext<T>>,
    subscription: S,
    presence_interval: Duration,
    presence_settle: Duration,
}

impl<T: Topic, S: Subscription> Session<T, S> {
    pub fn new(
        config: SessionConfig,
        topic: Arc<T>,
        subscription: S,
        console: Arc<Console>,
    ) -> Self {
        let context = SessionContext::new(config.identity, topic, console, config.probe_ttl);
        Self {
            context: Arc::new(context),
            subscription,
            presence_interval: config.presence_interval,
            presence_settle: config.presence_settle,
        }
    }

    /// Cancelling this token ends the session as a clean shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.token.clone()
    }

    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.context.phase.subscribe()
    }

    pub async fn run<R: LineReader>(self, input: R) -> Result<(), SessionError> {
        let Session {
            context,
            subscription,
            presence_interval,
            presence_settle,
        } = self;

        let nick = context.identity.nick();
        context
            .console
            .print_above_prompt(&console::joined_block(nick))
            .await?;
        context.phase.send_replace(Phase::Announcing);
        info!(nick, instance = context.identity.instance(), "session started");

        let announcer = tokio::spawn(cancel_on_failure(
            context.token.clone(),
            "announcer",
            {
                let context = Arc::clone(&context);
                async move {
                    let announced =
                        presence::announce_when_ready(context, presence_interval, presence_settle)
                            .await;
                    Ok::<_, SessionError>(announced)
                }
            },
        ));
        let receiver = tokio::spawn(cancel_on_exit(
            context.token.clone(),
            "receiver",
            receiver::run(Arc::clone(&context), subscription),
        ));
        let sender = tokio::spawn(cancel_on_exit(
            context.token.clone(),
            "sender",
            sender::run(Arc::clone(&context), input),
        ));

        context.token.cancelled().await;
        context.phase.send_replace(Phase::Closing);

        let (announcer, receiver, sender) = tokio::join!(announcer, receiver, sender);
        context.phase.send_replace(Phase::Terminated);

        let announced = announcer??;
        debug!(announced, "presence announcer finished");
        let outcome = receiver?.and(sender?);
        info!(clean = outcome.is_ok(), "session terminated");
        outcome
    }
}

/// Runs `task`, cancelling `token` however it ends, panics included.
async fn cancel_on_exit<F>(
    token: CancellationToken,
    name: &'static str,
    task: F,
) -> Result<(), SessionError>
where
    F: Future<Output = Result<(), SessionError>>,
{
    let _guard = token.drop_guard();
    let result = task.await;
    match &result {
        Ok(()) => debug!(task = name, "session task finished"),
        Err(err) => warn!(task = name, error = %err, "session task failed"),
    }
    result
}

/// Runs `task`, cancelling `token` only if it fails or panics.
async fn cancel_on_failure<F, T>(
    token: CancellationToken,
    name: &'static str,
    task: F,
) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    let guard = token.drop_guard();
    let result = task.await;
    match &result {
        Ok(_) => {
            guard.disarm();
            debug!(task = name, "session task finished");
        }
        Err(err) => warn!(task = name, error = %err, "session task failed"),
    }
    result
}


#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
    };

    use parking_lot::Mutex;
    use tokio::io::AsyncWrite;

    use super::*;
    use crate::channel::memory::{MemoryHub, MemoryTopic};

    /// Terminal output captured in memory.
    #[derive(Clone, Default)]
    pub(crate) struct Transcript(Arc<Mutex<Vec<u8>>>);

    impl Transcript {
        pub(crate) fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl AsyncWrite for Transcript {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.0.lock().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    pub(crate) fn context(
        hub: &MemoryHub,
        identity: Identity,
    ) -> (Arc<SessionContext<MemoryTopic>>, Transcript) {
        let (topic, _inbox) = hub.join(identity.peer_id()).expect("join hub");
        let transcript = Transcript::default();
        let console = Arc::new(Console::new(transcript.clone()));
        let context = SessionContext::new(
            identity,
            Arc::new(topic),
            console,
            Some(DEFAULT_PROBE_TTL),
        );
        (Arc::new(context), transcript)
    }
}
