use std::{sync::Arc, time::Instant};

use chrono::Local;

use tokio::select;
use tracing::{debug, trace, warn};

use super::{SessionContext, SessionError};
use crate::{
    channel::{Subscription, Topic},
    console,
    envelope::{Envelope, Kind},
};

/// What the receiver did with one datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Not an envelope; dropped.
    Malformed,
    /// Our own control traffic coming back from the topic.
    Echo,
    /// Answered a remote probe.
    Replied,
    /// A reply to a probe we no longer (or never) had outstanding.
    Unmatched,
    Rendered,
}

pub(crate) async fn run<T: Topic, S: Subscription>(
    ctx: Arc<SessionContext<T>>,
    mut subscription: S,
) -> Result<(), SessionError> {
    loop {
        let datum = select! {
            _ = ctx.token.cancelled() => return Ok(()),
            datum = subscription.next() => datum?,
        };

        let outcome = handle_datum(&ctx, &datum).await?;
        trace!(?outcome, "handled datum");
    }
}

pub(crate) async fn handle_datum<T: Topic>(
    ctx: &SessionContext<T>,
    datum: &[u8],
) -> Result<Outcome, SessionError> {
    let envelope = match Envelope::decode(datum) {
        Ok(envelope) => envelope,
        Err(error) => {
            debug!(%error, len = datum.len(), "dropping undecodable datum");
            return Ok(Outcome::Malformed);
        }
    };
    if envelope.kind.is_control() && ctx.identity.is_local(&envelope) {
        return Ok(Outcome::Echo);
    }

    match envelope.kind {
        Kind::Chat { text } => {
            let block = console::chat_block(&envelope.nick, Local::now(), &text);
            ctx.console.print_above_prompt(&block).await?;
            Ok(Outcome::Rendered)
        }
        Kind::Probe { id } => {
            let reply = ctx.identity.envelope(Kind::ProbeReply { id });
            if let Err(error) = ctx.topic.publish(reply.encode()?).await {
                warn!(%error, from = %envelope.nick, "failed to answer probe");
            }
            Ok(Outcome::Replied)
        }
        Kind::ProbeReply { id } => match ctx.probes.resolve(&id, Instant::now()).await {
            Some(elapsed) => {
                let block = console::latency_block(&envelope.nick, elapsed);
                ctx.console.print_above_prompt(&block).await?;
                Ok(Outcome::Rendered)
            }
            None => {
                debug!(%id, from = %envelope.nick, "ignoring reply to unknown probe");
                Ok(Outcome::Unmatched)
            }
        },
        Kind::Presence => {
            let block = console::joined_block(&envelope.nick);
            ctx.console.print_above_prompt(&block).await?;
            Ok(Outcome::Rendered)
        }
    }
}
