use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    select,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::{MIN_PRESENCE_INTERVAL, Phase, SessionContext};
use crate::{channel::Topic, envelope::Kind};

/// Lets exactly one caller through, however many race for it.
#[derive(Debug, Default)]
pub struct PresenceLatch {
    fired: AtomicBool,
}

impl PresenceLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the first caller only.
    pub fn try_fire(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Polls the topic until a remote peer shows up, then announces once.
///
/// If nobody shows up within `settle_after` the session is marked active
/// anyway; polling continues so a late peer still gets the announcement.
/// Returns whether this call published the announcement.
pub(crate) async fn announce_when_ready<T: Topic>(
    ctx: Arc<SessionContext<T>>,
    interval: Duration,
    settle_after: Duration,
) -> bool {
    let interval = interval.max(MIN_PRESENCE_INTERVAL);
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let settle = time::sleep(settle_after);
    tokio::pin!(settle);
    let mut settled = false;

    loop {
        select! {
            _ = ctx.token.cancelled() => {
                debug!("session closed before any peer appeared");
                return false;
            }
            _ = &mut settle, if !settled => {
                settled = true;
                debug!("no peers yet, settling without an announcement");
                mark_active(&ctx);
                continue;
            }
            _ = ticker.tick() => {}
        }

        let peers = ctx.topic.list_peers();
        if !peers.is_empty() {
            debug!(peers = peers.len(), "peers visible, announcing presence");
            return announce(&ctx).await;
        }
    }
}

pub(crate) async fn announce<T: Topic>(ctx: &SessionContext<T>) -> bool {
    if !ctx.presence.try_fire() {
        return false;
    }

    let presence = ctx.identity.envelope(Kind::Presence);
    let published = match presence.encode() {
        Ok(bytes) => ctx.topic.publish(bytes).await.map_err(|err| err.to_string()),
        Err(err) => Err(err.to_string()),
    };
    if let Err(error) = published {
        warn!(%error, "failed to announce presence");
    } else {
        info!(nick = ctx.identity.nick(), "announced presence");
    }

    mark_active(ctx);
    true
}

fn mark_active<T>(ctx: &SessionContext<T>) {
    ctx.phase.send_if_modified(|phase| {
        let announcing = *phase == Phase::Announcing;
        if announcing {
            *phase = Phase::Active;
        }
        announcing
    });
}
