//! The envelope every participant publishes on the shared topic.
//!
//! Chat text and control traffic (presence, latency probes and their replies)
//! travel on the same topic. Each envelope carries an explicit `kind`
//! discriminant so that a user typing `__PING__` is still just chatting.
//! Envelopes from older peers that only know `{nick, text, ts}` are decoded
//! through the reserved text prefixes instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved text of a legacy presence announcement.
pub const PRESENCE_TOKEN: &str = "__JOIN__";
/// Reserved prefix of a legacy probe; the probe id follows it.
pub const PROBE_PREFIX: &str = "__PING__";
/// Reserved prefix of a legacy probe reply; the echoed probe id follows it.
pub const PROBE_REPLY_PREFIX: &str = "__PONG__";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub nick: String,
    /// Instance id of the publishing session. Absent on legacy envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: Kind,
}

/// What an envelope means once it has been classified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Kind {
    Chat { text: String },
    Presence,
    Probe { id: String },
    ProbeReply { id: String },
}

impl Kind {
    /// Classifies free text using the reserved prefixes.
    pub fn from_legacy_text(text: String) -> Self {
        if text == PRESENCE_TOKEN {
            Kind::Presence
        } else if let Some(id) = text.strip_prefix(PROBE_PREFIX) {
            Kind::Probe { id: id.to_string() }
        } else if let Some(id) = text.strip_prefix(PROBE_REPLY_PREFIX) {
            Kind::ProbeReply { id: id.to_string() }
        } else {
            Kind::Chat { text }
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, Kind::Chat { .. })
    }
}

#[derive(Deserialize)]
struct LegacyEnvelope {
    nick: String,
    text: String,
    ts: DateTime<Utc>,
}

impl From<LegacyEnvelope> for Envelope {
    fn from(legacy: LegacyEnvelope) -> Self {
        Envelope {
            nick: legacy.nick,
            origin: None,
            ts: legacy.ts,
            kind: Kind::from_legacy_text(legacy.text),
        }
    }
}

impl Envelope {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        match serde_json::from_slice::<Envelope>(bytes) {
            Ok(envelope) => Ok(envelope),
            Err(tagged_err) => serde_json::from_slice::<LegacyEnvelope>(bytes)
                .map(Envelope::from)
                .map_err(|_| tagged_err),
        }
    }
}

/// Who this session is.
///
/// The nickname is only ever displayed. Local-origin checks compare the
/// per-session instance id, so two participants sharing a nickname still
/// see each other's control traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    nick: String,
    instance: String,
}

impl Identity {
    pub fn new(nick: impl Into<String>) -> Self {
        Self::with_instance(nick, nanoid::nanoid!())
    }

    pub fn with_instance(nick: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            instance: instance.into(),
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Name this session subscribes to the topic under.
    pub fn peer_id(&self) -> String {
        format!("{}@{}", self.nick, self.instance)
    }

    pub fn is_local(&self, envelope: &Envelope) -> bool {
        match &envelope.origin {
            Some(origin) => *origin == self.instance,
            // Legacy peers only tell us a nickname.
            None => envelope.nick == self.nick,
        }
    }

    /// Stamps `kind` with this identity and the current time.
    pub fn envelope(&self, kind: Kind) -> Envelope {
        Envelope {
            nick: self.nick.clone(),
            origin: Some(self.instance.clone()),
            ts: Utc::now(),
            kind,
        }
    }
}
