//! Terminal chat over a publish/subscribe topic.
//!
//! Every participant subscribes to one shared topic, publishes JSON
//! envelopes to it and renders whatever comes back. Each module focuses on
//! a concrete responsibility:
//!
//! - [`envelope`] defines the message envelope and its legacy decoding.
//! - [`channel`] abstracts the topic behind [`channel::Topic`] and
//!   [`channel::Subscription`], with an in-memory hub and a TCP relay client.
//! - [`relay`] is a small single-topic TCP relay that the `relay` subcommand
//!   runs for local use.
//! - [`session`] runs the receiver, sender and presence tasks of one chat
//!   participant under a shared cancellation token.
//! - [`probe`] tracks outstanding latency probes.
//! - [`console`] owns the terminal: prompt redraws, rendering and line input.
//! - [`cli`] and [`client`] wire the above into the binary.

pub mod channel;
pub mod cli;
pub mod client;
pub mod console;
pub mod envelope;
pub mod probe;
pub mod relay;
pub mod session;
