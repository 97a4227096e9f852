use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a local topic relay that chat participants subscribe to.
    Relay(RelayArgs),
    /// Join the chat topic through a relay.
    Chat(ChatArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// Nickname shown next to your messages.
    #[arg(long, default_value = "anon")]
    pub nick: String,

    /// Address of the relay to subscribe through.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub relay: SocketAddr,

    /// Seconds an unanswered /ping is remembered. 0 remembers it forever.
    #[arg(long, default_value_t = 60)]
    pub probe_ttl_secs: u64,

    /// How often to check for a first peer before announcing presence.
    #[arg(long, default_value_t = 250, value_parser = clap::value_parser!(u64).range(1..))]
    pub presence_interval_ms: u64,

    /// How long to wait alone before the session counts as active anyway.
    #[arg(long, default_value_t = 5000)]
    pub presence_settle_ms: u64,
}
