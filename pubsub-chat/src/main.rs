use std::io::{self, IsTerminal};

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use pubsub_chat::{
    cli::{Cli, Command},
    client,
    relay::Relay,
};

/// The relay logs to stdout at `info`. A chat session owns stdout for the
/// conversation, so it logs to stderr and stays quiet unless `RUST_LOG` says
/// otherwise.
fn init_tracing(command: &Command) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default = match command {
        Command::Relay(_) => "info",
        Command::Chat(_) => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = match command {
        Command::Relay(_) => builder
            .with_ansi(io::stdout().is_terminal())
            .try_init(),
        Command::Chat(_) => builder
            .with_ansi(io::stderr().is_terminal())
            .with_writer(io::stderr)
            .try_init(),
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.command);

    match cli.command {
        Command::Relay(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            let relay = Relay::new(listener);
            let addr = relay.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = relay.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Chat(args) => client::run(args).await?,
    }

    Ok(())
}
