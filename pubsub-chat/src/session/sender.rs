use std::{ops::ControlFlow, sync::Arc, time::Instant};

use tokio::select;
use tracing::{debug, info, warn};

use super::{SessionContext, SessionError};
use crate::{
    channel::Topic,
    console::{self, LineReader, ReadLineError},
    envelope::Kind,
    probe::new_probe_id,
};

/// A `/`-prefixed line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Ping,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    /// Parses the text after the leading `/`. Case-insensitive.
    pub fn parse(input: &str) -> Self {
        let word = input.trim().to_lowercase();
        match word.as_str() {
            "list" => Command::List,
            "ping" => Command::Ping,
            "help" | "h" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            _ => Command::Unknown(word),
        }
    }
}

pub(crate) async fn run<T: Topic, R: LineReader>(
    ctx: Arc<SessionContext<T>>,
    mut input: R,
) -> Result<(), SessionError> {
    loop {
        let line = select! {
            _ = ctx.token.cancelled() => return Ok(()),
            line = input.read_line() => line,
        };

        let line = match line {
            Ok(line) => line,
            Err(ReadLineError::Interrupted) => {
                ctx.console.print_above_prompt("").await?;
                continue;
            }
            Err(ReadLineError::Eof) => return Err(SessionError::InputClosed),
            Err(ReadLineError::Io(err)) => return Err(SessionError::Terminal(err)),
        };

        match line.strip_prefix('/') {
            Some(command) => {
                if execute(&ctx, Command::parse(command)).await?.is_break() {
                    return Ok(());
                }
            }
            None => send_chat(&ctx, line).await?,
        }
    }
}

async fn execute<T: Topic>(
    ctx: &SessionContext<T>,
    command: Command,
) -> Result<ControlFlow<()>, SessionError> {
    match command {
        Command::List => {
            let peers = ctx.topic.list_peers();
            ctx.console
                .print_above_prompt(&console::peers_block(&peers))
                .await?;
        }
        Command::Ping => {
            let id = new_probe_id();
            ctx.probes.record(id.clone(), Instant::now()).await;
            debug!(%id, "sending probe");

            let probe = ctx.identity.envelope(Kind::Probe { id });
            if let Err(error) = ctx.topic.publish(probe.encode()?).await {
                warn!(%error, "failed to publish probe");
            }
            ctx.console.prompt().await?;
        }
        Command::Help => {
            ctx.console
                .print_above_prompt(&console::help_block())
                .await?;
        }
        Command::Quit => {
            ctx.console.println(console::FAREWELL).await?;
            info!("leaving chat");
            ctx.token.cancel();
            return Ok(ControlFlow::Break(()));
        }
        Command::Unknown(word) => {
            ctx.console
                .print_above_prompt(&console::unknown_command_block(&word))
                .await?;
        }
    }
    Ok(ControlFlow::Continue(()))
}

async fn send_chat<T: Topic>(ctx: &SessionContext<T>, text: String) -> Result<(), SessionError> {
    // Our own copy comes back from the topic and is rendered in full.
    ctx.console.erase_submitted_line().await?;
    let chat = ctx.identity.envelope(Kind::Chat { text });
    ctx.topic.publish(chat.encode()?).await?;
    Ok(())
}
