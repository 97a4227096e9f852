//! The interactive terminal: a prompt line kept stable under a live feed.
//!
//! Output from the receiver (incoming traffic) and the sender (command
//! responses) goes through one [`Console`], which performs each
//! clear-line / write / redraw-prompt sequence under a single lock.

use std::{
    collections::BTreeSet,
    fmt::Display,
    future::Future,
    io::{self, BufRead},
    pin::Pin,
    thread,
    time::Duration,
};

use chrono::{DateTime, Local};
use crossterm::{
    cursor::{MoveToColumn, MoveUp},
    queue,
    style::{Print, Stylize},
    terminal::{Clear, ClearType},
};
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, mpsc},
};
use tracing::debug;

pub const PROMPT: &str = "> ";

pub const HELP_TEXT: &str = "Available commands:
/help           Show this help
/quit           Leave the chat
/list           Show peers currently in the room
/ping           Measure round-trip latency to all peers";

pub struct Console {
    out: Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
}

impl Console {
    pub fn new(out: impl AsyncWrite + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::pin(out)),
        }
    }

    /// Replaces the current input line with `block` and redraws the prompt.
    pub async fn print_above_prompt(&self, block: &str) -> io::Result<()> {
        let mut frame: Vec<u8> = Vec::with_capacity(block.len() + 16);
        queue!(
            frame,
            Clear(ClearType::CurrentLine),
            MoveToColumn(0),
            Print(block),
            Print(PROMPT)
        )?;
        self.write(&frame).await
    }

    /// Writes `line` without redrawing the prompt afterwards.
    pub async fn println(&self, line: &str) -> io::Result<()> {
        let mut frame: Vec<u8> = Vec::with_capacity(line.len() + 1);
        queue!(frame, Print(line), Print('\n'))?;
        self.write(&frame).await
    }

    pub async fn prompt(&self) -> io::Result<()> {
        self.write(PROMPT.as_bytes()).await
    }

    /// Removes the line the user just submitted; it comes back from the topic.
    pub async fn erase_submitted_line(&self) -> io::Result<()> {
        let mut frame: Vec<u8> = Vec::new();
        queue!(frame, MoveUp(1), Clear(ClearType::CurrentLine), MoveToColumn(0))?;
        self.write(&frame).await
    }

    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut out = self.out.lock().await;
        out.write_all(bytes).await?;
        out.flush().await
    }
}

/// `received_at` is when the line reached us, not the sender's clock.
pub fn chat_block(nick: &str, received_at: DateTime<Local>, text: &str) -> String {
    let stamp = received_at.format("%Y-%m-%d %H:%M:%S");
    let body = text.replace('\n', "\n» ");
    format!("{PROMPT}[{stamp}] [{}]\n» {body}\n\n", nick.green())
}

pub fn joined_block(nick: &str) -> String {
    line(format!("*** {nick} joined the chat ***").green().bold())
}

pub fn latency_block(nick: &str, elapsed: Duration) -> String {
    line(format!("Pong from {nick}: {} ms", elapsed.as_millis()).cyan())
}

pub fn peers_block(peers: &BTreeSet<String>) -> String {
    let listed: Vec<&str> = peers.iter().map(String::as_str).collect();
    format!("Peers ({}): [{}]\n", peers.len(), listed.join(" "))
}

pub fn unknown_command_block(command: &str) -> String {
    format!("Unknown command: {command}\n")
}

pub fn help_block() -> String {
    format!("{HELP_TEXT}\n")
}

pub const FAREWELL: &str = "👋  Bye!";

fn line(content: impl Display) -> String {
    format!("{content}\n")
}

#[derive(Debug, Error)]
pub enum ReadLineError {
    /// The user pressed Ctrl-C; the line being typed is abandoned.
    #[error("interrupted")]
    Interrupted,
    #[error("end of input")]
    Eof,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub trait LineReader: Send + 'static {
    fn read_line(&mut self) -> impl Future<Output = Result<String, ReadLineError>> + Send;
}

/// Lines from the process's standard input.
///
/// Standard input is read on a dedicated OS thread: a blocking read cannot be
/// interrupted, and parking it on the runtime's blocking pool would hold up
/// runtime shutdown until the user pressed Enter.
pub struct StdinLines {
    lines: mpsc::Receiver<io::Result<String>>,
}

impl StdinLines {
    pub fn spawn() -> io::Result<Self> {
        let (tx, lines) = mpsc::channel(16);
        thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || {
                for line in io::stdin().lock().lines() {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                debug!("stdin reader finished");
            })?;
        Ok(Self { lines })
    }
}

impl LineReader for StdinLines {
    async fn read_line(&mut self) -> Result<String, ReadLineError> {
        select! {
            line = self.lines.recv() => match line {
                Some(line) => Ok(line?),
                None => Err(ReadLineError::Eof),
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                Err(ReadLineError::Interrupted)
            }
        }
    }
}
