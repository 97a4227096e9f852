use std::{path::Path, process::Stdio, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("pubsub_chat");

    let (mut relay_child, mut relay_stdout) = spawn_relay(&binary).await?;
    let addr = read_relay_addr(&mut relay_stdout).await?;

    // Drain additional relay logs in the background so the pipe never fills.
    let relay_log_task = tokio::spawn(async move {
        drain_stdout(relay_stdout).await;
    });

    let mut alice = spawn_chat(&binary, "alice", &addr)?;
    alice
        .expect("*** alice joined the chat ***", "alice self-join line")
        .await?;
    let mut bob = spawn_chat(&binary, "bob", &addr)?;

    // Each side announces itself once it sees the other.
    alice
        .expect("*** bob joined the chat ***", "alice sees bob arrive")
        .await?;
    bob.expect("*** alice joined the chat ***", "bob sees alice arrive")
        .await?;

    alice.send_line("hello bob").await.context("alice chat")?;
    let heard = bob.expect("» hello bob", "bob hears alice").await?;
    assert!(heard.contains("alice"));
    alice.expect("» hello bob", "alice sees her own line").await?;

    bob.send_line("/ping").await.context("bob ping")?;
    bob.expect("Pong from alice", "bob gets a pong").await?;

    alice.send_line("/quit").await.context("alice quit")?;
    alice.expect("Bye!", "alice says goodbye").await?;
    bob.send_line("/quit").await.context("bob quit")?;
    bob.expect("Bye!", "bob says goodbye").await?;

    alice.ensure_success("alice chat").await?;
    bob.ensure_success("bob chat").await?;

    // The relay stays up after subscribers leave; terminate it manually.
    let _ = relay_child.kill().await;
    let _ = relay_child.wait().await;
    let _ = relay_log_task.await;

    Ok(())
}

struct ChatProcess {
    child: Child,
    stdin: ChildStdin,
    output: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl ChatProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Waits until everything printed so far contains `needle`.
    async fn expect(&mut self, needle: &str, description: &str) -> Result<String> {
        let output = Arc::clone(&self.output);
        let seen = timeout(READ_TIMEOUT, async move {
            loop {
                let text = String::from_utf8_lossy(&output.lock()).into_owned();
                if text.contains(needle) {
                    return text;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        seen.map_err(|_| {
            anyhow!(
                "{description}: timed out waiting for {needle:?}; output so far:\n{}",
                String::from_utf8_lossy(&self.output.lock())
            )
        })
    }

    async fn ensure_success(mut self, name: &str) -> Result<()> {
        let status = timeout(READ_TIMEOUT, self.child.wait())
            .await
            .with_context(|| format!("{name} did not exit"))?
            .with_context(|| format!("failed to await {name} process"))?;
        let _ = self.reader.await;
        if !status.success() {
            return Err(anyhow!("{name} exited with status {status}"));
        }
        Ok(())
    }
}

async fn spawn_relay(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("relay")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stdout = child
        .stdout
        .take()
        .context("relay stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_relay_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("timed out waiting for relay banner"))??;
    if bytes == 0 {
        return Err(anyhow!("relay did not emit listening address"));
    }

    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected relay banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("relay banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

fn spawn_chat(binary: &Path, nick: &str, addr: &str) -> Result<ChatProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("chat")
        .arg("--nick")
        .arg(nick)
        .arg("--relay")
        .arg(addr)
        .arg("--presence-interval-ms")
        .arg("50")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn chat {nick}"))?;
    let stdin = child
        .stdin
        .take()
        .context("chat stdin missing after spawn")?;
    let mut stdout = child
        .stdout
        .take()
        .context("chat stdout missing after spawn")?;

    let output = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&output);
    let reader = tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        while let Ok(read) = stdout.read(&mut chunk).await {
            if read == 0 {
                break;
            }
            sink.lock().extend_from_slice(&chunk[..read]);
        }
    });

    Ok(ChatProcess {
        child,
        stdin,
        output,
        reader,
    })
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}
