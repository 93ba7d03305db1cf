use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TwitchConfig;

// Sleep needed after JOIN when the account is not mod/vip on the channel
// (connection-rate rule on the Twitch side).
const JOIN_SETTLE_DELAY: Duration = Duration::from_secs(1);
const MAILBOX_CAPACITY: usize = 512;

#[derive(Debug, Error)]
pub enum TwitchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub username: String,
    pub text: String,
}

/// One IRC connection to a single Twitch channel for the lifetime of one
/// game session. A dedicated drain task parses inbound PRIVMSG lines into
/// the session's bounded mailbox; the controller cancels it on exit.
pub struct TwitchSession {
    channel: String,
    writer: OwnedWriteHalf,
    mailbox: mpsc::Receiver<ChatMessage>,
    shutdown: CancellationToken,
}

impl TwitchSession {
    pub async fn connect(cfg: &TwitchConfig, channel: &str) -> Result<Self, TwitchError> {
        let channel = channel.trim().to_ascii_lowercase();
        let stream = TcpStream::connect(&cfg.server).await?;
        let (read_half, mut writer) = stream.into_split();

        writer
            .write_all(format!("PASS {}\r\n", cfg.token).as_bytes())
            .await?;
        writer
            .write_all(format!("NICK {}\r\n", cfg.nickname).as_bytes())
            .await?;
        writer
            .write_all(format!("JOIN #{channel}\r\n").as_bytes())
            .await?;

        let (tx, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        let shutdown = CancellationToken::new();
        tokio::spawn(drain_messages(
            read_half,
            tx,
            shutdown.clone(),
            channel.clone(),
        ));

        sleep(JOIN_SETTLE_DELAY).await;

        Ok(Self {
            channel,
            writer,
            mailbox,
            shutdown,
        })
    }

    pub async fn send_message(&mut self, text: &str) -> Result<(), TwitchError> {
        let line = format!("PRIVMSG #{} :{}\r\n", self.channel, text);
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Drop everything buffered so far; called when a vote round opens so
    /// only messages sent inside the window count.
    pub fn discard_pending(&mut self) {
        while self.mailbox.try_recv().is_ok() {}
    }

    /// Collect inbound messages for exactly `window`; the vote round is a
    /// fixed wait and never closes early.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<ChatMessage> {
        let deadline = Instant::now() + window;
        let mut collected = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, self.mailbox.recv()).await {
                Ok(Some(message)) => collected.push(message),
                // Drain task is gone; wait out the rest of the window so the
                // round length stays fixed.
                Ok(None) => {
                    sleep(deadline.saturating_duration_since(Instant::now())).await;
                    break;
                }
                Err(_) => break,
            }
        }
        collected
    }

    /// Stop the drain task and release the connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TwitchSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn drain_messages(
    read_half: OwnedReadHalf,
    tx: mpsc::Sender<ChatMessage>,
    shutdown: CancellationToken,
    channel: String,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(channel, "chat drain cancelled");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(message) = parse_privmsg(&line) else {
                        continue;
                    };
                    match tx.try_send(message) {
                        Ok(()) => {}
                        Err(TrySendError::Full(dropped)) => {
                            warn!(
                                channel,
                                username = %dropped.username,
                                "chat mailbox full; dropping message"
                            );
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                Ok(None) => {
                    debug!(channel, "twitch connection closed");
                    break;
                }
                Err(err) => {
                    warn!(channel, error = %err, "twitch read failed");
                    break;
                }
            }
        }
    }
}

/// `:<user>!<user>@<user>.tmi.twitch.tv PRIVMSG #<channel> :<text>`
fn parse_privmsg(line: &str) -> Option<ChatMessage> {
    let rest = line.strip_prefix(':')?;
    let (prefix, rest) = rest.split_once(" PRIVMSG ")?;
    let (username, _) = prefix.split_once('!')?;
    if username.is_empty() {
        return None;
    }
    let (_target, text) = rest.split_once(" :")?;
    Some(ChatMessage {
        username: username.to_string(),
        text: text.trim_end_matches(['\r', '\n']).trim().to_string(),
    })
}
