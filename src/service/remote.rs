use crate::common::config::RemoteConfig;
use crate::common::{FaceLockError, MalformedInput, Result};
use crate::core::{AccessControlEngine, Decision};
use crate::service::listener::SocketListener;
use crate::service::protocol::{RemoteMessage, RemoteReply};
use crate::service::wire::{read_frame, write_frame};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const QUEUE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Unlock,
    Lock,
}

impl RemoteCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteCommand::Unlock => "unlock",
            RemoteCommand::Lock => "lock",
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteCommand {
    type Err = MalformedInput;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("unlock") {
            Ok(RemoteCommand::Unlock)
        } else if trimmed.eq_ignore_ascii_case("lock") {
            Ok(RemoteCommand::Lock)
        } else {
            Err(MalformedInput::UnknownCommand(trimmed.to_string()))
        }
    }
}

/// Validates remote messages and feeds them to the engine.
pub struct RemoteCommandChannel {
    engine: Arc<AccessControlEngine>,
    topic: String,
    secret: Option<Vec<u8>>,
    max_clock_skew: i64,
}

impl RemoteCommandChannel {
    pub fn new(engine: Arc<AccessControlEngine>, config: &RemoteConfig) -> Self {
        Self {
            engine,
            topic: config.topic.clone(),
            secret: config.shared_secret.as_ref().map(|s| s.as_bytes().to_vec()),
            max_clock_skew: config.max_clock_skew_secs as i64,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Checks topic, signature and freshness, then parses the payload.
    pub fn parse(&self, message: &RemoteMessage, now: i64) -> std::result::Result<RemoteCommand, MalformedInput> {
        if message.topic != self.topic {
            return Err(MalformedInput::WrongTopic {
                expected: self.topic.clone(),
                got: message.topic.clone(),
            });
        }

        if let Some(secret) = &self.secret {
            let signature = message
                .signature
                .as_deref()
                .and_then(|text| hex::decode(text).ok())
                .ok_or(MalformedInput::BadSignature)?;
            let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| MalformedInput::BadSignature)?;
            mac.update(&signing_input(&message.topic, &message.payload, message.issued_at));
            mac.verify_slice(&signature)
                .map_err(|_| MalformedInput::BadSignature)?;

            if (now - message.issued_at).abs() > self.max_clock_skew {
                return Err(MalformedInput::StaleCommand {
                    issued_at: message.issued_at,
                });
            }
        }

        message.payload.parse()
    }

    pub fn execute(&self, command: RemoteCommand) -> Result<RemoteReply> {
        match command {
            RemoteCommand::Unlock => {
                let decision = self.engine.remote_unlock()?;
                let detail = match decision {
                    Decision::Admitted(_) => "door unlocked".to_string(),
                    Decision::Denied(event) => format!(
                        "unlock failed: {}",
                        event.error.unwrap_or_else(|| "unknown error".into())
                    ),
                    Decision::NoFace => "no decision".to_string(),
                };
                Ok(RemoteReply::Accepted {
                    command: command.to_string(),
                    detail,
                })
            }
            RemoteCommand::Lock => {
                self.engine.remote_lock()?;
                Ok(RemoteReply::Accepted {
                    command: command.to_string(),
                    detail: "door locked".to_string(),
                })
            }
        }
    }

    /// Full handling of one message. Malformed messages change nothing.
    pub fn handle(&self, message: &RemoteMessage) -> RemoteReply {
        let command = match self.parse(message, Utc::now().timestamp()) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Rejected remote message: {}", e);
                return RemoteReply::Rejected(FaceLockError::from(e).to_string());
            }
        };

        self.execute(command).unwrap_or_else(|e| {
            tracing::error!("Remote {} failed: {}", command, e);
            RemoteReply::Rejected(e.to_string())
        })
    }
}

/// Delivers remote messages to the channel. Implementations own the transport.
pub trait CommandSource: Send {
    fn serve(&mut self, channel: &RemoteCommandChannel, shutdown: &AtomicBool) -> Result<()>;
}

/// Length-prefixed bincode messages on a local Unix socket.
pub struct SocketCommandSource {
    listener: SocketListener,
}

impl SocketCommandSource {
    pub fn new(listener: SocketListener) -> Self {
        Self { listener }
    }
}

impl CommandSource for SocketCommandSource {
    fn serve(&mut self, channel: &RemoteCommandChannel, shutdown: &AtomicBool) -> Result<()> {
        self.listener.serve(shutdown, |mut stream| {
            while let Some(message) = read_frame::<_, RemoteMessage>(&mut stream)? {
                let reply = channel.handle(&message);
                write_frame(&mut stream, &reply)?;
            }
            Ok(())
        })
    }
}

/// In-process source fed through a channel. Stops when every sender is gone.
pub struct QueueCommandSource {
    inbox: Receiver<RemoteMessage>,
    replies: Sender<RemoteReply>,
}

impl QueueCommandSource {
    pub fn pair() -> (Self, Sender<RemoteMessage>, Receiver<RemoteReply>) {
        let (message_tx, message_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        let source = Self {
            inbox: message_rx,
            replies: reply_tx,
        };
        (source, message_tx, reply_rx)
    }
}

impl CommandSource for QueueCommandSource {
    fn serve(&mut self, channel: &RemoteCommandChannel, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::SeqCst) {
            match self.inbox.recv_timeout(QUEUE_POLL) {
                Ok(message) => {
                    let reply = channel.handle(&message);
                    // the sender may have stopped listening for replies
                    let _ = self.replies.send(reply);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }
}

fn signing_input(topic: &str, payload: &str, issued_at: i64) -> Vec<u8> {
    format!("{}\n{}\n{}", topic, payload, issued_at).into_bytes()
}

/// Hex HMAC-SHA256 over topic, payload and issue time.
pub fn sign_message(secret: &str, topic: &str, payload: &str, issued_at: i64) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC takes keys of any length
        Err(_) => return String::new(),
    };
    mac.update(&signing_input(topic, payload, issued_at));
    hex::encode(mac.finalize().into_bytes())
}
