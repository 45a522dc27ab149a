use crate::common::{FaceLockError, Result};
use crate::service::protocol::{AdminRequest, AdminResponse, RemoteMessage, RemoteReply, UploadReceipt};
use crate::service::remote::sign_message;
use crate::service::wire::{read_frame, write_frame};
use crate::storage::{AccessEvent, EventFilter, User};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn connect_with_retry(socket_path: &Path, max_retries: u32) -> Result<UnixStream> {
    let mut last_error = None;
    for attempt in 0..max_retries.max(1) {
        match UnixStream::connect(socket_path) {
            Ok(stream) => {
                stream.set_read_timeout(Some(Duration::from_secs(30)))?;
                stream.set_write_timeout(Some(Duration::from_secs(10)))?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!("Connect to {} failed (attempt {}): {}", socket_path.display(), attempt + 1, e);
                last_error = Some(e);
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }

    Err(FaceLockError::Other(anyhow::anyhow!(
        "Failed to connect to {}: {}. Is facelock-service running?",
        socket_path.display(),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn round_trip<Req: Serialize, Resp: DeserializeOwned>(socket_path: &Path, request: &Req) -> Result<Resp> {
    let mut stream = connect_with_retry(socket_path, 3)?;
    write_frame(&mut stream, request)?;
    read_frame(&mut stream)?
        .ok_or_else(|| FaceLockError::Protocol("service closed the connection without replying".into()))
}

/// Client for the admin socket.
pub struct AdminClient {
    socket_path: PathBuf,
}

impl AdminClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        match self.request(&AdminRequest::ListUsers)? {
            AdminResponse::Users(users) => Ok(users),
            other => Err(unexpected(other)),
        }
    }

    pub fn upload(&self, filename: &str, content: Vec<u8>) -> Result<UploadReceipt> {
        let request = AdminRequest::UploadImage {
            filename: filename.to_string(),
            content,
        };
        match self.request(&request)? {
            AdminResponse::Uploaded(receipt) => Ok(receipt),
            other => Err(unexpected(other)),
        }
    }

    pub fn list_events(&self, filter: EventFilter) -> Result<Vec<AccessEvent>> {
        match self.request(&AdminRequest::ListEvents(filter))? {
            AdminResponse::Events(events) => Ok(events),
            other => Err(unexpected(other)),
        }
    }

    fn request(&self, request: &AdminRequest) -> Result<AdminResponse> {
        round_trip(&self.socket_path, request)
    }
}

fn unexpected(response: AdminResponse) -> FaceLockError {
    match response {
        AdminResponse::Error(msg) => FaceLockError::Other(anyhow::anyhow!("Service error: {}", msg)),
        other => FaceLockError::Protocol(format!("unexpected response: {:?}", other)),
    }
}

/// Client for the remote command socket.
pub struct RemoteClient {
    socket_path: PathBuf,
    topic: String,
    secret: Option<String>,
}

impl RemoteClient {
    pub fn new(socket_path: impl Into<PathBuf>, topic: &str, secret: Option<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            topic: topic.to_string(),
            secret,
        }
    }

    pub fn message(&self, payload: &str) -> RemoteMessage {
        let issued_at = chrono::Utc::now().timestamp();
        let signature = self
            .secret
            .as_deref()
            .map(|secret| sign_message(secret, &self.topic, payload, issued_at));
        RemoteMessage {
            topic: self.topic.clone(),
            payload: payload.to_string(),
            issued_at,
            signature,
        }
    }

    pub fn send(&self, payload: &str) -> Result<RemoteReply> {
        round_trip(&self.socket_path, &self.message(payload))
    }
}
