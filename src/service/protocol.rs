use crate::storage::{AccessEvent, EventFilter, User};
use serde::{Deserialize, Serialize};

// Admin socket
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum AdminRequest {
    ListUsers,
    UploadImage { filename: String, content: Vec<u8> },
    ListEvents(EventFilter),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum AdminResponse {
    Users(Vec<User>),
    Uploaded(UploadReceipt),
    Events(Vec<AccessEvent>),
    Error(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UploadReceipt {
    pub user: User,
    /// False when the label already existed and was re-enrolled.
    pub created: bool,
    pub template_refreshed: bool,
}

// Remote command socket
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    pub topic: String,
    pub payload: String,
    /// Unix seconds at the sender.
    pub issued_at: i64,
    /// Hex HMAC-SHA256, required when a shared secret is configured.
    pub signature: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RemoteReply {
    Accepted { command: String, detail: String },
    Rejected(String),
}

impl RemoteReply {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RemoteReply::Accepted { .. })
    }
}
