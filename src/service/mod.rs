pub mod admin;
pub mod client;
pub mod listener;
pub mod protocol;
pub mod remote;
pub mod supervisor;
pub mod wire;

pub use admin::{parse_upload_filename, AdminService, UploadName};
pub use client::{AdminClient, RemoteClient};
pub use listener::SocketListener;
pub use protocol::{AdminRequest, AdminResponse, RemoteMessage, RemoteReply, UploadReceipt};
pub use remote::{
    sign_message, CommandSource, QueueCommandSource, RemoteCommand, RemoteCommandChannel,
    SocketCommandSource,
};
pub use supervisor::{Supervisor, WorkerOutcome, WorkerReport};
