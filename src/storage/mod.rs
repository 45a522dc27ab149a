pub mod access_logger;
pub mod models;
pub mod store;

pub use access_logger::{AccessLogger, ImageArchive};
pub use models::{AccessEvent, EventFilter, EventSource, Outcome, User};
pub use store::{PersistentStore, StoreOptions};
