pub mod attachment;
pub mod backend;
pub mod config;
pub mod constants;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod models;
pub mod session;
pub mod stats;
pub mod subscription;

pub use config::SyncConfig;
pub use error::{AttachmentError, BackendError, SyncError};
pub use session::{ConversationView, SyncSession};
