//! Application-wide constants
//!
//! Table names, column names and defaults shared between the components
//! and the backends.

/// Table holding conversation messages
pub const MESSAGES_TABLE: &str = "messages";

/// Table holding notification feed rows
pub const NOTIFICATIONS_TABLE: &str = "notifications";

/// Default bucket for uploaded attachments
pub const ATTACHMENT_BUCKET: &str = "attachments";

// Size caps
pub const MIB: u64 = 1024 * 1024;
pub const IMAGE_MAX_BYTES: u64 = 5 * MIB;
pub const AUDIO_MAX_BYTES: u64 = 10 * MIB;
pub const FILE_MAX_BYTES: u64 = 20 * MIB;

/// Prefix for client-side temporary message ids
pub const TEMP_ID_PREFIX: &str = "tmp-";

pub mod columns {
    pub const ID: &str = "id";
    pub const CONVERSATION_ID: &str = "conversation_id";
    pub const AUTHOR_ID: &str = "author_id";
    pub const BODY: &str = "body";
    pub const ATTACHMENT_URL: &str = "attachment_url";
    pub const KIND: &str = "kind";
    pub const CREATED_AT: &str = "created_at";
    pub const CLIENT_KEY: &str = "client_key";
    pub const USER_ID: &str = "user_id";
    pub const SOURCE_DOMAIN: &str = "source_domain";
    pub const PAYLOAD: &str = "payload";
    pub const READ: &str = "read";
}
