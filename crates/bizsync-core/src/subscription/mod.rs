pub mod manager;
pub mod topic;

pub use manager::{EventSink, ResolvedEvent, SinkId, SubscriptionHandle, SubscriptionManager};
pub use topic::{EventFilter, Topic};
