pub mod correlation;
pub mod engine;
pub mod message;
pub mod topic;

pub use correlation::{PendingRequests, RequestOptions};
pub use engine::{MessageBus, QueueStats, Subscription, TickReport};
pub use message::{Message, Priority, PublishOptions, QueueEntry};
pub use topic::{Handler, handler};

#[cfg(test)]
mod tests;
