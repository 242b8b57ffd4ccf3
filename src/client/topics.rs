//! Well-known operational topics and their default priorities.

use crate::broker::message::{Priority, PublishOptions};

pub const SERVICE_REGISTER: &str = "service.register";
pub const SERVICE_STATUS: &str = "service.status";
pub const HEALTH_CHECK: &str = "health-check";
pub const SYSTEM_ALERT: &str = "system.alert";

/// Default priority for a bare topic name.
pub fn default_priority(topic: &str) -> Priority {
    match topic {
        SERVICE_REGISTER | HEALTH_CHECK => Priority::High,
        SYSTEM_ALERT => Priority::Critical,
        _ => Priority::Normal,
    }
}

/// Caller overrides merged over the topic's defaults; the caller wins.
pub fn options_for(topic: &str, overrides: PublishOptions) -> PublishOptions {
    overrides.merged_over(&PublishOptions::with_priority(default_priority(topic)))
}

pub fn scoped(service: &str, topic: &str) -> String {
    format!("{service}.{topic}")
}
