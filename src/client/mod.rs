//! The `client` module is what a service sees of the bus.
//!
//! `ServiceCommunicator` wraps a shared `MessageBus` under one service name:
//! direct and broadcast publishing, dual-scoped subscriptions, typed
//! request/response, gateway registration, health checks and status
//! broadcasts.

pub mod communicator;
pub mod protocol;
pub mod topics;

pub use communicator::ServiceCommunicator;
pub use protocol::{HealthReport, HealthStatus, RegistrationAck, ServiceInfo, StatusUpdate};
