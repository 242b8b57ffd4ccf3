//! # servicebus
//!
//! `servicebus` is the in-process message bus the business-setup services use
//! to register, broadcast status and coordinate work. It provides
//! priority-derived delivery budgets, at-least-once delivery with exponential
//! backoff, disk durability for critical messages, and request/response on
//! top of publish/subscribe.
//!
//! ## Core Modules
//!
//! - `broker`: message envelope, subscription registry, delivery queue and
//!   scheduler, request/response correlation.
//! - `client`: the per-service `ServiceCommunicator` façade.
//! - `config`: loading settings from file and environment.
//! - `persistence`: durable storage for critical-tier messages.
//! - `registry`: the explicit per-service registry of buses and communicators.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod registry;
pub mod utils;

pub use broker::{Message, MessageBus, Priority, PublishOptions, RequestOptions, Subscription};
pub use client::ServiceCommunicator;
pub use registry::BusRegistry;
pub use utils::BusError;
