//! Per-service bus registry
//!
//! Process startup code owns a `BusRegistry` and hands it (or the buses and
//! communicators it produces) to whatever needs to talk on the bus. There is
//! one bus and one communicator per service name; asking again returns the
//! same instances.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::broker::engine::MessageBus;
use crate::client::ServiceCommunicator;
use crate::config::Settings;
use crate::persistence::{self, MessageStore, NoopStore};

#[derive(Debug)]
pub struct BusRegistry {
    settings: Settings,
    buses: Mutex<HashMap<String, Arc<MessageBus>>>,
    communicators: Mutex<HashMap<String, Arc<ServiceCommunicator>>>,
}

impl BusRegistry {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            buses: Mutex::new(HashMap::new()),
            communicators: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The running bus for `service`, created and started on first use.
    pub async fn bus(&self, service: &str) -> Arc<MessageBus> {
        let mut buses = self.buses.lock().await;
        if let Some(bus) = buses.get(service) {
            return Arc::clone(bus);
        }

        let store: Arc<dyn MessageStore> =
            match persistence::open_store(&self.settings.persistence, service) {
                Ok(store) => store,
                Err(e) => {
                    error!(service, error = %e, "durable store unavailable, running in memory");
                    Arc::new(NoopStore)
                }
            };
        let bus = MessageBus::new(service, self.settings.bus.clone(), store);
        bus.start().await;
        buses.insert(service.to_string(), Arc::clone(&bus));
        bus
    }

    /// The communicator for `service`, backed by that service's bus.
    pub async fn communicator(&self, service: &str) -> Arc<ServiceCommunicator> {
        if let Some(existing) = self.communicators.lock().await.get(service) {
            return Arc::clone(existing);
        }

        let bus = self.bus(service).await;
        let mut communicators = self.communicators.lock().await;
        let communicator = communicators
            .entry(service.to_string())
            .or_insert_with(|| {
                ServiceCommunicator::new(service, bus, self.settings.gateway.clone())
            });
        Arc::clone(communicator)
    }

    /// A communicator for `service` that talks on `host`'s bus, so both
    /// services can reach each other in one process. Returns the existing
    /// communicator if `service` is already known.
    pub async fn attach(&self, service: &str, host: &str) -> Arc<ServiceCommunicator> {
        if let Some(existing) = self.communicators.lock().await.get(service) {
            return Arc::clone(existing);
        }

        let bus = self.bus(host).await;
        let mut communicators = self.communicators.lock().await;
        let communicator = communicators
            .entry(service.to_string())
            .or_insert_with(|| {
                ServiceCommunicator::new(service, bus, self.settings.gateway.clone())
            });
        Arc::clone(communicator)
    }

    /// Shut down `service`'s communicator and stop its bus.
    pub async fn shutdown(&self, service: &str) {
        if let Some(communicator) = self.communicators.lock().await.remove(service) {
            communicator.shutdown();
        }
        if let Some(bus) = self.buses.lock().await.remove(service) {
            bus.stop();
            info!(service, "bus released");
        }
    }

    pub async fn shutdown_all(&self) {
        let mut services: Vec<String> = self.buses.lock().await.keys().cloned().collect();
        services.extend(self.communicators.lock().await.keys().cloned());
        services.sort();
        services.dedup();
        for service in services {
            self.shutdown(&service).await;
        }
    }

    pub async fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buses.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}
