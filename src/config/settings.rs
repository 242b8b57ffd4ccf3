use serde::Deserialize;

/// Top-level configuration settings for a bus-hosting service.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub bus: BusSettings,
    pub persistence: PersistenceSettings,
    pub gateway: GatewaySettings,
    pub logging: LoggingSettings,
}

/// Scheduler and delivery tuning.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BusSettings {
    /// Interval between scheduler ticks.
    pub tick_interval_ms: u64,
    /// Starting backoff for a new entry. Each failed attempt doubles it before
    /// scheduling, so the first redelivery waits twice this long.
    pub initial_backoff_ms: u64,
    /// Upper bound for the redelivery delay.
    pub max_backoff_ms: u64,
    /// How long a tick waits for its handler batch before moving on.
    pub handler_timeout_ms: u64,
    /// How long an idempotency key suppresses repeats on the same topic.
    pub dedup_window_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    File,
    Sled,
    Memory,
}

/// Where critical-tier messages are kept.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PersistenceSettings {
    pub backend: PersistenceBackend,
    /// Root directory; each service gets its own subdirectory.
    pub dir: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GatewaySettings {
    /// Name of the coordinator service that accepts registrations.
    pub service: String,
    pub registration_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub bus: Option<PartialBusSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub gateway: Option<PartialGatewaySettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBusSettings {
    pub tick_interval_ms: Option<u64>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub handler_timeout_ms: Option<u64>,
    pub dedup_window_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPersistenceSettings {
    pub backend: Option<PersistenceBackend>,
    pub dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialGatewaySettings {
    pub service: Option<String>,
    pub registration_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bus: BusSettings::default(),
            persistence: PersistenceSettings {
                backend: PersistenceBackend::File,
                dir: "data/messages".to_string(),
            },
            gateway: GatewaySettings {
                service: "api-gateway".to_string(),
                registration_timeout_ms: 10_000,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            handler_timeout_ms: 30_000,
            dedup_window_ms: 5 * 60 * 1_000,
        }
    }
}

impl PartialSettings {
    /// Overlay the values present here on top of `default`.
    pub fn merge_into(self, default: Settings) -> Settings {
        let bus = self.bus.unwrap_or_default();
        let persistence = self.persistence.unwrap_or_default();
        let gateway = self.gateway.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            bus: BusSettings {
                tick_interval_ms: bus.tick_interval_ms.unwrap_or(default.bus.tick_interval_ms),
                initial_backoff_ms: bus
                    .initial_backoff_ms
                    .unwrap_or(default.bus.initial_backoff_ms),
                max_backoff_ms: bus.max_backoff_ms.unwrap_or(default.bus.max_backoff_ms),
                handler_timeout_ms: bus
                    .handler_timeout_ms
                    .unwrap_or(default.bus.handler_timeout_ms),
                dedup_window_ms: bus.dedup_window_ms.unwrap_or(default.bus.dedup_window_ms),
            },
            persistence: PersistenceSettings {
                backend: persistence
                    .backend
                    .unwrap_or(default.persistence.backend),
                dir: persistence.dir.unwrap_or(default.persistence.dir),
            },
            gateway: GatewaySettings {
                service: gateway.service.unwrap_or(default.gateway.service),
                registration_timeout_ms: gateway
                    .registration_timeout_ms
                    .unwrap_or(default.gateway.registration_timeout_ms),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}
