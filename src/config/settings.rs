use serde::Deserialize;

/// Top-level configuration settings for the broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub persistence: PersistenceSettings,
    pub logging: LoggingSettings,
}

/// Dispatch and retention knobs.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    /// Prefetch used when a consumer does not ask for one.
    pub default_prefetch: u32,
    /// How many recent messages a topic keeps for retroactive subscribers.
    pub retroactive_backlog: usize,
    /// Bound on messages held for a disconnected durable subscription.
    pub durable_pending_limit: usize,
    /// Bound on matched-but-undispatched topic messages per live consumer.
    pub subscriber_pending_limit: usize,
    /// Queue that receives poison-acknowledged messages.
    pub dead_letter_queue: String,
    /// Capacity of the command channel in front of the decision loop.
    pub command_buffer: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PersistenceSettings {
    pub backend: PersistenceBackend,
    /// Database directory, used by the `sled` backend.
    pub path: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    /// Include the emitting module in each line.
    pub targets: bool,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub default_prefetch: Option<u32>,
    pub retroactive_backlog: Option<usize>,
    pub durable_pending_limit: Option<usize>,
    pub subscriber_pending_limit: Option<usize>,
    pub dead_letter_queue: Option<String>,
    pub command_buffer: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialPersistenceSettings {
    pub backend: Option<PersistenceBackend>,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
    pub targets: Option<bool>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            default_prefetch: 1000,
            retroactive_backlog: 100,
            durable_pending_limit: 10_000,
            subscriber_pending_limit: 10_000,
            dead_letter_queue: "DLQ".to_string(),
            command_buffer: 1024,
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Memory,
            path: "relaymq_db".to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            targets: false,
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            persistence: PersistenceSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl PartialSettings {
    /// Overlay whatever was configured on top of the defaults.
    pub fn merge_onto(self, default: Settings) -> Settings {
        let broker = self.broker;
        let persistence = self.persistence;
        let logging = self.logging;

        Settings {
            broker: BrokerSettings {
                default_prefetch: broker
                    .as_ref()
                    .and_then(|b| b.default_prefetch)
                    .unwrap_or(default.broker.default_prefetch),
                retroactive_backlog: broker
                    .as_ref()
                    .and_then(|b| b.retroactive_backlog)
                    .unwrap_or(default.broker.retroactive_backlog),
                durable_pending_limit: broker
                    .as_ref()
                    .and_then(|b| b.durable_pending_limit)
                    .unwrap_or(default.broker.durable_pending_limit),
                subscriber_pending_limit: broker
                    .as_ref()
                    .and_then(|b| b.subscriber_pending_limit)
                    .unwrap_or(default.broker.subscriber_pending_limit),
                dead_letter_queue: broker
                    .as_ref()
                    .and_then(|b| b.dead_letter_queue.clone())
                    .unwrap_or(default.broker.dead_letter_queue),
                command_buffer: broker
                    .as_ref()
                    .and_then(|b| b.command_buffer)
                    .unwrap_or(default.broker.command_buffer),
            },
            persistence: PersistenceSettings {
                backend: persistence
                    .as_ref()
                    .and_then(|p| p.backend)
                    .unwrap_or(default.persistence.backend),
                path: persistence
                    .as_ref()
                    .and_then(|p| p.path.clone())
                    .unwrap_or(default.persistence.path),
            },
            logging: LoggingSettings {
                level: logging
                    .as_ref()
                    .and_then(|l| l.level.clone())
                    .unwrap_or(default.logging.level),
                targets: logging
                    .as_ref()
                    .and_then(|l| l.targets)
                    .unwrap_or(default.logging.targets),
            },
        }
    }
}
