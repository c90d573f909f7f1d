use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the server address, the broker engine, the
/// publisher/subscriber clients and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub client: ClientSettings,
    pub log: LogSettings,
}

/// Address clients connect to. The broker binds `bind_host` on the same port.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Configuration settings for the broker engine.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub bind_host: String,
    pub sweep_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Largest accepted frame, header and status included.
    pub max_frame_size: usize,
}

impl BrokerSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Retry and timing knobs shared by the publisher and the subscriber.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    pub publish_retries: u32,
    pub subscribe_retries: u32,
    pub backoff_base_ms: u64,
    pub keepalive_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub quit_linger_ms: u64,
    /// Largest frame a client will send or accept.
    pub max_frame_size: usize,
}

impl ClientSettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quit_linger(&self) -> Duration {
        Duration::from_millis(self.quit_linger_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
/// `IP` and `PORT` at the top level come from flat key=value files.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    #[serde(alias = "IP")]
    pub ip: Option<String>,
    #[serde(alias = "PORT")]
    pub port: Option<u16>,
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub client: Option<PartialClientSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub bind_host: Option<String>,
    pub sweep_interval_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub max_frame_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub publish_retries: Option<u32>,
    pub subscribe_retries: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub keepalive_interval_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub quit_linger_ms: Option<u64>,
    pub max_frame_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `default`. Flat `IP`/`PORT` keys lose to
    /// an explicit `[server]` section.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let client = self.client.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.or(self.ip).unwrap_or(default.server.host),
                port: server.port.or(self.port).unwrap_or(default.server.port),
            },
            broker: BrokerSettings {
                bind_host: broker.bind_host.unwrap_or(default.broker.bind_host),
                sweep_interval_ms: broker
                    .sweep_interval_ms
                    .unwrap_or(default.broker.sweep_interval_ms),
                handshake_timeout_ms: broker
                    .handshake_timeout_ms
                    .unwrap_or(default.broker.handshake_timeout_ms),
                send_timeout_ms: broker
                    .send_timeout_ms
                    .unwrap_or(default.broker.send_timeout_ms),
                max_frame_size: broker
                    .max_frame_size
                    .unwrap_or(default.broker.max_frame_size),
            },
            client: ClientSettings {
                publish_retries: client
                    .publish_retries
                    .unwrap_or(default.client.publish_retries),
                subscribe_retries: client
                    .subscribe_retries
                    .unwrap_or(default.client.subscribe_retries),
                backoff_base_ms: client
                    .backoff_base_ms
                    .unwrap_or(default.client.backoff_base_ms),
                keepalive_interval_ms: client
                    .keepalive_interval_ms
                    .unwrap_or(default.client.keepalive_interval_ms),
                poll_interval_ms: client
                    .poll_interval_ms
                    .unwrap_or(default.client.poll_interval_ms),
                quit_linger_ms: client
                    .quit_linger_ms
                    .unwrap_or(default.client.quit_linger_ms),
                max_frame_size: client
                    .max_frame_size
                    .unwrap_or(default.client.max_frame_size),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 9999,
            },
            broker: BrokerSettings::default(),
            client: ClientSettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            sweep_interval_ms: 300,
            handshake_timeout_ms: 3000,
            send_timeout_ms: 1000,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            publish_retries: 3,
            subscribe_retries: 10,
            backoff_base_ms: 100,
            keepalive_interval_ms: 300,
            poll_interval_ms: 100,
            quit_linger_ms: 100,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}
