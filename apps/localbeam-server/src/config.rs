use std::env;
use std::time::Duration;

use localbeam_proto::{DEFAULT_PORT, DEFAULT_SERVICE_NAME, DISCOVERY_TIMEOUT};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_host: String,
    pub port: u16,
    pub service_name: String,
    pub advertise: bool,
    pub discovery_timeout: Duration,
    pub connection_buffer: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_host: env::var("LOCALBEAM_BIND").unwrap_or(defaults.bind_host),
            port: env::var("LOCALBEAM_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            service_name: env::var("LOCALBEAM_SERVICE_NAME").unwrap_or(defaults.service_name),
            advertise: env::var("LOCALBEAM_ADVERTISE")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.advertise),
            discovery_timeout: env::var("LOCALBEAM_DISCOVERY_TIMEOUT_MS")
                .ok()
                .and_then(|ms| ms.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.discovery_timeout),
            connection_buffer: env::var("LOCALBEAM_CONNECTION_BUFFER")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(defaults.connection_buffer),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    /// Loopback config on an ephemeral port with advertisement off.
    pub fn local_ephemeral() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            advertise: false,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            advertise: true,
            discovery_timeout: DISCOVERY_TIMEOUT,
            connection_buffer: 64,
        }
    }
}
