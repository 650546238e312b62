//! Bridge configuration
//!
//! [`Config`] can be embedded in a host's own configuration file through
//! serde, or built from environment variables with [`Config::from_env`].
//! Every field has a default so partial documents are accepted.

use std::env;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Environment variable holding the broker address
pub const SERVER_ENV: &str = "NATS_CABLE_SERVER";

/// Environment variable holding the shutdown timeout, in milliseconds
pub const SHUTDOWN_TIMEOUT_ENV: &str = "CABLEBRIDGE_SHUTDOWN_TIMEOUT_MS";

/// Environment variable selecting the transport, `nats` or `local`
pub const TRANSPORT_ENV: &str = "CABLEBRIDGE_TRANSPORT";

/// Broker address used when none is configured
pub const DEFAULT_SERVER: &str = "127.0.0.1";

/// Default upper bound on how long shutdown waits for the listener
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Name of the thread that serializes subscribe/unsubscribe commands
pub const DEFAULT_LISTENER_THREAD_NAME: &str = "cablebridge-listener";

/// Which broker the bridge talks to
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// A NATS server at `server`
    #[default]
    Nats,

    /// The in-process broker, for a single node
    Local,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub transport: TransportKind,

    /// Address handed to the transport when connecting
    pub server: String,

    /// How long `shutdown` may block, in milliseconds
    pub shutdown_timeout_ms: u64,

    /// Thread name for the listener, shows up in logs
    pub listener_thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            server: DEFAULT_SERVER.to_string(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            listener_thread_name: DEFAULT_LISTENER_THREAD_NAME.to_string(),
        }
    }
}

impl Config {
    /// Builds a config from the environment, falling back to defaults for
    /// anything unset. Unparsable values are logged and replaced by their
    /// default.
    pub fn from_env() -> Self {
        let server = env::var(SERVER_ENV)
            .unwrap_or_else(|_| DEFAULT_SERVER.to_string());

        Self {
            transport: parse_transport(env::var(TRANSPORT_ENV).ok()),
            server,
            shutdown_timeout_ms: parse_shutdown_timeout(env::var(SHUTDOWN_TIMEOUT_ENV).ok()),
            ..Default::default()
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_server<S>(mut self, server: S) -> Self
    where
        S: Into<String>,
    {
        self.server = server.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn parse_shutdown_timeout(raw: Option<String>) -> u64 {
    let Some(raw) = raw else {
        return DEFAULT_SHUTDOWN_TIMEOUT_MS;
    };
    match raw.trim().parse() {
        Ok(ms) => ms,
        Err(e) => {
            warn!(
                "Ignoring {}={:?} ({}), using {}ms",
                SHUTDOWN_TIMEOUT_ENV, raw, e, DEFAULT_SHUTDOWN_TIMEOUT_MS
            );
            DEFAULT_SHUTDOWN_TIMEOUT_MS
        },
    }
}

fn parse_transport(raw: Option<String>) -> TransportKind {
    let Some(raw) = raw else {
        return TransportKind::default();
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "nats" => TransportKind::Nats,
        "local" => TransportKind::Local,
        _ => {
            warn!("Ignoring {}={:?}, using nats", TRANSPORT_ENV, raw);
            TransportKind::default()
        },
    }
}
