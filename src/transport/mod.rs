//! Broker transport contract
//!
//! The bridge never speaks a broker wire protocol itself. Anything that can
//! connect, publish, and hand out per-channel subscriptions that push
//! messages from their own delivery thread can sit behind [`Transport`].
//!
//! [`NatsTransport`] talks to a NATS server and is what a deployment runs
//! on. [`LocalBroker`] is the in-process implementation, used for
//! single-node setups and throughout the tests.

mod local;
mod nats;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::{Config, TransportKind};
use crate::error::Result;

pub use self::local::LocalBroker;
pub use self::nats::NatsTransport;

/// A message pushed by the broker for a channel we subscribed to
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message was published on
    pub channel: String,

    /// Opaque payload, delivered exactly as published
    pub payload: Bytes,
}

impl Message {
    pub fn new<S>(channel: S, payload: Bytes) -> Self
    where
        S: Into<String>,
    {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("channel", &self.channel)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Invoked by the transport, on its own delivery thread, for every message
/// on a subscribed channel
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Something that can open connections to a broker
pub trait Transport: Send + Sync {
    fn connect(&self, address: &str) -> Result<Arc<dyn Connection>>;
}

/// A live connection to the broker
pub trait Connection: Send + Sync {
    /// Publishes `payload` to every subscriber of `channel`, ourselves included
    fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Opens a broker-level subscription. `handler` keeps firing until the
    /// returned handle is unsubscribed.
    fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>>;
}

/// Handle to one broker-level subscription
pub trait Subscription: Send {
    fn channel(&self) -> &str;

    /// Tears the subscription down. Messages published after this returns
    /// never reach the handler.
    fn unsubscribe(self: Box<Self>) -> Result<()>;
}

/// Builds the transport selected by `config`
pub fn from_config(config: &Config) -> Arc<dyn Transport> {
    match config.transport {
        TransportKind::Nats => Arc::new(NatsTransport::new()),
        TransportKind::Local => Arc::new(LocalBroker::new()),
    }
}
