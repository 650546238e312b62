//! NATS broker over the synchronous `nats` client
//!
//! Each broker-level subscription gets its own handler thread from the
//! client, which is where the bridge's fan-out runs.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};

use crate::error::{Error, Result};

use super::{Connection, Message, MessageHandler, Subscription, Transport};

/// Connection name reported to the server
const CLIENT_NAME: &str = "cablebridge";

/// Connects to a NATS server, one client connection per `connect` call
#[derive(Clone, Debug, Default)]
pub struct NatsTransport;

impl NatsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for NatsTransport {
    fn connect(&self, address: &str) -> Result<Arc<dyn Connection>> {
        let conn = nats::Options::new()
            .with_name(CLIENT_NAME)
            .connect(address)
            .map_err(|e| unreachable_at(address, e))?;

        info!("Connected to NATS at {}", address);
        Ok(Arc::new(NatsConnection { conn }))
    }
}

fn unreachable_at(address: &str, e: io::Error) -> Error {
    Error::unavailable(format!("{}: {}", address, e))
}

fn io_unavailable(e: io::Error) -> Error {
    Error::unavailable(e.to_string())
}

struct NatsConnection {
    conn: nats::Connection,
}

impl Connection for NatsConnection {
    fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.conn.publish(channel, &payload).map_err(io_unavailable)
    }

    fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>> {
        let handle = self
            .conn
            .subscribe(channel)
            .map_err(io_unavailable)?
            .with_handler(move |msg: nats::Message| {
                handler(Message::new(msg.subject, Bytes::from(msg.data)));
                Ok(())
            });

        // the SUB has to reach the server before callers treat the
        // subscription as active
        self.conn.flush().map_err(io_unavailable)?;

        debug!("Subscribed to {}", channel);
        Ok(Box::new(NatsSubscription {
            channel: channel.to_string(),
            handle,
        }))
    }
}

struct NatsSubscription {
    channel: String,
    handle: nats::Handler,
}

impl Subscription for NatsSubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn unsubscribe(self: Box<Self>) -> Result<()> {
        let NatsSubscription { channel, handle } = *self;
        handle.unsubscribe().map_err(io_unavailable)?;
        debug!("Unsubscribed from {}", channel);
        Ok(())
    }
}
