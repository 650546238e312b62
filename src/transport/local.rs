//! In-process broker
//!
//! Mirrors the shape of a networked broker closely enough that the bridge
//! cannot tell the difference: every connection gets its own delivery
//! thread, publishes are routed per exact channel name to every live
//! subscription across all connections, and unsubscribing only affects the
//! handle it was called on.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Sender};
use log::{debug, info};

use crate::error::{Error, Result};

use super::{Connection, Message, MessageHandler, Subscription, Transport};

/// Prefix for delivery thread names, suffixed by the connection id
const DELIVERY_THRD_PREFIX: &str = "cablebridge-delivery";

type SubscriptionId = u64;

/// Where a published message should go for one subscription
struct Route {
    /// Delivery queue of the connection that owns the subscription
    delivery: Sender<Delivery>,

    handler: MessageHandler,

    /// Cleared on unsubscribe so already-queued deliveries are skipped
    live: Arc<AtomicBool>,
}

struct Delivery {
    handler: MessageHandler,
    live: Arc<AtomicBool>,
    message: Message,
}

#[derive(Default)]
struct Inner {
    /// Set once the broker is closed, after which everything fails
    closed: AtomicBool,

    next_id: AtomicU64,

    /// channel -> subscription id -> route
    routes: Mutex<HashMap<String, HashMap<SubscriptionId, Route>>>,
}

/// Handle to a shared in-process broker. Safe to clone and share across
/// threads, as we maintain an Arc to the inner state.
#[derive(Clone, Default)]
pub struct LocalBroker {
    inner: Arc<Inner>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the broker unreachable. Existing subscriptions stop receiving,
    /// and connect, publish and subscribe all fail from now on.
    pub fn close(&self) {
        info!("Closing local broker");
        self.inner.closed.store(true, Ordering::SeqCst);
        for (_, subs) in self.inner.routes().drain() {
            for (_, route) in subs {
                route.live.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of live broker-level subscriptions on `channel`, across all
    /// connections
    pub fn subscription_count(&self, channel: &str) -> usize {
        self.inner
            .routes()
            .get(channel)
            .map_or(0, HashMap::len)
    }
}

impl Transport for LocalBroker {
    fn connect(&self, address: &str) -> Result<Arc<dyn Connection>> {
        self.inner.ensure_open()?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (delivery, rx) = unbounded::<Delivery>();

        // the delivery thread exits once every sender is gone, which happens
        // when the connection and all of its routes have been dropped
        thread::Builder::new()
            .name(format!("{}-{}", DELIVERY_THRD_PREFIX, id))
            .spawn(move || {
                for d in rx.iter() {
                    if d.live.load(Ordering::SeqCst) {
                        (d.handler)(d.message);
                    }
                }
            })?;

        info!("Connected to local broker at {} (connection {})", address, id);
        Ok(Arc::new(LocalConnection {
            inner: self.inner.clone(),
            delivery,
            owned: Default::default(),
        }))
    }
}

impl Inner {
    fn routes(&self) -> MutexGuard<'_, HashMap<String, HashMap<SubscriptionId, Route>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::unavailable("local broker is closed"));
        }
        Ok(())
    }

    /// Removes a route, returning whether it was still present
    fn remove_route(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut routes = self.routes();
        let Some(subs) = routes.get_mut(channel) else {
            return false;
        };
        let removed = match subs.remove(&id) {
            Some(route) => {
                route.live.store(false, Ordering::SeqCst);
                true
            },
            None => false,
        };
        if subs.is_empty() {
            routes.remove(channel);
        }
        removed
    }
}

struct LocalConnection {
    inner: Arc<Inner>,

    /// Feeds this connection's delivery thread
    delivery: Sender<Delivery>,

    /// Subscriptions opened through this connection, dropped with it
    owned: Arc<Mutex<HashSet<(String, SubscriptionId)>>>,
}

impl Connection for LocalConnection {
    fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.inner.ensure_open()?;

        let routes = self.inner.routes();
        let Some(subs) = routes.get(channel) else {
            return Ok(());
        };
        for route in subs.values() {
            let delivery = Delivery {
                handler: route.handler.clone(),
                live: route.live.clone(),
                message: Message::new(channel, payload.clone()),
            };
            if route.delivery.send(delivery).is_err() {
                debug!("Delivery thread for {} is gone, skipping", channel);
            }
        }
        Ok(())
    }

    fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>> {
        self.inner.ensure_open()?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let route = Route {
            delivery: self.delivery.clone(),
            handler,
            live: Arc::new(AtomicBool::new(true)),
        };
        self.inner
            .routes()
            .entry(channel.to_string())
            .or_default()
            .insert(id, route);
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((channel.to_string(), id));

        debug!("Subscribed to {} (sid {})", channel, id);
        Ok(Box::new(LocalSubscription {
            inner: self.inner.clone(),
            owned: self.owned.clone(),
            channel: channel.to_string(),
            id,
        }))
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        let owned = std::mem::take(
            &mut *self.owned.lock().unwrap_or_else(PoisonError::into_inner)
        );
        for (channel, id) in owned {
            self.inner.remove_route(&channel, id);
        }
    }
}

struct LocalSubscription {
    inner: Arc<Inner>,
    owned: Arc<Mutex<HashSet<(String, SubscriptionId)>>>,
    channel: String,
    id: SubscriptionId,
}

impl Subscription for LocalSubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn unsubscribe(self: Box<Self>) -> Result<()> {
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(self.channel.clone(), self.id));
        if self.inner.remove_route(&self.channel, self.id) {
            debug!("Unsubscribed from {} (sid {})", self.channel, self.id);
        }
        // a closed broker has already dropped every route
        self.inner.ensure_open()
    }
}
