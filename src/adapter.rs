//! Entry point for the broadcast framework
//!
//! [`Adapter`] owns the two broker connections and the [`Listener`], all
//! created on first use. Construct one at service startup and share it by
//! reference; every method takes `&self` and is safe to call from any
//! thread.
//!
//! Broadcasts go straight out on their own connection and never pass through
//! the listener queue. Subscriptions are routed through the listener so the
//! broker-level subscribe/unsubscribe calls are serialized on one thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use log::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, Task};
use crate::listener::{Listener, ListenerState};
use crate::subscriber_map::Callback;
use crate::transport::{Connection, Transport};

type ConnectionSlot = ArcSwapOption<Arc<dyn Connection>>;

pub struct Adapter {
    config: Config,

    transport: Arc<dyn Transport>,

    event_loop: Arc<dyn EventLoop>,

    /// Single lock guarding lazy construction of everything below, so
    /// concurrent first use never opens duplicate connections
    init: Mutex<()>,

    /// Dedicated to subscriptions, handed to the listener. Created once and
    /// never replaced.
    subscription_connection: ConnectionSlot,

    broadcast_connection: ConnectionSlot,

    listener: ArcSwapOption<Listener>,

    /// Set by shutdown, blocks creation of a new listener
    shut_down: AtomicBool,
}

impl Adapter {
    /// Creates the adapter. Nothing connects until first use.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        event_loop: Arc<dyn EventLoop>,
    ) -> Self {
        Self {
            config,
            transport,
            event_loop,
            init: Mutex::new(()),
            subscription_connection: Default::default(),
            broadcast_connection: Default::default(),
            listener: Default::default(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Publishes `payload` on `channel`. Local subscribers receive it back
    /// through the broker like everyone else.
    pub fn broadcast<P>(&self, channel: &str, payload: P) -> Result<()>
    where
        P: Into<Bytes>,
    {
        self.connection_for_broadcasts()?.publish(channel, payload.into())
    }

    /// Registers `callback` on `channel`. Returns as soon as the request is
    /// queued; `on_success` runs on the event loop once the broker
    /// subscription is active. Fails with [`Error::Shutdown`] once
    /// [`Adapter::shutdown`] has been called.
    pub fn subscribe(
        &self,
        channel: &str,
        callback: Callback,
        on_success: Option<Task>,
    ) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.listener()?.listen(channel, callback, on_success);
        Ok(())
    }

    /// Removes `callback` from `channel`. The broker subscription goes away
    /// with the last callback. Unknown channels and callbacks are ignored.
    pub fn unsubscribe(&self, channel: &str, callback: Callback) {
        match self.listener.load_full() {
            Some(listener) => listener.unlisten(channel, callback),
            None => debug!("No listener yet, nothing to unsubscribe from {}", channel),
        }
    }

    /// Stops the listener and blocks until no further callback can run.
    /// Subsequent subscribes fail with [`Error::Shutdown`].
    pub fn shutdown(&self) -> Result<()> {
        let listener = {
            let _guard = self.lock();
            self.shut_down.store(true, Ordering::SeqCst);
            self.listener.load_full()
        };

        match listener {
            Some(listener) => {
                info!("Shutting down listener");
                listener.shutdown()
            },
            None => Ok(()),
        }
    }

    /// Connection the listener subscribes through, connecting if needed
    pub fn connection_for_subscriptions(&self) -> Result<Arc<dyn Connection>> {
        if let Some(conn) = load(&self.subscription_connection) {
            return Ok(conn);
        }
        let guard = self.lock();
        self.connect_locked(&self.subscription_connection, &guard)
    }

    /// State of the listener, if one has been started
    pub fn listener_state(&self) -> Option<ListenerState> {
        self.listener.load_full().map(|l| l.state())
    }

    fn connection_for_broadcasts(&self) -> Result<Arc<dyn Connection>> {
        if let Some(conn) = load(&self.broadcast_connection) {
            return Ok(conn);
        }
        let guard = self.lock();
        self.connect_locked(&self.broadcast_connection, &guard)
    }

    fn listener(&self) -> Result<Arc<Listener>> {
        if let Some(listener) = self.listener.load_full() {
            return Ok(listener);
        }

        let guard = self.lock();
        // someone may have beaten us to it while we waited on the lock
        if let Some(listener) = self.listener.load_full() {
            return Ok(listener);
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let connection = self.connect_locked(&self.subscription_connection, &guard)?;
        let listener = Arc::new(Listener::new(
            connection,
            self.event_loop.clone(),
            &self.config,
        )?);
        self.listener.store(Some(listener.clone()));
        info!("Listener started");
        Ok(listener)
    }

    /// Fills `slot` if it is still empty. Requires the init lock, which the
    /// guard argument proves we hold.
    fn connect_locked(
        &self,
        slot: &ConnectionSlot,
        _guard: &MutexGuard<'_, ()>,
    ) -> Result<Arc<dyn Connection>> {
        if let Some(conn) = load(slot) {
            return Ok(conn);
        }
        let conn = self.transport.connect(&self.config.server)?;
        slot.store(Some(Arc::new(conn.clone())));
        Ok(conn)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.init.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load(slot: &ConnectionSlot) -> Option<Arc<dyn Connection>> {
    slot.load_full().map(|conn| Arc::clone(&*conn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{recorder, wait_until, LoopFixture};
    use crate::transport::LocalBroker;
    use crossbeam_channel::bounded;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    /// Transport that counts connects on top of a local broker
    struct CountingTransport {
        broker: LocalBroker,
        connects: AtomicUsize,
    }

    impl Transport for CountingTransport {
        fn connect(&self, address: &str) -> Result<Arc<dyn Connection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.broker.connect(address)
        }
    }

    fn setup() -> (Arc<CountingTransport>, LoopFixture, Adapter) {
        let transport = Arc::new(CountingTransport {
            broker: LocalBroker::new(),
            connects: AtomicUsize::new(0),
        });
        let event_loop = LoopFixture::new();
        let adapter = Adapter::new(
            Config::default(),
            transport.clone(),
            event_loop.handle(),
        );
        (transport, event_loop, adapter)
    }

    fn subscribe_and_wait(adapter: &Adapter, channel: &str, callback: Callback) {
        let (tx, rx) = bounded::<()>(1);
        adapter.subscribe(channel, callback, Some(Box::new(move || {
            let _ = tx.send(());
        }))).unwrap();
        rx.recv_timeout(WAIT).expect("subscription never became active");
    }

    #[test]
    fn test_nothing_connects_until_used() {
        let (transport, _loop, adapter) = setup();
        assert_eq!(adapter.config(), &Config::default());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
        assert_eq!(adapter.listener_state(), None);

        adapter.unsubscribe("test", recorder().callback());
        adapter.shutdown().unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let (_transport, _loop, adapter) = setup();
        let rec = recorder();
        subscribe_and_wait(&adapter, "test", rec.callback());

        let payload: &[u8] = b"\x00\xffbinary\r\n{\"a\":1}";
        adapter.broadcast("test", payload.to_vec()).unwrap();

        assert!(wait_until(WAIT, || rec.count() == 1));
        assert_eq!(rec.calls()[0].payload.as_ref(), payload);
    }

    #[test]
    fn test_subscribe_broadcast_unsubscribe() {
        let (_transport, _loop, adapter) = setup();
        let c1 = recorder();
        subscribe_and_wait(&adapter, "room:1", c1.callback());

        adapter.broadcast("room:1", r#"{"msg":"hi"}"#).unwrap();
        assert!(wait_until(WAIT, || c1.count() == 1));
        assert_eq!(c1.calls()[0].payload, Bytes::from_static(br#"{"msg":"hi"}"#));

        adapter.unsubscribe("room:1", c1.callback());
        // a later subscription on another channel proves the unsubscribe ran
        subscribe_and_wait(&adapter, "room:2", recorder().callback());

        adapter.broadcast("room:1", r#"{"msg":"hi"}"#).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(c1.count(), 1);
    }

    #[test]
    fn test_concurrent_first_use_connects_once_per_role() {
        let (transport, _loop, adapter) = setup();
        let adapter = Arc::new(adapter);

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let adapter = adapter.clone();
                thread::spawn(move || {
                    adapter.subscribe(&format!("room:{}", i), recorder().callback(), None)
                        .unwrap();
                    adapter.broadcast("room:0", "x").unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // one connection for subscriptions, one for broadcasts
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(
            &adapter.connection_for_subscriptions().unwrap(),
            &adapter.connection_for_subscriptions().unwrap(),
        ));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_broker_unavailable_is_propagated() {
        let (transport, _loop, adapter) = setup();
        transport.broker.close();

        assert!(matches!(
            adapter.broadcast("test", "x"),
            Err(Error::BrokerUnavailable { .. })
        ));
        assert!(matches!(
            adapter.subscribe("test", recorder().callback(), None),
            Err(Error::BrokerUnavailable { .. })
        ));
        assert_eq!(adapter.listener_state(), None);
    }

    #[test]
    fn test_no_callbacks_after_shutdown() {
        let (transport, _loop, adapter) = setup();
        let rec = recorder();
        subscribe_and_wait(&adapter, "test", rec.callback());

        let publisher = transport.broker.connect("local").unwrap();
        let spammer = thread::spawn(move || {
            for _ in 0..500 {
                let _ = publisher.publish("test", Bytes::from_static(b"spam"));
            }
        });

        adapter.shutdown().unwrap();
        let seen = rec.count();
        spammer.join().unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(rec.count(), seen);
        assert_eq!(adapter.listener_state(), Some(ListenerState::Terminated));
        assert_eq!(transport.broker.subscription_count("test"), 0);
    }

    #[test]
    fn test_subscribe_after_shutdown_fails() {
        let (_transport, _loop, adapter) = setup();
        adapter.shutdown().unwrap();

        assert!(matches!(
            adapter.subscribe("test", recorder().callback(), None),
            Err(Error::Shutdown)
        ));
        // broadcasting does not depend on the listener
        adapter.broadcast("test", "x").unwrap();
    }

    #[test]
    fn test_shutdown_from_subscribe_callback() {
        let (transport, _loop, adapter) = setup();
        let adapter = Arc::new(adapter);

        // on_success runs on the event loop, so shutdown must not wait on it
        let (tx, rx) = bounded::<Result<()>>(1);
        adapter.subscribe("test", recorder().callback(), Some(Box::new({
            let adapter = adapter.clone();
            move || {
                let _ = tx.send(adapter.shutdown());
            }
        }))).unwrap();

        rx.recv_timeout(WAIT).expect("shutdown blocked the event loop").unwrap();
        assert_eq!(adapter.listener_state(), Some(ListenerState::Terminated));
        assert_eq!(transport.broker.subscription_count("test"), 0);
    }
}
