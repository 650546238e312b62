//! Listener: the single thread allowed to touch broker subscriptions
//!
//! Three kinds of threads meet here. Application threads call
//! [`Listener::listen`] and [`Listener::unlisten`], which only enqueue a
//! [`Command`]. The listener thread drains that queue and is the only place
//! broker-level subscribe/unsubscribe calls are made, so two of them can
//! never race. The transport's delivery thread pushes inbound messages,
//! which are fanned out to every registered callback by posting onto the
//! host [`EventLoop`], never by calling the callback in place.
//!
//! Shutdown closes a gate that fan-out holds shared while posting, then
//! waits for a barrier task on the event loop. Once [`Listener::shutdown`]
//! returns, every message delivered before it has finished fanning out and
//! nothing else will be invoked.
//!
//! Any broker error while applying a command, or a panic in the command
//! loop, aborts the process after logging. A dead listener with callers
//! still enqueuing would otherwise hang silently.

mod command;

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, Task};
use crate::subscriber_map::{Callback, SubscriberMap};
use crate::transport::{Connection, Message, MessageHandler, Subscription};

use self::command::Command;

/// Lifecycle of the listener. Moves forward only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    /// Constructed, thread not yet running
    Idle,

    /// Processing commands
    Running,

    /// Shutdown dequeued, finishing what is left in the queue
    Draining,

    /// Thread has exited. Final.
    Terminated,
}

/// State shared between callers, the listener thread and delivery threads
struct Shared {
    registry: SubscriberMap,

    event_loop: Arc<dyn EventLoop>,

    /// True while fan-out may post callbacks. Fan-out holds it for reading
    /// across the whole post loop, shutdown takes it for writing to close.
    gate: RwLock<bool>,

    state: Mutex<ListenerState>,
}

impl Shared {
    fn new(event_loop: Arc<dyn EventLoop>) -> Arc<Self> {
        Arc::new(Self {
            registry: SubscriberMap::new(),
            event_loop,
            gate: RwLock::new(true),
            state: Mutex::new(ListenerState::Idle),
        })
    }

    fn state(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ListenerState) {
        *self.state() = state;
    }

    fn close_gate(&self) {
        *self.gate.write().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Broker-level handler shared by every channel. Runs on the delivery
    /// thread.
    fn handler(self: &Arc<Self>) -> MessageHandler {
        let shared = Arc::clone(self);
        Arc::new(move |message: Message| shared.fan_out(message))
    }

    /// Posts one invocation per registered callback onto the event loop
    fn fan_out(&self, message: Message) {
        let open = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if !*open {
            debug!("Listener is shut down, dropping message on {}", message.channel);
            return;
        }

        let callbacks = self.registry.subscribers(&message.channel);
        if callbacks.is_empty() {
            return;
        }
        let message = Arc::new(message);
        for callback in callbacks {
            let message = Arc::clone(&message);
            self.event_loop.post(Box::new(move || invoke(&callback, &message)));
        }
    }
}

/// Runs one subscriber callback, containing any panic so the remaining
/// subscribers still get the message
fn invoke(callback: &Callback, message: &Message) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
        error!("Subscriber callback for {} panicked", message.channel);
    }
}

/// Serializes subscribe/unsubscribe against one broker connection and fans
/// inbound messages out to local subscribers
pub struct Listener {
    tx: Sender<Command>,

    shared: Arc<Shared>,

    thread: Mutex<Option<JoinHandle<()>>>,

    /// Disconnects when the listener thread exits
    done: Receiver<()>,

    shutdown_timeout: Duration,
}

impl Listener {
    /// Starts the listener thread. `connection` is used for subscriptions
    /// only and is owned by the thread from here on.
    pub fn new(
        connection: Arc<dyn Connection>,
        event_loop: Arc<dyn EventLoop>,
        config: &Config,
    ) -> Result<Self> {
        let (tx, rx) = unbounded::<Command>();
        let (done_tx, done) = bounded::<()>(0);
        let shared = Shared::new(event_loop);
        let mut worker = Worker::new(connection, Arc::clone(&shared));
        let thread = thread::Builder::new()
            .name(config.listener_thread_name.clone())
            .spawn(move || {
                // dropped last, after teardown, to signal we are gone
                let _done = done_tx;

                match panic::catch_unwind(AssertUnwindSafe(|| worker.run(rx))) {
                    Ok(Ok(())) => info!("Listener stopped"),
                    Ok(Err(e)) => fail_fast(format_args!("Listener failed: {}", e)),
                    Err(_) => fail_fast(format_args!("Listener thread panicked")),
                }
            })?;

        Ok(Self {
            tx,
            shared,
            thread: Mutex::new(Some(thread)),
            done,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    pub fn state(&self) -> ListenerState {
        *self.shared.state()
    }

    /// Registered callbacks for `channel`, as last applied by the listener
    /// thread
    pub fn subscribers(&self, channel: &str) -> Vec<Callback> {
        self.shared.registry.subscribers(channel)
    }

    /// Queues a subscription of `callback` to `channel`. Returns immediately;
    /// `on_success` is posted onto the event loop once the broker
    /// subscription, new or reused, is in place.
    pub fn listen<S>(&self, channel: S, callback: Callback, on_success: Option<Task>)
    where
        S: Into<String>,
    {
        self.send(Command::Listen {
            channel: channel.into(),
            callback,
            on_success,
        });
    }

    /// Queues removal of `callback` from `channel`
    pub fn unlisten<S>(&self, channel: S, callback: Callback)
    where
        S: Into<String>,
    {
        self.send(Command::Unlisten {
            channel: channel.into(),
            callback,
        });
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.tx.send(command) {
            debug!("Listener has terminated, ignoring {:?}", e.into_inner());
        }
    }

    /// Queues a shutdown and blocks until the listener thread has exited and
    /// every callback already posted has run, or the configured timeout
    /// passes. Calling it again after it succeeded does nothing.
    pub fn shutdown(&self) -> Result<()> {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = thread.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + self.shutdown_timeout;
        self.send(Command::Shutdown);
        match self.done.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => {
                // keep the handle so a later call can wait again
                *thread = Some(handle);
                return Err(self.timed_out());
            },
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {},
        }
        if handle.join().is_err() {
            error!("Listener thread panicked during shutdown");
        }
        self.shared.set_state(ListenerState::Terminated);
        drop(thread);

        self.flush_event_loop(deadline)
    }

    /// Waits for everything posted before the gate closed to run
    fn flush_event_loop(&self, deadline: Instant) -> Result<()> {
        if self.shared.event_loop.in_loop() {
            // we are the event loop, pending callbacks run after we return
            warn!("Shutdown called from the event loop, not waiting for pending callbacks");
            return Ok(());
        }

        let (tx, rx) = bounded::<()>(1);
        self.shared.event_loop.post(Box::new(move || {
            let _ = tx.send(());
        }));
        match rx.recv_deadline(deadline) {
            // disconnected means the loop dropped the barrier, and so is
            // not running anything else either
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(self.timed_out()),
        }
    }

    fn timed_out(&self) -> Error {
        Error::ShutdownTimeout {
            waited_ms: self.shutdown_timeout.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("state", &self.state())
            .finish()
    }
}

/// Logs and aborts. Flushes the logger first since async writers would
/// otherwise lose the final line.
fn fail_fast(args: fmt::Arguments<'_>) -> ! {
    error!("{}, aborting", args);
    log::logger().flush();
    process::abort();
}

/// Owned by the listener thread. Nothing else touches `subscriptions`.
struct Worker {
    connection: Arc<dyn Connection>,

    shared: Arc<Shared>,

    /// Our own record of broker subscriptions, one per channel
    subscriptions: HashMap<String, Box<dyn Subscription>>,
}

impl Worker {
    fn new(connection: Arc<dyn Connection>, shared: Arc<Shared>) -> Self {
        Self {
            connection,
            shared,
            subscriptions: HashMap::new(),
        }
    }

    /// Command loop. Blocks on the queue while idle, so a push wakes us
    /// immediately. Ends on Shutdown, or when every sender is gone.
    fn run(&mut self, rx: Receiver<Command>) -> Result<()> {
        self.shared.set_state(ListenerState::Running);
        info!("Listener running");

        for command in rx.iter() {
            debug!("Applying {:?}", command);
            match command {
                Command::Listen { channel, callback, on_success } => {
                    self.listen(channel, callback, on_success)?;
                },
                Command::Unlisten { channel, callback } => {
                    self.unlisten(&channel, &callback)?;
                },
                Command::Shutdown => {
                    self.shared.set_state(ListenerState::Draining);
                    self.drain(&rx);
                    break;
                },
            }
        }

        self.teardown();
        Ok(())
    }

    fn listen(
        &mut self,
        channel: String,
        callback: Callback,
        on_success: Option<Task>,
    ) -> Result<()> {
        // register first so the very first broker message finds it
        let first = self.shared.registry.add(&channel, callback);
        debug_assert_eq!(first, !self.subscriptions.contains_key(&channel));

        if first {
            let subscription = self.connection.subscribe(
                &channel,
                self.shared.handler(),
            )?;
            info!("Subscribed to {}", channel);
            self.subscriptions.insert(channel, subscription);
        }

        if let Some(on_success) = on_success {
            self.shared.event_loop.post(on_success);
        }
        Ok(())
    }

    fn unlisten(&mut self, channel: &str, callback: &Callback) -> Result<()> {
        if self.shared.registry.remove(channel, callback) > 0 {
            return Ok(());
        }

        match self.subscriptions.remove(channel) {
            Some(subscription) => {
                let channel = subscription.channel().to_string();
                subscription.unsubscribe()?;
                info!("Unsubscribed from {}", channel);
            },
            None => debug!("No subscription for {}, nothing to unlisten", channel),
        }
        Ok(())
    }

    /// Applies unlistens that were queued behind Shutdown and discards
    /// everything else
    fn drain(&mut self, rx: &Receiver<Command>) {
        let mut discarded = 0;
        for command in rx.try_iter() {
            match command {
                Command::Unlisten { channel, callback } => {
                    if let Err(e) = self.unlisten(&channel, &callback) {
                        warn!("Failed to unlisten {} during shutdown: {}", channel, e);
                    }
                },
                Command::Listen { .. } => discarded += 1,
                Command::Shutdown => {},
            }
        }
        if discarded > 0 {
            warn!("Discarded {} subscriptions queued behind shutdown", discarded);
        }
    }

    /// Stops fan-out, then drops every broker subscription and local
    /// subscriber
    fn teardown(&mut self) {
        self.shared.close_gate();
        self.shared.registry.clear();

        for (_, subscription) in self.subscriptions.drain() {
            let channel = subscription.channel().to_string();
            match subscription.unsubscribe() {
                Ok(()) => debug!("Unsubscribed from {} on shutdown", channel),
                Err(e) => warn!("Failed to unsubscribe from {} on shutdown: {}", channel, e),
            }
        }
    }
}
