//! Host event loop
//!
//! Subscriber callbacks may touch state that only the host's event loop is
//! allowed to mutate, so the bridge never invokes them directly. It posts
//! them through [`EventLoop`] instead.
//!
//! [`LoopThread`] is a ready-made loop: a dedicated named thread running a
//! single-threaded tokio runtime that executes posted tasks one at a time,
//! in the order they were posted.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use arc_swap::ArcSwapOption;
use log::{debug, error, info};
use tokio::runtime::Builder as RuntimeBuilder;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::error::Result;

/// Unit of work scheduled onto the event loop
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The host's single-threaded cooperative scheduler
pub trait EventLoop: Send + Sync {
    /// Schedules `task` to run on the loop thread. Never blocks, and never
    /// runs the task inline.
    fn post(&self, task: Task);

    /// Whether the calling thread is the loop thread
    fn in_loop(&self) -> bool;
}

/// Event loop backed by its own thread and a current-thread tokio runtime
pub struct LoopThread {
    /// Cleared on stop, which closes the queue and lets the thread finish
    tx: ArcSwapOption<UnboundedSender<Task>>,

    thread_id: ThreadId,

    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LoopThread {
    /// Starts the loop on a new thread called `name`
    pub fn spawn<S>(name: S) -> Result<Self>
    where
        S: Into<String>,
    {
        let name = name.into();
        let rt = RuntimeBuilder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, mut rx) = unbounded_channel::<Task>();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                rt.block_on(async move {
                    while let Some(task) = rx.recv().await {
                        // a panicking task must not take the loop down with it
                        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                            error!("Event loop task panicked");
                        }
                    }
                });
            })?;

        info!("Event loop {} started", name);
        Ok(Self {
            tx: ArcSwapOption::from_pointee(tx),
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stops accepting tasks, lets already-posted tasks finish, and waits for
    /// the loop thread to exit. Called from the loop itself, it only closes
    /// the queue.
    pub fn stop(&self) {
        self.tx.store(None);

        if self.in_loop() {
            return;
        }
        let thread = self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("Event loop thread panicked");
            }
        }
    }
}

impl EventLoop for LoopThread {
    fn post(&self, task: Task) {
        match self.tx.load_full() {
            Some(tx) => {
                if tx.send(task).is_err() {
                    debug!("Event loop has exited, dropping task");
                }
            },
            None => debug!("Event loop is stopped, dropping task"),
        }
    }

    fn in_loop(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}
