use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::event_loop::{EventLoop, LoopThread, Task};
use crate::subscriber_map::Callback;
use crate::transport::Message;

/// Polls `cond` until it holds or `timeout` passes
pub fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// One observed callback invocation
#[derive(Clone, Debug)]
pub struct Call {
    pub channel: String,
    pub payload: Bytes,
    pub thread: Option<String>,
}

/// Callback that records every invocation. Always hands out the same `Arc`,
/// so it can be unsubscribed with what it was subscribed with.
#[derive(Clone)]
pub struct Recorder {
    callback: Callback,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    pub fn callback(&self) -> Callback {
        self.callback.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub fn recorder() -> Recorder {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let callback: Callback = {
        let calls = calls.clone();
        Arc::new(move |msg: &Message| {
            calls.lock().unwrap().push(Call {
                channel: msg.channel.clone(),
                payload: msg.payload.clone(),
                thread: thread::current().name().map(str::to_string),
            });
        })
    };
    Recorder { callback, calls }
}

/// Counts posts on the way through to a real loop thread
struct CountingLoop {
    inner: LoopThread,
    posted: AtomicUsize,
}

impl EventLoop for CountingLoop {
    fn post(&self, task: Task) {
        self.posted.fetch_add(1, Ordering::SeqCst);
        self.inner.post(task);
    }

    fn in_loop(&self) -> bool {
        self.inner.in_loop()
    }
}

/// Event loop on a uniquely named thread, stopped on drop
pub struct LoopFixture {
    name: String,
    event_loop: Arc<CountingLoop>,
}

impl LoopFixture {
    pub fn new() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let name = format!("test-event-loop-{}", NEXT.fetch_add(1, Ordering::Relaxed));
        let inner = LoopThread::spawn(name.clone()).unwrap();

        Self {
            name,
            event_loop: Arc::new(CountingLoop {
                inner,
                posted: AtomicUsize::new(0),
            }),
        }
    }

    pub fn handle(&self) -> Arc<dyn EventLoop> {
        self.event_loop.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total tasks posted so far
    pub fn posted(&self) -> usize {
        self.event_loop.posted.load(Ordering::SeqCst)
    }
}

impl Drop for LoopFixture {
    fn drop(&mut self) {
        self.event_loop.inner.stop();
    }
}
