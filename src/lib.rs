pub mod adapter;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod listener;
pub mod subscriber_map;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use adapter::Adapter;
pub use config::{Config, TransportKind};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopThread, Task};
pub use listener::{Listener, ListenerState};
pub use subscriber_map::{Callback, SubscriberMap};
pub use transport::{
    Connection,
    LocalBroker,
    Message,
    MessageHandler,
    NatsTransport,
    Subscription,
    Transport,
};
