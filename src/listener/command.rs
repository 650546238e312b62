use std::fmt;

use crate::event_loop::Task;
use crate::subscriber_map::Callback;

/// Work handed from caller threads to the listener thread. Consumed strictly
/// in FIFO order, only by the listener thread.
pub(crate) enum Command {
    /// Register `callback` on `channel`, opening the broker subscription if
    /// this is the first one, then post `on_success`
    Listen {
        channel: String,
        callback: Callback,
        on_success: Option<Task>,
    },

    /// Drop `callback` from `channel`, closing the broker subscription once
    /// nobody is left
    Unlisten {
        channel: String,
        callback: Callback,
    },

    /// Stop processing and tear everything down
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Listen { channel, on_success, .. } => f
                .debug_struct("Listen")
                .field("channel", channel)
                .field("on_success", &on_success.is_some())
                .finish(),
            Command::Unlisten { channel, .. } => f
                .debug_struct("Unlisten")
                .field("channel", channel)
                .finish(),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}
