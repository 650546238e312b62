use std::error::Error as StdError;
use std::io::{self, BufRead};
use std::sync::Arc;

use flexi_logger::{colored_with_thread, Logger, WriteMode};
use log::{info, warn};

use cablebridge::{transport, Adapter, Callback, Config, LoopThread, Message};

/// Name of the thread standing in for the host framework's event loop
const EVENT_LOOP_THRD_NAME: &str = "cablebridge-event-loop";

/// Channel the demo streams from and echoes onto
const CHANNEL: &str = "test";

fn main() -> Result<(), Box<dyn StdError>> {
    // initialize logger and hold reference to it, otherwise it will be dropped
    let _logger = Logger::try_with_env_or_str("info")?
        .log_to_stdout()
        .write_mode(WriteMode::Async)
        .format(colored_with_thread)
        .use_utc()
        .start()?;

    let config = Config::from_env();
    let transport = transport::from_config(&config);

    let event_loop = Arc::new(LoopThread::spawn(EVENT_LOOP_THRD_NAME)?);
    let adapter = Adapter::new(config, transport, event_loop.clone());
    info!(
        "Bridging to {:?} broker at {}",
        adapter.config().transport,
        adapter.config().server
    );

    let on_message: Callback = Arc::new(|msg: &Message| {
        info!("{} <- {}", msg.channel, String::from_utf8_lossy(&msg.payload));
    });
    adapter.subscribe(
        CHANNEL,
        on_message,
        Some(Box::new(|| info!("Streaming from {}", CHANNEL))),
    )?;

    // every line typed is broadcast back onto the channel we stream from
    for line in io::stdin().lock().lines() {
        let line = line?;
        if let Err(e) = adapter.broadcast(CHANNEL, line.into_bytes()) {
            warn!("Broadcast failed: {}", e);
        }
    }

    adapter.shutdown()?;
    event_loop.stop();
    info!("Bye");
    Ok(())
}
