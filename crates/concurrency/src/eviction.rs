//! Periodic eviction scheduler (spec §4.G: "a periodic eviction task
//! that calls `Evict(0.25)` on D and E when the resident working set
//! exceeds a configured byte budget", default interval 20 seconds).

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

/// Runs `tick` on a dedicated background thread every `interval`, until
/// stopped. Dropping the scheduler stops it (cooperative shutdown: the
/// in-flight `tick`, if any, completes before the thread exits).
pub struct EvictionScheduler {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl EvictionScheduler {
    /// Start the periodic task. `tick` is called once per interval; it
    /// must not block indefinitely, since it runs on the scheduler's
    /// only worker thread.
    pub fn start(interval: Duration, mut tick: impl FnMut() + Send + 'static) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("profilestore-eviction".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("eviction scheduler stopping");
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        tick();
                    }
                }
            })
            .expect("failed to spawn eviction scheduler thread");

        EvictionScheduler {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Stop the periodic task and wait for its thread to exit.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EvictionScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
