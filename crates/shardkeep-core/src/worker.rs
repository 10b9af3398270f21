//! Polling background worker with cooperative shutdown.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ShardError, ShardResult};

/// Dedicated thread calling a tick function once per interval.
///
/// Stopping is cooperative: a tick in progress runs to completion, and
/// [`stop`](Self::stop) waits at most the given timeout before detaching
/// the thread.
#[derive(Debug)]
pub struct BackgroundWorker {
    name: String,
    stop_tx: Option<mpsc::Sender<()>>,
    done_rx: mpsc::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> ShardResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    tick();
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| ShardError::Worker {
                message: format!("failed to spawn {}: {}", name, e),
            })?;

        debug!(worker = name, interval_ms = interval.as_millis() as u64, "started worker");
        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the worker and wait up to `timeout` for it to exit.
    /// Returns `false` when the worker was detached still running.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(stop_tx) = self.stop_tx.take() else {
            return true;
        };
        let _ = stop_tx.send(());

        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        warn!(worker = %self.name, "worker panicked");
                    }
                }
                debug!(worker = %self.name, "stopped worker");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                self.handle.take();
                warn!(worker = %self.name, timeout_ms = timeout.as_millis() as u64, "worker did not stop in time, detaching");
                false
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel, which ends the loop.
        self.stop_tx.take();
    }
}
