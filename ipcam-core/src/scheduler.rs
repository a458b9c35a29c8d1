//! Worker scheduler: one thread visiting peers round-robin so the whole population
//! is swept once per configured window.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::central::Central;
use crate::peer::Peer;

/// Lower bound of the per-peer visit interval.
pub const MIN_VISIT_INTERVAL: Duration = Duration::from_millis(1);

/// Per-peer visit interval: the window split across all peers, minus a little slack.
pub fn visit_interval(window: Duration, peer_count: usize) -> Duration {
    if peer_count == 0 {
        return window.max(MIN_VISIT_INTERVAL);
    }
    let mut per_peer = window.as_millis() as u64 / peer_count as u64;
    if per_peer > 2 {
        per_peer -= 2;
    }
    Duration::from_millis(per_peer).max(MIN_VISIT_INTERVAL)
}

/// Loop state: current interval, iterations since the last recalculation and the cursor.
#[derive(Debug, Clone)]
pub struct Sweep {
    interval: Duration,
    counter: u32,
    cursor: Option<u64>,
}

impl Sweep {
    pub fn new(initial_interval: Duration) -> Self {
        Self {
            interval: initial_interval,
            counter: 0,
            cursor: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Advance to the next peer, recalculating the interval every `threshold` iterations.
    pub fn step(&mut self, central: &Central) -> Option<Arc<Peer>> {
        if self.counter >= central.context().settings.recalc_threshold {
            self.counter = 0;
            let count = central.peer_count();
            if count > 0 {
                self.interval = visit_interval(central.context().settings.worker_window, count);
            }
        }
        self.counter = self.counter.saturating_add(1);
        let peer = central.next_peer(self.cursor)?;
        self.cursor = Some(peer.id());
        Some(peer)
    }
}

/// Run a peer's maintenance hook unless it is being deleted. Errors and panics are logged.
pub fn visit(peer: &Peer) {
    if peer.is_deleting() {
        return;
    }
    match panic::catch_unwind(AssertUnwindSafe(|| peer.worker())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(peer_id = peer.id(), error = %e, "Peer worker failed"),
        Err(_) => tracing::error!(peer_id = peer.id(), "Peer worker panicked"),
    }
}

pub struct Worker;

impl Worker {
    /// Start the worker thread over `central`'s peers.
    pub fn spawn(central: Arc<Central>) -> std::io::Result<WorkerHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("ipcam-worker".into())
            .spawn(move || {
                let mut sweep = Sweep::new(central.context().settings.initial_interval);
                tracing::debug!("Worker started");
                loop {
                    match stop_rx.recv_timeout(sweep.interval()) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if let Some(peer) = sweep.step(&central) {
                        visit(&peer);
                    }
                }
                tracing::debug!("Worker stopped");
            })?;
        Ok(WorkerHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Owner of the worker thread. Stopping (or dropping) joins it.
pub struct WorkerHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
