//! Bounded pool of reusable compilation workers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use crate::engine::Engine;
use crate::error::{ProtocolError, ERROR_ID};
use crate::worker::{HostEvent, WorkerHandle};

/// Hard ceiling on live workers. The worker runtime has deadlocked above
/// this concurrency; the bound is part of the protocol contract.
pub const MAX_CONCURRENT_COMPILATIONS: usize = 15;

pub struct WorkerPool {
    /// One permit per allowed live worker; waiters queue FIFO.
    slots: Semaphore,
    idle: Mutex<Vec<WorkerHandle>>,
    events: mpsc::Sender<HostEvent>,
    engine: Arc<dyn Engine>,
    next_compilation_id: AtomicU32,
}

impl WorkerPool {
    pub fn new(engine: Arc<dyn Engine>, events: mpsc::Sender<HostEvent>) -> Arc<Self> {
        Arc::new(Self {
            slots: Semaphore::new(MAX_CONCURRENT_COMPILATIONS),
            idle: Mutex::new(Vec::new()),
            events,
            engine,
            next_compilation_id: AtomicU32::new(1),
        })
    }

    /// Waits for a free slot, then reuses an idle worker or spawns a fresh
    /// one with a new compilation id.
    pub async fn acquire(&self) -> Result<WorkerHandle, ProtocolError> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| ProtocolError::internal(ERROR_ID, "Worker pool closed."))?;
        permit.forget();

        if let Some(worker) = self.idle.lock().unwrap().pop() {
            return Ok(worker);
        }
        let compilation_id = self.next_compilation_id.fetch_add(1, Ordering::Relaxed);
        debug!(compilation_id, "spawning worker");
        WorkerHandle::spawn(compilation_id, self.events.clone(), self.engine.clone()).map_err(
            |err| {
                ProtocolError::internal(ERROR_ID, format!("Failed to spawn worker thread: {err}"))
            },
        )
    }

    /// Returns a finished worker to the idle set and wakes one waiter.
    pub fn release(&self, worker: WorkerHandle) {
        debug!(compilation_id = worker.compilation_id(), "worker released");
        self.idle.lock().unwrap().push(worker);
        self.slots.add_permits(1);
    }

    /// Drops every idle worker, letting their threads exit.
    pub fn clear_idle(&self) {
        self.idle.lock().unwrap().clear();
    }
}
