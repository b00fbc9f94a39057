use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, info_span};

use crate::orchestrator::Orchestrator;
use crate::queue::WorkQueue;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Fixed set of worker threads draining a queue into the orchestrator.
///
/// Workers exit once the queue is closed and drained; `shutdown` joins them.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<dyn WorkQueue>,
        workers: usize,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let orchestrator = Arc::clone(&orchestrator);
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("packmule-worker-{index}"))
                .spawn(move || worker_loop(index, &orchestrator, queue.as_ref()))
                .with_context(|| format!("failed to spawn worker thread {index}"))?;
            handles.push(handle);
        }
        Ok(Self { handles })
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("a worker thread panicked");
            }
        }
    }
}

fn worker_loop(index: usize, orchestrator: &Orchestrator, queue: &dyn WorkQueue) {
    loop {
        let Some(item) = queue.pop(POLL_INTERVAL) else {
            if queue.is_closed() {
                info!(worker = index, "worker shutting down");
                return;
            }
            continue;
        };
        let span = info_span!("request", worker = index, request_id = item.request_id);
        let _guard = span.enter();
        match orchestrator.execute(&item) {
            Ok(state) => {
                info!(state = state.as_str(), "request settled");
                queue.ack(&item);
            }
            Err(err) => {
                // Infrastructure failure, not a pipeline outcome; put the item
                // back so it gets another chance once the backend recovers.
                error!("worker could not process request: {err:#}");
                queue.nack(item);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}
