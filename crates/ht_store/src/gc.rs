//! Background maintenance workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ht_core::Result;

use crate::metadata::MetadataTable;
use crate::types::{ScanSpec, COLUMN_LOCATION, END_ROW_MARKER};

/// Granularity at which sleeping workers notice a stop request.
const STOP_POLL: Duration = Duration::from_millis(50);

/// One periodic maintenance sweep.
pub trait GcTask: Send + Sync {
    fn name(&self) -> &'static str;
    fn sweep(&self) -> Result<()>;
}

/// Worker threads ticking their tasks until stopped.
pub struct GcWorkers {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

pub fn spawn(interval: Duration, tasks: Vec<Arc<dyn GcTask>>) -> GcWorkers {
    let stop = Arc::new(AtomicBool::new(false));
    let handles = tasks
        .into_iter()
        .map(|task| {
            let stop = stop.clone();
            thread::spawn(move || loop {
                let wake = Instant::now() + interval;
                while Instant::now() < wake {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    thread::sleep(STOP_POLL.min(interval));
                }
                if stop.load(Ordering::Acquire) {
                    return;
                }
                if let Err(error) = task.sweep() {
                    tracing::warn!(task = task.name(), error = %error, "gc sweep failed");
                }
            })
        })
        .collect();
    GcWorkers { stop, handles }
}

impl GcWorkers {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn join(mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for GcWorkers {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sweeps the metadata table for ranges stuck with the unassigned
/// location sentinel.
pub struct UnassignedRangeSweep {
    metadata: Arc<dyn MetadataTable>,
}

impl UnassignedRangeSweep {
    pub fn new(metadata: Arc<dyn MetadataTable>) -> Self {
        Self { metadata }
    }
}

impl GcTask for UnassignedRangeSweep {
    fn name(&self) -> &'static str {
        "unassigned-range-sweep"
    }

    fn sweep(&self) -> Result<()> {
        let spec = ScanSpec {
            row_interval: (Vec::new(), END_ROW_MARKER.to_vec()),
            columns: vec![COLUMN_LOCATION.to_string()],
            max_versions: 1,
            row_limit: 0,
        };
        let cells = self.metadata.scan(&spec)?;
        let unassigned = cells
            .iter()
            .filter(|cell| cell.value.trim_ascii() == b"!")
            .count();
        if unassigned > 0 {
            tracing::warn!(unassigned, "metadata ranges awaiting assignment");
        } else {
            tracing::debug!(ranges = cells.len(), "metadata sweep clean");
        }
        Ok(())
    }
}
