//! Worker-side control loop.
//!
//! A worker process connects to the parent session's control server, consumes
//! items one at a time, and reports each outcome. What "running" an item means
//! belongs to the embedding test framework, so the loop takes a runner
//! closure.

use anyhow::Result;
use tracing::{debug, info};

use crate::proxy::ControlProxy;
use crate::server::WorkerId;

/// Drive the item loop until the server's queue is drained. Returns the
/// number of items this worker executed.
pub fn run_worker(
    proxy: &ControlProxy,
    worker_id: WorkerId,
    mut runner: impl FnMut(&str) -> bool,
) -> Result<usize> {
    proxy.connect(worker_id)?;
    info!(worker = worker_id, "connected to control server");

    let mut executed = 0;
    while let Some(item) = proxy.request_item(worker_id)? {
        debug!(worker = worker_id, item = %item, "running item");
        let passed = runner(&item);
        proxy.report_result(worker_id, &item, passed)?;
        executed += 1;
    }

    proxy.disconnect(worker_id)?;
    info!(worker = worker_id, executed, "worker finished");
    Ok(executed)
}
