//! Typed session-level failures surfaced by the coordinator.

use std::time::Duration;

use thiserror::Error;

use crate::server::WorkerId;

/// Terminal outcomes of a parallel session.
///
/// All variants except `SpawnFailed` map to the whole-session detections the
/// coordinator performs; per-worker timeouts degrade a single worker and never
/// surface here.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("control server unreachable: {source}")]
    ServerUnreachable { source: anyhow::Error },

    #[error("not all workers connected within {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("no request reached the control server for {timeout:?}")]
    IdleTimeout { timeout: Duration },

    #[error("session interrupted")]
    Interrupted,

    #[error("failed to launch worker {worker_id}: {source}")]
    SpawnFailed {
        worker_id: WorkerId,
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
