//! Control server: single-authority session-state holder and RPC endpoint.
//!
//! Runs on its own thread (a current-thread tokio runtime serving axum) next
//! to the coordinator's blocking poll loop. Workers POST JSON envelopes of the
//! form `{"method": "...", "params": [...]}` to `/rpc`; every worker-facing
//! call refreshes the global last-request timestamp and the caller's
//! last-connection timestamp as a side effect.
//!
//! The state machine only ever moves forward:
//! NotInitialized → WaitForClients → Active → Done.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, routing::post};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub type WorkerId = u32;

/// Session lifecycle as observed by the coordinator's poll loop.
///
/// The numeric ordering is the only legal transition direction; advancement
/// goes through a `fetch_max`, so no handler interleaving can skip back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ServerState {
    NotInitialized = 0,
    WaitForClients = 1,
    Active = 2,
    Done = 3,
}

impl ServerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotInitialized,
            1 => Self::WaitForClients,
            2 => Self::Active,
            _ => Self::Done,
        }
    }
}

/// Server-side view of one worker's standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Connected,
    Disconnected,
    /// Permanently failed; worker-facing calls are rejected from here on.
    Failed,
}

#[derive(Debug, Clone)]
struct WorkerRecord {
    last_seen: Instant,
    status: WorkerStatus,
}

/// One result report, retained for the end-of-run summary. Formatting and
/// aggregation beyond counting belong to the embedding framework.
#[derive(Debug, Clone)]
pub struct ItemReport {
    pub worker_id: WorkerId,
    pub item: String,
    pub passed: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Session state shared between the RPC handlers (concurrent writers) and the
/// coordinator's poll loop (concurrent reader).
pub struct SharedState {
    state: AtomicU8,
    interrupted: AtomicBool,
    expected_workers: usize,
    last_request: Mutex<Instant>,
    workers: Mutex<HashMap<WorkerId, WorkerRecord>>,
    queue: Mutex<VecDeque<String>>,
    reports: Mutex<Vec<ItemReport>>,
}

impl SharedState {
    pub fn new(expected_workers: usize, items: Vec<String>) -> Self {
        Self {
            state: AtomicU8::new(ServerState::NotInitialized as u8),
            interrupted: AtomicBool::new(false),
            expected_workers,
            last_request: Mutex::new(Instant::now()),
            workers: Mutex::new(HashMap::new()),
            queue: Mutex::new(items.into()),
            reports: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// True while the coordinator should keep polling for progress.
    pub fn keep_waiting(&self) -> bool {
        self.state() != ServerState::Done
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Elapsed wall-clock time since the last request reached the server.
    pub fn last_request_age(&self) -> Duration {
        lock(&self.last_request).elapsed()
    }

    /// Ages of the workers still considered live. Disconnected and failed
    /// workers are excluded, so a timed-out worker is reported at most once.
    pub fn connected_worker_ages(&self) -> Vec<(WorkerId, Duration)> {
        lock(&self.workers)
            .iter()
            .filter(|(_, record)| record.status == WorkerStatus::Connected)
            .map(|(id, record)| (*id, record.last_seen.elapsed()))
            .collect()
    }

    pub fn worker_status(&self, worker_id: WorkerId) -> Option<WorkerStatus> {
        lock(&self.workers).get(&worker_id).map(|r| r.status)
    }

    pub fn reported_count(&self) -> usize {
        lock(&self.reports).len()
    }

    pub fn remaining_items(&self) -> usize {
        lock(&self.queue).len()
    }

    pub(crate) fn advance(&self, next: ServerState) {
        let prev = self.state.fetch_max(next as u8, Ordering::SeqCst);
        if prev < next as u8 {
            debug!(
                from = ?ServerState::from_u8(prev),
                to = ?next,
                "server state transition"
            );
        }
    }

    fn touch_global(&self) {
        let mut last = lock(&self.last_request);
        let now = Instant::now();
        if now > *last {
            *last = now;
        }
    }

    /// Refresh a worker's last-connection timestamp, registering it on first
    /// contact. Fails for workers already marked failed.
    fn touch_worker(&self, worker_id: WorkerId) -> Result<(), String> {
        let mut workers = lock(&self.workers);
        let now = Instant::now();
        let record = workers.entry(worker_id).or_insert_with(|| {
            info!(worker = worker_id, "worker connected");
            WorkerRecord {
                last_seen: now,
                status: WorkerStatus::Connected,
            }
        });
        if record.status == WorkerStatus::Failed {
            return Err(format!("worker {worker_id} is marked failed"));
        }
        if now > record.last_seen {
            record.last_seen = now;
        }
        let connected_once = workers.len();
        drop(workers);

        if connected_once >= self.expected_workers {
            self.advance(ServerState::Active);
        }
        Ok(())
    }

    fn set_worker_status(&self, worker_id: WorkerId, status: WorkerStatus) {
        let mut workers = lock(&self.workers);
        let record = workers.entry(worker_id).or_insert(WorkerRecord {
            last_seen: Instant::now(),
            status,
        });
        record.status = status;
    }

    /// Done once the queue is drained and no live workers remain.
    fn maybe_done(&self) {
        if !lock(&self.queue).is_empty() {
            return;
        }
        let any_live = lock(&self.workers)
            .values()
            .any(|record| record.status == WorkerStatus::Connected);
        if !any_live {
            self.advance(ServerState::Done);
        }
    }

    fn worker_param(params: &[Value]) -> Result<WorkerId, String> {
        params
            .first()
            .and_then(Value::as_u64)
            .and_then(|id| WorkerId::try_from(id).ok())
            .ok_or_else(|| "expected a worker id as the first parameter".to_string())
    }

    /// Handle one remote operation. Infallible operations return `Ok` with the
    /// method's result value; rejected calls carry a message back to the
    /// caller.
    pub fn dispatch(&self, method: &str, params: &[Value]) -> Result<Value, String> {
        self.touch_global();
        match method {
            "connect" | "keepalive" => {
                if self.interrupted() {
                    return Err("session interrupted".to_string());
                }
                let worker_id = Self::worker_param(params)?;
                self.touch_worker(worker_id)?;
                Ok(Value::Null)
            }
            "request_item" => {
                if self.interrupted() {
                    return Err("session interrupted".to_string());
                }
                let worker_id = Self::worker_param(params)?;
                self.touch_worker(worker_id)?;
                let item = lock(&self.queue).pop_front();
                Ok(item.map(Value::String).unwrap_or(Value::Null))
            }
            "report_result" => {
                if self.interrupted() {
                    return Err("session interrupted".to_string());
                }
                let worker_id = Self::worker_param(params)?;
                self.touch_worker(worker_id)?;
                let item = params
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| "expected an item name as the second parameter".to_string())?;
                let passed = params
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| "expected a pass flag as the third parameter".to_string())?;
                lock(&self.reports).push(ItemReport {
                    worker_id,
                    item: item.to_string(),
                    passed,
                });
                Ok(Value::Null)
            }
            "disconnect" => {
                let worker_id = Self::worker_param(params)?;
                self.touch_worker(worker_id)?;
                self.set_worker_status(worker_id, WorkerStatus::Disconnected);
                debug!(worker = worker_id, "worker disconnected");
                self.maybe_done();
                Ok(Value::Null)
            }
            "report_client_failure" => {
                let worker_id = Self::worker_param(params)?;
                warn!(worker = worker_id, "worker reported as failed");
                self.set_worker_status(worker_id, WorkerStatus::Failed);
                self.maybe_done();
                Ok(Value::Null)
            }
            "session_interrupted" => {
                self.interrupted.store(true, Ordering::SeqCst);
                self.advance(ServerState::Done);
                Ok(Value::Null)
            }
            other => Err(format!("unknown method '{other}'")),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn handle_rpc(
    State(state): State<Arc<SharedState>>,
    Json(request): Json<RpcRequest>,
) -> Json<RpcResponse> {
    match state.dispatch(&request.method, &request.params) {
        Ok(result) => Json(RpcResponse {
            ok: true,
            result,
            error: None,
        }),
        Err(message) => Json(RpcResponse {
            ok: false,
            result: Value::Null,
            error: Some(message),
        }),
    }
}

/// Running control server. Owns the serving thread; dropping it shuts the
/// server down.
pub struct ControlServer {
    state: Arc<SharedState>,
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind and start serving. Returns once the listener is up and the bound
    /// port is known; the state has left NotInitialized by then. `port` 0
    /// binds a dynamically assigned port.
    pub fn start(
        bind_addr: &str,
        port: u16,
        expected_workers: usize,
        items: Vec<String>,
    ) -> Result<ControlServer> {
        let state = Arc::new(SharedState::new(expected_workers, items));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u16>>();

        let bind = bind_addr.to_string();
        let serve_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("control-server".to_string())
            .spawn(move || serve(bind, port, serve_state, ready_tx, shutdown_rx))
            .context("failed to spawn control server thread")?;

        let port = ready_rx
            .recv_timeout(Duration::from_secs(10))
            .context("control server did not report readiness")??;
        info!(port, "control server listening");

        Ok(Self {
            state,
            port,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.state
    }

    /// Stop accepting requests and wait for the serving thread to finish.
    pub fn join(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("control server thread panicked");
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.join();
    }
}

fn serve(
    bind: String,
    port: u16,
    state: Arc<SharedState>,
    ready_tx: mpsc::Sender<Result<u16>>,
    shutdown_rx: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready_tx.send(Err(
                anyhow::Error::new(e).context("failed to build control server runtime")
            ));
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::bind((bind.as_str(), port)).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = ready_tx.send(Err(
                    anyhow::Error::new(e).context(format!("failed to bind {bind}:{port}"))
                ));
                return;
            }
        };
        let actual_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                let _ = ready_tx.send(Err(
                    anyhow::Error::new(e).context("failed to resolve bound address")
                ));
                return;
            }
        };

        // Serving is about to begin: leave NotInitialized before the port is
        // announced, so workers spawned afterwards always find us up.
        state.advance(ServerState::WaitForClients);

        let app = Router::new()
            .route("/rpc", post(handle_rpc))
            .with_state(Arc::clone(&state));
        let _ = ready_tx.send(Ok(actual_port));

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            warn!(error = %e, "control server exited with error");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn items(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fresh_state_is_not_initialized() {
        let state = SharedState::new(2, items(&["a"]));
        assert_eq!(state.state(), ServerState::NotInitialized);
        assert!(state.keep_waiting());
        assert!(!state.interrupted());
    }

    #[test]
    fn becomes_active_once_all_expected_workers_connect() {
        let state = SharedState::new(2, items(&["a", "b"]));
        state.advance(ServerState::WaitForClients);

        state.dispatch("connect", &[json!(1)]).unwrap();
        assert_eq!(state.state(), ServerState::WaitForClients);

        state.dispatch("connect", &[json!(2)]).unwrap();
        assert_eq!(state.state(), ServerState::Active);
    }

    #[test]
    fn request_item_drains_queue_atomically() {
        let state = SharedState::new(1, items(&["a", "b"]));
        state.advance(ServerState::WaitForClients);
        state.dispatch("connect", &[json!(1)]).unwrap();

        let first = state.dispatch("request_item", &[json!(1)]).unwrap();
        let second = state.dispatch("request_item", &[json!(1)]).unwrap();
        let drained = state.dispatch("request_item", &[json!(1)]).unwrap();

        assert_eq!(first, json!("a"));
        assert_eq!(second, json!("b"));
        assert_eq!(drained, Value::Null);
        assert_eq!(state.remaining_items(), 0);
    }

    #[test]
    fn done_when_queue_drained_and_workers_disconnected() {
        let state = SharedState::new(1, items(&["a"]));
        state.advance(ServerState::WaitForClients);
        state.dispatch("connect", &[json!(1)]).unwrap();
        state.dispatch("request_item", &[json!(1)]).unwrap();
        state
            .dispatch("report_result", &[json!(1), json!("a"), json!(true)])
            .unwrap();
        state.dispatch("request_item", &[json!(1)]).unwrap();

        assert_eq!(state.state(), ServerState::Active);
        state.dispatch("disconnect", &[json!(1)]).unwrap();
        assert_eq!(state.state(), ServerState::Done);
        assert!(!state.keep_waiting());
        assert_eq!(state.reported_count(), 1);
    }

    #[test]
    fn not_done_while_a_worker_is_still_live() {
        let state = SharedState::new(2, items(&[]));
        state.advance(ServerState::WaitForClients);
        state.dispatch("connect", &[json!(1)]).unwrap();
        state.dispatch("connect", &[json!(2)]).unwrap();

        state.dispatch("disconnect", &[json!(1)]).unwrap();
        assert_eq!(state.state(), ServerState::Active);

        state.dispatch("disconnect", &[json!(2)]).unwrap();
        assert_eq!(state.state(), ServerState::Done);
    }

    #[test]
    fn failed_worker_is_excluded_and_rejected() {
        let state = SharedState::new(2, items(&["a"]));
        state.advance(ServerState::WaitForClients);
        state.dispatch("connect", &[json!(1)]).unwrap();
        state.dispatch("connect", &[json!(2)]).unwrap();

        state
            .dispatch("report_client_failure", &[json!(2)])
            .unwrap();
        assert_eq!(state.worker_status(2), Some(WorkerStatus::Failed));

        let ages = state.connected_worker_ages();
        assert_eq!(ages.len(), 1);
        assert_eq!(ages[0].0, 1);

        let rejected = state.dispatch("keepalive", &[json!(2)]);
        assert!(rejected.is_err(), "failed worker must be rejected");
    }

    #[test]
    fn failure_of_last_live_worker_finishes_drained_session() {
        let state = SharedState::new(1, items(&["a"]));
        state.advance(ServerState::WaitForClients);
        state.dispatch("connect", &[json!(1)]).unwrap();
        state.dispatch("request_item", &[json!(1)]).unwrap();

        state
            .dispatch("report_client_failure", &[json!(1)])
            .unwrap();
        assert_eq!(state.state(), ServerState::Done);
    }

    #[test]
    fn session_interrupted_fails_future_requests_fast() {
        let state = SharedState::new(1, items(&["a"]));
        state.advance(ServerState::WaitForClients);
        state.dispatch("connect", &[json!(1)]).unwrap();

        state.dispatch("session_interrupted", &[]).unwrap();
        assert!(state.interrupted());
        assert_eq!(state.state(), ServerState::Done);

        assert!(state.dispatch("request_item", &[json!(1)]).is_err());
        assert!(state.dispatch("connect", &[json!(9)]).is_err());
    }

    #[test]
    fn worker_calls_refresh_both_timestamps() {
        let state = SharedState::new(1, items(&[]));
        state.advance(ServerState::WaitForClients);
        state.dispatch("connect", &[json!(1)]).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert!(state.last_request_age() >= Duration::from_millis(25));

        state.dispatch("keepalive", &[json!(1)]).unwrap();
        assert!(state.last_request_age() < Duration::from_millis(25));
        let ages = state.connected_worker_ages();
        assert!(ages[0].1 < Duration::from_millis(25));
    }

    #[test]
    fn unknown_method_and_bad_params_are_rejected() {
        let state = SharedState::new(1, items(&[]));
        assert!(state.dispatch("shutdown_everything", &[]).is_err());
        assert!(state.dispatch("connect", &[]).is_err());
        assert!(state.dispatch("connect", &[json!("one")]).is_err());
        assert!(
            state
                .dispatch("report_result", &[json!(1), json!("a")])
                .is_err()
        );
    }

    #[test]
    fn server_round_trip_over_http() {
        let mut server = ControlServer::start("127.0.0.1", 0, 1, items(&["a"])).unwrap();
        assert_ne!(server.port(), 0);
        assert_eq!(server.shared().state(), ServerState::WaitForClients);

        let url = format!("http://127.0.0.1:{}/rpc", server.port());
        let response = ureq::post(&url)
            .send_json(json!({ "method": "connect", "params": [1] }))
            .unwrap();
        let response: RpcResponse = response.into_json().unwrap();
        assert!(response.ok);
        assert_eq!(server.shared().state(), ServerState::Active);

        let response = ureq::post(&url)
            .send_json(json!({ "method": "no_such_method", "params": [] }))
            .unwrap();
        let response: RpcResponse = response.into_json().unwrap();
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("unknown method"));

        server.join();
    }

    proptest! {
        /// State transitions only move forward, whatever order advancement is
        /// attempted in.
        #[test]
        fn state_never_moves_backwards(steps in proptest::collection::vec(0u8..=3, 1..20)) {
            let state = SharedState::new(1, vec![]);
            let mut highest = ServerState::NotInitialized;
            for step in steps {
                let target = ServerState::from_u8(step);
                state.advance(target);
                highest = highest.max(target);
                prop_assert_eq!(state.state(), highest);
            }
        }
    }
}
