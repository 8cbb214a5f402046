//! Session coordinator: spawns workers, watches their liveness, and drives
//! teardown and escalation.
//!
//! Two execution contexts live in this process: the coordinator's sequential
//! control loop here, and the control server's request-serving thread. The
//! loop observes server state with fixed-interval polls; detection latency is
//! bounded by one poll interval.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use crate::config::ProjectConfig;
use crate::error::SessionError;
use crate::hooks::{HookContext, HookRegistry, SessionEvent};
use crate::host::{HostSubstrate, WorkerHandle};
use crate::proxy::ControlProxy;
use crate::server::{ControlServer, ServerState, SharedState, WorkerId};
use crate::tmux;

const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_CONNECTION_RETRIES: u32 = 200;

/// Lifecycle of one worker as seen from the parent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawned,
    Connected,
    /// Stopped communicating; found already dead when checked.
    TimedOut,
    Killed,
}

#[derive(Debug)]
pub struct Worker {
    pub handle: WorkerHandle,
    pub state: WorkerState,
}

pub struct Coordinator<'a> {
    config: &'a ProjectConfig,
    session_id: String,
    forwarded_args: Vec<String>,
    substrate: HostSubstrate,
    server: ControlServer,
    shared: Arc<SharedState>,
    proxy: ControlProxy,
    workers: BTreeMap<WorkerId, Worker>,
    next_worker_id: WorkerId,
    stop: Arc<AtomicBool>,
    hooks: &'a HookRegistry,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        config: &'a ProjectConfig,
        session_id: &str,
        forwarded_args: Vec<String>,
        substrate: HostSubstrate,
        server: ControlServer,
        stop: Arc<AtomicBool>,
        hooks: &'a HookRegistry,
    ) -> Self {
        let shared = Arc::clone(server.shared());
        let proxy = ControlProxy::new(&config.parallel.server_addr, server.port());
        Self {
            config,
            session_id: session_id.to_string(),
            forwarded_args,
            substrate,
            server,
            shared,
            proxy,
            workers: BTreeMap::new(),
            next_worker_id: 1,
            stop,
            hooks,
        }
    }

    pub fn workers(&self) -> &BTreeMap<WorkerId, Worker> {
        &self.workers
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn server_port(&self) -> u16 {
        self.server.port()
    }

    fn context(&self, worker_id: Option<WorkerId>) -> HookContext<'_> {
        HookContext {
            session_id: &self.session_id,
            worker_id,
        }
    }

    /// Poll until the server leaves NotInitialized, with a bounded retry
    /// budget.
    pub fn try_connect(&self) -> Result<(), SessionError> {
        let mut retries = 0;
        while self.shared.state() == ServerState::NotInitialized {
            if retries == MAX_CONNECTION_RETRIES {
                return Err(SessionError::ServerUnreachable {
                    source: anyhow::anyhow!(
                        "server did not initialize after {MAX_CONNECTION_RETRIES} connection attempts"
                    ),
                });
            }
            std::thread::sleep(CONNECT_POLL_INTERVAL);
            retries += 1;
        }
        Ok(())
    }

    fn worker_command(&self) -> Result<(String, Vec<String>), SessionError> {
        let program = if self.config.run.worker_program.is_empty() {
            std::env::current_exe()
                .context("failed to resolve current executable for worker launch")?
                .display()
                .to_string()
        } else {
            self.config.run.worker_program.clone()
        };

        let mut args = vec![
            "run".to_string(),
            "--parallel_parent_session_id".to_string(),
            self.session_id.clone(),
        ];
        args.extend(self.forwarded_args.iter().cloned());
        Ok((program, args))
    }

    /// Launch the next worker. Spawn failures are fatal to the session.
    pub fn spawn_worker(&mut self) -> Result<(), SessionError> {
        let worker_id = self.next_worker_id;
        info!(worker = worker_id, "starting worker");

        let (program, mut args) = self.worker_command()?;
        args.push("--parallel_worker_id".to_string());
        args.push(worker_id.to_string());
        if self.config.parallel.server_port == 0 {
            args.push("--parallel_port".to_string());
            args.push(self.server.port().to_string());
        }

        let name = format!("worker-{worker_id}");
        let handle = self
            .substrate
            .launch(&name, &program, &args)
            .map_err(|source| SessionError::SpawnFailed { worker_id, source })?;

        self.workers.insert(
            worker_id,
            Worker {
                handle,
                state: WorkerState::Spawned,
            },
        );
        self.next_worker_id += 1;
        self.hooks
            .fire(SessionEvent::WorkerSpawned, &self.context(Some(worker_id)));
        Ok(())
    }

    /// Block until every expected worker has made first contact, or tear the
    /// session down when the connect timeout is breached.
    pub fn wait_all_workers_connected(&mut self) -> Result<(), SessionError> {
        let timeout = self.config.parallel.connect_timeout();
        while self.shared.state() == ServerState::WaitForClients {
            if self.stop.load(Ordering::Relaxed) {
                return Err(SessionError::Interrupted);
            }
            if self.shared.last_request_age() > timeout {
                error!("not all workers connected to the control server; terminating");
                self.terminate_all();
                return Err(SessionError::ConnectTimeout { timeout });
            }
            std::thread::sleep(self.config.parallel.poll_interval());
        }

        for worker in self.workers.values_mut() {
            if worker.state == WorkerState::Spawned {
                worker.state = WorkerState::Connected;
            }
        }
        Ok(())
    }

    /// Kill or mark every worker whose last connection is older than the
    /// communication timeout, and report it to the server. Non-fatal: the
    /// session carries on with the remaining workers.
    pub fn check_timed_out_workers(&mut self) {
        let timeout = self.config.parallel.communication_timeout();
        let window_substrate = matches!(self.substrate, HostSubstrate::TmuxWindow { .. });

        for (worker_id, age) in self.shared.connected_worker_ages() {
            if age <= timeout {
                continue;
            }
            error!(
                worker = worker_id,
                silent_for_secs = age.as_secs(),
                "worker stopped communicating"
            );

            if let Some(worker) = self.workers.get_mut(&worker_id) {
                if window_substrate {
                    // Keep the window around for postmortem inspection.
                    if let Err(e) = worker.handle.rename(&format!("stopped_worker_{worker_id}")) {
                        warn!(worker = worker_id, error = %e, "failed to rename dead worker window");
                    }
                    worker.state = WorkerState::TimedOut;
                } else {
                    match worker.handle.poll() {
                        Ok(None) => {
                            if let Err(e) = worker.handle.kill() {
                                warn!(worker = worker_id, error = %e, "failed to kill timed-out worker");
                            }
                            worker.state = WorkerState::Killed;
                        }
                        Ok(Some(_)) => worker.state = WorkerState::TimedOut,
                        Err(e) => {
                            warn!(worker = worker_id, error = %e, "failed to poll timed-out worker");
                            worker.state = WorkerState::TimedOut;
                        }
                    }
                }
            }

            if let Err(e) = self.proxy.report_client_failure(worker_id) {
                warn!(worker = worker_id, error = %e, "failed to report worker failure");
            }
            self.hooks
                .fire(SessionEvent::WorkerFailed, &self.context(Some(worker_id)));
        }
    }

    /// Tear everything down when no request has reached the server for the
    /// configured idle window.
    pub fn check_idle_timeout(&mut self) -> Result<(), SessionError> {
        let timeout = self.config.parallel.no_request_timeout();
        let age = self.shared.last_request_age();
        if age > timeout {
            error!(
                idle_for_secs = age.as_secs(),
                "no request reached the control server; terminating"
            );
            self.terminate_all();
            return Err(SessionError::IdleTimeout { timeout });
        }
        Ok(())
    }

    /// Best-effort teardown: kill every worker handle, then tell the server
    /// the session is interrupted. Failures are logged and never mask the
    /// primary error.
    pub fn terminate_all(&mut self) {
        for (worker_id, worker) in &mut self.workers {
            if let Err(e) = worker.handle.kill() {
                warn!(worker = *worker_id, error = %e, "failed to kill worker during teardown");
            }
            worker.state = WorkerState::Killed;
        }
        if let Err(e) = self.proxy.session_interrupted() {
            warn!(error = %e, "failed to notify control server of interruption");
        }
    }

    fn supervise(&mut self) -> Result<(), SessionError> {
        self.wait_all_workers_connected()?;
        while self.shared.keep_waiting() {
            if self.stop.load(Ordering::Relaxed) {
                return Err(SessionError::Interrupted);
            }
            self.check_timed_out_workers();
            self.check_idle_timeout()?;
            std::thread::sleep(self.config.parallel.poll_interval());
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<(), SessionError> {
        self.try_connect()?;
        for _ in 0..self.config.parallel.num_workers {
            self.spawn_worker()?;
        }
        self.supervise()
    }

    /// Run the whole session: connect, fan out, supervise, tear down.
    pub fn run(&mut self) -> Result<(), SessionError> {
        let mut result = self.execute();

        if matches!(result, Err(SessionError::Interrupted)) {
            error!("session interrupted, stopping workers and terminating");
            self.hooks
                .fire(SessionEvent::SessionInterrupted, &self.context(None));
            match self.substrate.clone() {
                HostSubstrate::TmuxWindow { session } => {
                    // Killing the hosting session takes every worker window
                    // with it; the interrupt is not re-raised under the window
                    // substrate.
                    if let Err(e) = tmux::kill_session(&session) {
                        warn!(error = %e, "failed to kill tmux session during teardown");
                    }
                    result = Ok(());
                }
                HostSubstrate::Process => self.terminate_all(),
            }
        }

        self.finish();
        if result.is_ok() {
            info!(
                reported = self.shared.reported_count(),
                "session complete"
            );
        }
        result
    }

    /// Wait for every spawned process and join the server thread. Under the
    /// window substrate the tmux session outlives us on purpose.
    fn finish(&mut self) {
        if self.substrate == HostSubstrate::Process {
            for (worker_id, worker) in &mut self.workers {
                if let Err(e) = worker.handle.wait() {
                    warn!(worker = *worker_id, error = %e, "failed to wait for worker exit");
                }
            }
            self.server.join();
        }
    }
}
