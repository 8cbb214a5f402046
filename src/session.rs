//! Top-level session wiring: identity, substrate setup, signal handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::config::ProjectConfig;
use crate::coordinator::Coordinator;
use crate::error::SessionError;
use crate::hooks::{HookContext, HookRegistry, SessionEvent};
use crate::host::HostSubstrate;
use crate::server::ControlServer;
use crate::tmux;

pub struct Session<'a> {
    id: String,
    config: &'a ProjectConfig,
    hooks: &'a HookRegistry,
}

impl<'a> Session<'a> {
    pub fn new(config: &'a ProjectConfig, hooks: &'a HookRegistry) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            hooks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn build_substrate(&self) -> Result<HostSubstrate> {
        if !self.config.run.tmux {
            return Ok(HostSubstrate::Process);
        }
        tmux::check_tmux()?;
        let session = tmux::session_name(&self.id);
        tmux::create_session(&session)
            .with_context(|| format!("failed to create tmux session '{session}'"))?;
        info!(session = %session, "workers will run as tmux windows");
        Ok(HostSubstrate::TmuxWindow { session })
    }

    /// Run one parallel session to completion: start the control server,
    /// fan the item queue out across workers, and supervise until done.
    pub fn run(
        &self,
        items: Vec<String>,
        forwarded_args: Vec<String>,
    ) -> Result<(), SessionError> {
        info!(
            session = %self.id,
            workers = self.config.parallel.num_workers,
            items = items.len(),
            "starting parallel session"
        );
        self.hooks.fire(
            SessionEvent::SessionStart,
            &HookContext {
                session_id: &self.id,
                worker_id: None,
            },
        );

        // SessionEnd pairs with SessionStart whatever the outcome, including
        // failures before a single worker exists.
        let result = self.drive(items, forwarded_args);

        self.hooks.fire(
            SessionEvent::SessionEnd,
            &HookContext {
                session_id: &self.id,
                worker_id: None,
            },
        );
        result
    }

    fn drive(&self, items: Vec<String>, forwarded_args: Vec<String>) -> Result<(), SessionError> {
        let substrate = self.build_substrate()?;

        // The server must be listening before any worker launches, so the
        // port forwarded on the worker command line is already live.
        let server = ControlServer::start(
            &self.config.parallel.server_addr,
            self.config.parallel.server_port,
            self.config.parallel.num_workers,
            items,
        )
        .map_err(|source| SessionError::ServerUnreachable { source })?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop_flag.store(true, Ordering::Relaxed);
        })
        .ok();

        let mut coordinator = Coordinator::new(
            self.config,
            &self.id,
            forwarded_args,
            substrate,
            server,
            stop,
            self.hooks,
        );
        coordinator.run()
    }
}
