//! Session hook registry.
//!
//! An explicit registry value owned by the session, with a fixed enumerated
//! set of named events. Components that want to fire or observe events hold a
//! reference to the registry instead of reaching for global state.

use std::collections::HashMap;

use crate::server::WorkerId;

/// The complete set of events a session can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// Fired right after the session starts.
    SessionStart,
    /// Fired right before the session ends, regardless of the reason.
    SessionEnd,
    /// A worker process or window was launched.
    WorkerSpawned,
    /// A worker was killed or marked dead after a communication timeout.
    WorkerFailed,
    /// The session was interrupted externally.
    SessionInterrupted,
}

/// Context handed to every hook invocation.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub session_id: &'a str,
    /// Set for worker-scoped events, `None` for session-scoped ones.
    pub worker_id: Option<WorkerId>,
}

type HookFn = Box<dyn Fn(&HookContext) + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    handlers: HashMap<SessionEvent, Vec<HookFn>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for `event`. Hooks fire in registration order.
    pub fn on(&mut self, event: SessionEvent, hook: impl Fn(&HookContext) + Send + Sync + 'static) {
        self.handlers.entry(event).or_default().push(Box::new(hook));
    }

    pub fn fire(&self, event: SessionEvent, ctx: &HookContext) {
        for hook in self.handlers.get(&event).into_iter().flatten() {
            hook(ctx);
        }
    }
}
