//! Blocking RPC client for the control server.
//!
//! Both sides of the session use this surface: workers drive their item loop
//! through it, and the coordinator reports failures and interruption through
//! the same HTTP endpoint a remote caller would see.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use crate::server::{RpcResponse, WorkerId};

pub struct ControlProxy {
    endpoint: String,
    agent: ureq::Agent,
}

impl ControlProxy {
    pub fn new(server_addr: &str, port: u16) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .build();
        Self {
            endpoint: format!("http://{server_addr}:{port}/rpc"),
            agent,
        }
    }

    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(json!({ "method": method, "params": params }))
            .with_context(|| format!("rpc '{method}' failed"))?;
        let response: RpcResponse = response
            .into_json()
            .with_context(|| format!("rpc '{method}' returned a malformed response"))?;
        if !response.ok {
            bail!(
                "rpc '{method}' rejected: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        Ok(response.result)
    }

    pub fn connect(&self, worker_id: WorkerId) -> Result<()> {
        self.call("connect", vec![json!(worker_id)]).map(drop)
    }

    pub fn keepalive(&self, worker_id: WorkerId) -> Result<()> {
        self.call("keepalive", vec![json!(worker_id)]).map(drop)
    }

    /// Ask for the next item; `None` once the queue is drained.
    pub fn request_item(&self, worker_id: WorkerId) -> Result<Option<String>> {
        match self.call("request_item", vec![json!(worker_id)])? {
            Value::String(item) => Ok(Some(item)),
            _ => Ok(None),
        }
    }

    pub fn report_result(&self, worker_id: WorkerId, item: &str, passed: bool) -> Result<()> {
        self.call(
            "report_result",
            vec![json!(worker_id), json!(item), json!(passed)],
        )
        .map(drop)
    }

    pub fn disconnect(&self, worker_id: WorkerId) -> Result<()> {
        self.call("disconnect", vec![json!(worker_id)]).map(drop)
    }

    pub fn report_client_failure(&self, worker_id: WorkerId) -> Result<()> {
        self.call("report_client_failure", vec![json!(worker_id)])
            .map(drop)
    }

    pub fn session_interrupted(&self) -> Result<()> {
        self.call("session_interrupted", vec![]).map(drop)
    }
}
