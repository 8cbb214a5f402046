mod cli;
mod config;
mod coordinator;
mod error;
mod hooks;
mod host;
mod proxy;
mod server;
mod session;
mod tmux;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing::info;

use cli::{Cli, Command};
use config::ProjectConfig;
use hooks::HookRegistry;
use proxy::ControlProxy;
use session::Session;

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .shardrun/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<28} {value}\n"));
}

fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Parallel\n");
    push_kv(&mut output, "num_workers", config.parallel.num_workers);
    push_kv(&mut output, "server_addr", &config.parallel.server_addr);
    if config.parallel.server_port == 0 {
        push_kv(&mut output, "server_port", "(dynamic)");
    } else {
        push_kv(&mut output, "server_port", config.parallel.server_port);
    }
    push_kv(
        &mut output,
        "connect_timeout",
        format!("{}s", config.parallel.connect_timeout_secs),
    );
    push_kv(
        &mut output,
        "communication_timeout",
        format!("{}s", config.parallel.communication_timeout_secs),
    );
    push_kv(
        &mut output,
        "no_request_timeout",
        format!("{}s", config.parallel.no_request_timeout_secs),
    );
    push_kv(
        &mut output,
        "poll_interval",
        format!("{}ms", config.parallel.poll_interval_millis),
    );
    output.push('\n');

    output.push_str("Run\n");
    push_kv(&mut output, "tmux", config.run.tmux);
    if config.run.worker_program.is_empty() {
        push_kv(&mut output, "worker_program", "(current binary)");
    } else {
        push_kv(&mut output, "worker_program", &config.run.worker_program);
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "parallel": {
            "num_workers": config.parallel.num_workers,
            "server_addr": &config.parallel.server_addr,
            "server_port": config.parallel.server_port,
            "connect_timeout_secs": config.parallel.connect_timeout_secs,
            "communication_timeout_secs": config.parallel.communication_timeout_secs,
            "no_request_timeout_secs": config.parallel.no_request_timeout_secs,
            "poll_interval_millis": config.parallel.poll_interval_millis
        },
        "run": {
            "tmux": config.run.tmux,
            "worker_program": &config.run.worker_program
        },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

/// Worker mode: this process was launched by a parent session's coordinator
/// and should consume items instead of fanning out its own.
fn run_as_worker(
    config: &ProjectConfig,
    parent_session_id: &str,
    worker_id: u32,
    port: Option<u16>,
) -> Result<()> {
    let port = match port {
        Some(port) => port,
        None if config.parallel.server_port != 0 => config.parallel.server_port,
        None => anyhow::bail!(
            "worker mode requires --parallel_port or a fixed server_port in the config"
        ),
    };

    info!(
        session = parent_session_id,
        worker = worker_id,
        port,
        "running in worker mode"
    );
    let proxy = ControlProxy::new(&config.parallel.server_addr, port);
    worker::run_worker(&proxy, worker_id, |item| {
        info!(worker = worker_id, item = %item, "executing item");
        true
    })?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "shardrun=warn",
        0 => "shardrun=info",
        1 => "shardrun=debug",
        _ => "shardrun=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd =
        std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (mut config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .shardrun/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            items,
            workers,
            tmux,
            parallel_parent_session_id,
            parallel_worker_id,
            parallel_port,
        } => {
            if let Some(worker_id) = parallel_worker_id {
                let parent = parallel_parent_session_id.as_deref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "worker mode requires --parallel_parent_session_id; \
                         these flags are set by the parent session"
                    )
                })?;
                return run_as_worker(&config, parent, worker_id, parallel_port);
            }

            if let Some(workers) = workers {
                config.parallel.num_workers = workers;
            }
            if tmux {
                config.run.tmux = true;
            }

            let hooks = HookRegistry::new();
            let session = Session::new(&config, &hooks);
            let forwarded = items.clone();
            session.run(items, forwarded)?;
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
    }

    Ok(())
}
