//! tmux session and window management for the window hosting substrate.
//!
//! Wraps tmux CLI commands: one detached session per run, one window per
//! worker. A dead worker's window is renamed rather than destroyed so it stays
//! around for postmortem inspection.

use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

/// Check that tmux is installed and reachable.
pub fn check_tmux() -> Result<String> {
    let output = Command::new("tmux").arg("-V").output().context(
        "tmux not found — install tmux (e.g., `apt install tmux` or `brew install tmux`) \
         or run without --tmux",
    )?;

    if !output.status.success() {
        bail!(
            "tmux -V failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(version = %version, "tmux found");
    Ok(version)
}

fn run_tmux<I, S>(args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    Command::new("tmux")
        .args(args)
        .output()
        .context("failed to run tmux command")
}

/// Convention for session names: `shardrun-<session id>`.
pub fn session_name(session_id: &str) -> String {
    // tmux target parsing treats '.' and ':' as separators, so session names
    // avoid punctuation that could be interpreted.
    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("shardrun-{sanitized}")
}

/// Check if a tmux session exists.
pub fn session_exists(session: &str) -> bool {
    Command::new("tmux")
        .args(["has-session", "-t", session])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Create a detached tmux session to host worker windows.
///
/// The first window runs the user's default shell; workers are added as
/// separate windows via [`new_window`].
pub fn create_session(session: &str) -> Result<()> {
    if session_exists(session) {
        bail!(
            "tmux session '{session}' already exists — kill it with \
             `tmux kill-session -t {session}`"
        );
    }

    let output = run_tmux(["new-session", "-d", "-s", session, "-x", "220", "-y", "50"])
        .with_context(|| format!("failed to create tmux session '{session}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("tmux new-session failed: {stderr}");
    }

    info!(session = session, "tmux session created");
    Ok(())
}

/// Kill a tmux session.
pub fn kill_session(session: &str) -> Result<()> {
    if !session_exists(session) {
        return Ok(()); // already gone
    }

    let output = run_tmux(["kill-session", "-t", session])
        .with_context(|| format!("failed to kill tmux session '{session}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("tmux kill-session failed: {stderr}");
    }

    info!(session = session, "tmux session killed");
    Ok(())
}

/// Create a detached window in `session` running the given command.
///
/// Returns the window id (for example `@3`), which stays valid across renames.
pub fn new_window(session: &str, name: &str, command: &[String]) -> Result<String> {
    let mut cmd = Command::new("tmux");
    cmd.args([
        "new-window",
        "-d",
        "-P",
        "-F",
        "#{window_id}",
        "-t",
        session,
        "-n",
        name,
    ]);
    for arg in command {
        cmd.arg(arg);
    }

    let output = cmd
        .output()
        .with_context(|| format!("failed to create window '{name}' in session '{session}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("tmux new-window failed: {stderr}");
    }

    let window_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if window_id.is_empty() {
        bail!("tmux returned empty window id for '{name}' in session '{session}'");
    }

    debug!(session = session, window = %window_id, name = name, "tmux window created");
    Ok(window_id)
}

/// Rename a window, addressed by its window id.
pub fn rename_window(window_id: &str, name: &str) -> Result<()> {
    let output = run_tmux(["rename-window", "-t", window_id, name])
        .with_context(|| format!("failed to rename window '{window_id}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("tmux rename-window failed: {stderr}");
    }

    Ok(())
}

/// Kill a window, addressed by its window id.
pub fn kill_window(window_id: &str) -> Result<()> {
    if !window_exists(window_id) {
        return Ok(()); // already gone
    }

    let output = run_tmux(["kill-window", "-t", window_id])
        .with_context(|| format!("failed to kill window '{window_id}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("tmux kill-window failed: {stderr}");
    }

    Ok(())
}

/// Check if a window id still resolves.
pub fn window_exists(window_id: &str) -> bool {
    Command::new("tmux")
        .args(["display-message", "-p", "-t", window_id, "#{window_id}"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn session_name_convention() {
        assert_eq!(session_name("abc123"), "shardrun-abc123");
        assert_eq!(
            session_name("4f2c0d1e-aa55-4a10-9d5c-1b2e3f4a5b6c"),
            "shardrun-4f2c0d1e-aa55-4a10-9d5c-1b2e3f4a5b6c"
        );
        assert_eq!(session_name("run 1.5"), "shardrun-run-1-5");
    }

    #[test]
    #[serial]
    fn check_tmux_finds_binary() {
        let version = check_tmux().unwrap();
        assert!(
            version.starts_with("tmux"),
            "expected tmux version, got: {version}"
        );
    }

    #[test]
    #[serial]
    fn create_and_kill_session() {
        let session = "shardrun-test-lifecycle";
        let _ = kill_session(session);

        create_session(session).unwrap();
        assert!(session_exists(session));

        kill_session(session).unwrap();
        assert!(!session_exists(session));
    }

    #[test]
    #[serial]
    fn duplicate_session_is_error() {
        let session = "shardrun-test-dup";
        let _ = kill_session(session);

        create_session(session).unwrap();
        let result = create_session(session);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already exists"));

        kill_session(session).unwrap();
    }

    #[test]
    #[serial]
    fn window_lifecycle_and_rename() {
        let session = "shardrun-test-windows";
        let _ = kill_session(session);
        create_session(session).unwrap();

        let window = new_window(
            session,
            "worker-1",
            &["sleep".to_string(), "10".to_string()],
        )
        .unwrap();
        assert!(window.starts_with('@'), "expected window id, got: {window}");
        assert!(window_exists(&window));

        rename_window(&window, "stopped_worker_1").unwrap();
        // Renaming must not destroy the window.
        assert!(window_exists(&window));

        kill_window(&window).unwrap();
        assert!(!window_exists(&window));

        kill_session(session).unwrap();
    }

    #[test]
    #[serial]
    fn kill_nonexistent_session_is_ok() {
        kill_session("shardrun-test-nonexistent-99999").unwrap();
    }
}
