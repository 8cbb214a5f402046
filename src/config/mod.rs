use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".shardrun";

fn default_num_workers() -> usize {
    1
}

fn default_server_addr() -> String {
    "localhost".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_communication_timeout_secs() -> u64 {
    60
}

fn default_no_request_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_millis() -> u64 {
    2000
}

/// `[parallel]` section: worker fan-out and liveness timeouts.
#[derive(Debug, Deserialize)]
pub struct ParallelConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// 0 binds a dynamically assigned port.
    #[serde(default)]
    pub server_port: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_communication_timeout_secs")]
    pub communication_timeout_secs: u64,
    #[serde(default = "default_no_request_timeout_secs")]
    pub no_request_timeout_secs: u64,
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
}

impl ParallelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn communication_timeout(&self) -> Duration {
        Duration::from_secs(self.communication_timeout_secs)
    }

    pub fn no_request_timeout(&self) -> Duration {
        Duration::from_secs(self.no_request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            server_addr: default_server_addr(),
            server_port: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
            communication_timeout_secs: default_communication_timeout_secs(),
            no_request_timeout_secs: default_no_request_timeout_secs(),
            poll_interval_millis: default_poll_interval_millis(),
        }
    }
}

/// `[run]` section: worker hosting choices.
#[derive(Debug, Deserialize, Default)]
pub struct RunConfig {
    /// Host workers as tmux windows instead of detached background processes.
    #[serde(default)]
    pub tmux: bool,
    /// Program used to launch a worker. Empty re-executes the current binary.
    #[serde(default)]
    pub worker_program: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub parallel: ParallelConfig,
    #[serde(default)]
    pub run: RunConfig,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.shardrun/config.toml` file and load
    /// it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.parallel.num_workers, 1);
        assert_eq!(config.parallel.server_addr, "localhost");
        assert_eq!(config.parallel.server_port, 0);
        assert_eq!(config.parallel.connect_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.parallel.communication_timeout(),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.parallel.no_request_timeout(),
            Duration::from_secs(60)
        );
        assert_eq!(config.parallel.poll_interval(), Duration::from_millis(2000));
        assert!(!config.run.tmux);
        assert!(config.run.worker_program.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[parallel]
num_workers = 4
server_addr = "127.0.0.1"
server_port = 8123
connect_timeout_secs = 10
communication_timeout_secs = 20
no_request_timeout_secs = 90
poll_interval_millis = 500

[run]
tmux = true
worker_program = "/usr/local/bin/suite-worker"
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.parallel.num_workers, 4);
        assert_eq!(config.parallel.server_addr, "127.0.0.1");
        assert_eq!(config.parallel.server_port, 8123);
        assert_eq!(config.parallel.connect_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.parallel.communication_timeout(),
            Duration::from_secs(20)
        );
        assert_eq!(
            config.parallel.no_request_timeout(),
            Duration::from_secs(90)
        );
        assert_eq!(config.parallel.poll_interval(), Duration::from_millis(500));
        assert!(config.run.tmux);
        assert_eq!(config.run.worker_program, "/usr/local/bin/suite-worker");
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[parallel]
num_workers = 8
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.parallel.num_workers, 8);
        assert_eq!(config.parallel.server_port, 0);
        assert_eq!(config.parallel.connect_timeout(), Duration::from_secs(30));
        assert!(!config.run.tmux);
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(".shardrun");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("config.toml"),
            r#"
[parallel]
num_workers = 2
server_port = 9000
"#,
        )
        .unwrap();

        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_some());
        assert_eq!(config.parallel.num_workers, 2);
        assert_eq!(config.parallel.server_port, 9000);
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.parallel.num_workers, 1);
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(".shardrun");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("config.toml"),
            r#"
[parallel]
num_workers = 6
"#,
        )
        .unwrap();

        let nested = tmp.path().join("suites").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.parallel.num_workers, 6);
    }
}
