use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "shardrun",
    about = "Parallel test-session coordinator with per-worker supervision",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a session, fanning the items out across parallel workers
    Run {
        /// Item names to distribute (tests, suites, whatever the runner takes)
        items: Vec<String>,

        /// Number of parallel workers (overrides the config file)
        #[arg(long)]
        workers: Option<usize>,

        /// Host each worker in its own tmux window instead of a background process
        #[arg(long)]
        tmux: bool,

        /// Internal: set when this process is a worker of a parent session
        #[arg(long = "parallel_parent_session_id", hide = true)]
        parallel_parent_session_id: Option<String>,

        /// Internal: this worker's id within the parent session
        #[arg(long = "parallel_worker_id", hide = true)]
        parallel_worker_id: Option<u32>,

        /// Internal: control server port of the parent session
        #[arg(long = "parallel_port", hide = true)]
        parallel_port: Option<u16>,
    },

    /// Show project configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
