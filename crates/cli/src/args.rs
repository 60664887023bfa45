use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lynx")]
#[command(version)]
#[command(about = "Privilege-separated local network discovery", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover hosts (or scan ports) across the targets
    Scan(ScanArgs),

    /// List discovery methods and whether they need privilege
    Methods,

    /// Inspect or set up raw-socket privilege
    Privilege {
        #[command(subcommand)]
        action: PrivilegeAction,

        #[command(flatten)]
        helper: HelperArgs,
    },

    /// Check that the privileged daemon is alive
    Ping {
        #[command(flatten)]
        helper: HelperArgs,
    },
}

#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrivilegeAction {
    /// Report the current privilege state
    Status,
    /// Ask the OS to grant privilege (may prompt)
    Setup,
}

/// Where the privileged helper lives.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct HelperArgs {
    /// Daemon socket path
    #[arg(long, env = "LYNX_HELPER_SOCKET", global = true)]
    pub socket: Option<PathBuf>,

    /// Worker binary (defaults to lynx-worker beside this executable)
    #[arg(long, env = "LYNX_WORKER", global = true)]
    pub worker: Option<PathBuf>,
}

#[derive(clap::Args, Clone, Debug)]
pub struct ScanArgs {
    /// Targets: addresses, CIDR blocks, ranges, or hostnames. Example: 192.168.1.0/24
    #[arg(short = 't', long, required = true)]
    pub targets: String,

    /// Ports. Examples: 80,443 or 1-1024 or web, common, all
    #[arg(short, long)]
    pub ports: Option<String>,

    /// Discovery methods, comma separated, or "all"
    #[arg(short, long, default_value = "all")]
    pub methods: String,

    /// Per-target timeout in milliseconds (defaults to the preset's)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Timeout across all methods in milliseconds (defaults to the preset's)
    #[arg(long)]
    pub global_timeout: Option<u64>,

    /// Max concurrent probes per method
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Rate limit (probes per second)
    #[arg(short = 'r', long)]
    pub rate_limit: Option<u64>,

    /// Preset: fast, balanced, accurate
    #[arg(long, value_enum, default_value_t = Preset::Balanced)]
    pub preset: Preset,

    /// discover stops at first evidence per host; scan probes every port
    #[arg(long, value_enum, default_value_t = Mode::Discover)]
    pub mode: Mode,

    /// Look up reverse DNS names for hosts that have none
    #[arg(long)]
    pub resolve_names: bool,

    /// Where privileged methods run
    #[arg(long, value_enum, default_value_t = Route::Auto)]
    pub route: Route,

    /// Output format: text, json, csv
    #[arg(short, long = "output", default_value = "text")]
    pub output_format: String,

    #[command(flatten)]
    pub helper: HelperArgs,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preset {
    Fast,
    Balanced,
    Accurate,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Discover,
    Scan,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Daemon if its socket exists, else the worker subprocess, else in-process
    Auto,
    /// In-process, with whatever privilege this process has
    Local,
    /// A lynx-worker child per operation
    Subprocess,
    /// The lynx-daemon socket
    Ipc,
}
