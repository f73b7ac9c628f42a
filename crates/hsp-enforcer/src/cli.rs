use clap::Parser;
use hsp_engine::DefaultPosture;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "hsp-enforcer",
    version,
    about = "Host security policy enforcement daemon"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Directory of policy documents (overrides config file setting)
    #[arg(short, long)]
    pub policy_dir: Option<PathBuf>,

    /// JSON-lines file of access events to enforce; `-` or omitted reads stdin
    #[arg(short, long)]
    pub events: Option<PathBuf>,

    /// Verdict for events no rule matches: allow or block (overrides config)
    #[arg(long)]
    pub default_posture: Option<DefaultPosture>,

    /// Record every verdict, not only blocks and audit rules
    #[arg(long)]
    pub audit_all: bool,

    /// Alert log path (overrides config file setting)
    #[arg(long)]
    pub audit_log: Option<PathBuf>,
}
