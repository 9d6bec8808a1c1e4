//! CLI argument parsing for cauce

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cauce")]
#[command(version)]
#[command(
    about = "Turn per-user workstation activity logs into one anonymized canonical event stream",
    long_about = None
)]
pub struct Cli {
    /// Enable debug diagnostics on stderr
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Print the resolved rule namespace and exit
    #[arg(long = "dump-rules")]
    pub dump_rules: bool,

    /// Rule file driving the run
    pub rules_file: PathBuf,

    /// Restrict the run to these rules (full name or prefix); all rules
    /// in declaration order when omitted
    pub rules: Vec<String>,
}
