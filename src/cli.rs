//! CLI definition for the elector binary.
//!
//! Every flag has an `ELECTOR_*` environment mirror so the binary drops into
//! process supervisors and container specs without argument plumbing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

/// Elect a leader.
///
/// Exactly one cohort member holds leadership for the configured keyspace;
/// the leader start/end commands run on transitions.
#[derive(Parser, Debug)]
#[command(name = "elector")]
#[command(version)]
#[command(about = "elect a leader")]
pub struct Cli {
    /// Keyspace to elect on
    #[arg(long, global = true, env = "ELECTOR_KEY")]
    pub keyspace: Option<String>,

    /// Backend name
    #[arg(long, global = true, env = "ELECTOR_BACKEND", value_enum)]
    pub backend: Option<BackendKind>,

    /// Leader start command - runs when state changes to LEADER
    #[arg(long, global = true, env = "ELECTOR_START_COMMAND")]
    pub leader_start_command: Option<String>,

    /// Leader end command - runs when state changes from LEADER
    #[arg(long, global = true, env = "ELECTOR_STOP_COMMAND")]
    pub leader_end_command: Option<String>,

    /// etcd members (repeatable or comma separated)
    #[arg(
        long = "etcd-members",
        global = true,
        env = "ELECTOR_ETCD_MEMBERS",
        value_delimiter = ','
    )]
    pub etcd_members: Vec<String>,

    /// Unique id, falls back to hostname
    #[arg(long, global = true, env = "ELECTOR_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// CA certificate for the etcd transport
    #[arg(long, global = true)]
    pub ca_file: Option<PathBuf>,

    /// Client certificate for the etcd transport
    #[arg(long, global = true)]
    pub cert_file: Option<PathBuf>,

    /// Client key for the etcd transport
    #[arg(long, global = true)]
    pub key_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Begin monitoring the key for election
    Run {
        /// Time to wait after an error before resuming candidacy
        #[arg(
            long,
            env = "ELECTOR_ERROR_TIMEOUT",
            default_value = "30s",
            value_parser = parse_duration
        )]
        error_timeout: Duration,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Etcd,
    Console,
}

/// Parses durations of the form `500ms`, `30s`, `2m` (bare numbers are
/// seconds).
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let (digits, scale) = if let Some(digits) = input.strip_suffix("ms") {
        (digits, Duration::from_millis(1))
    } else if let Some(digits) = input.strip_suffix('s') {
        (digits, Duration::from_secs(1))
    } else if let Some(digits) = input.strip_suffix('m') {
        (digits, Duration::from_secs(60))
    } else {
        (input, Duration::from_secs(1))
    };

    digits
        .trim()
        .parse::<u32>()
        .map(|count| scale * count)
        .map_err(|err| format!("invalid duration {input:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_cli_parses_run_subcommand() {
        let cli = Cli::parse_from([
            "elector",
            "--backend",
            "console",
            "--leader-start-command",
            "echo start",
            "--leader-end-command",
            "echo stop",
            "run",
            "--error-timeout",
            "5s",
        ]);

        assert_eq!(cli.backend, Some(BackendKind::Console));
        let Commands::Run { error_timeout } = cli.command;
        assert_eq!(error_timeout, Duration::from_secs(5));
    }
}
