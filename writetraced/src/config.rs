//! Immutable runtime configuration (spec §3, §6). `Args` is the raw CLI
//! surface (`clap` derive); `Config` is the validated, immutable value every
//! other component is built from.

use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;
use writetrace_common::MAX_TARGET_FDS;

/// Default rotation cap for `<path>.N` backups (spec §6).
pub const DEFAULT_MAX_BACKUPS: usize = 1000;

#[derive(Parser, Debug)]
#[command(name = "writetraced")]
#[command(about = "Traces write(2) syscalls for a process and its descendants")]
pub struct Args {
    /// Parent pid to trace; 0 means "none, wait for the control API"
    #[arg(long, short = 'p', default_value_t = 0)]
    pub pid: u32,

    /// Comma-separated FD allowlist; empty means "all FDs"
    #[arg(long = "file-descriptors", short = 'f', default_value = "")]
    pub file_descriptors: String,

    /// Remote push endpoint (Loki-style), empty disables the remote sink
    #[arg(long = "loki-endpoint", short = 'l', default_value = "")]
    pub loki_endpoint: String,

    /// File output path, empty disables the file sink
    #[arg(long = "file-output", short = 'o', default_value = "")]
    pub file_output: String,

    /// Liveness/refresh sweep interval, seconds
    #[arg(long = "tracking-interval", short = 'i', default_value_t = 5)]
    pub tracking_interval: u64,

    /// Rotate the output file after this many records
    #[arg(long = "max-records-fileoutput", short = 'n', default_value_t = 1000)]
    pub max_records_fileoutput: u64,

    /// Prometheus scrape port; 0 disables
    #[arg(long = "metrics-port", default_value_t = 2112)]
    pub metrics_port: u16,

    /// Control API port; 0 disables
    #[arg(long = "rest-port", short = 'r', default_value_t = 9092)]
    pub rest_port: u16,

    /// Suppress stdout sink
    #[arg(long = "no-stdout", short = 'q', default_value_t = false)]
    pub no_stdout: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub target_pid: u32,
    pub target_fds: Vec<u32>,
    pub tracking_interval: Duration,
    pub file_output_path: Option<String>,
    pub remote_endpoint: Option<String>,
    pub max_records_per_file: u64,
    pub metrics_port: u16,
    pub control_port: u16,
    pub silence_stdout: bool,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.pid == 0 && args.rest_port == 0 {
            return Err(ConfigError(
                "neither --pid nor a non-zero --rest-port was given; nothing to trace".into(),
            ));
        }

        let target_fds = parse_fds(&args.file_descriptors)?;

        if args.tracking_interval == 0 {
            return Err(ConfigError("--tracking-interval must be positive".into()));
        }
        if args.max_records_fileoutput == 0 {
            return Err(ConfigError(
                "--max-records-fileoutput must be positive".into(),
            ));
        }

        Ok(Config {
            target_pid: args.pid,
            target_fds,
            tracking_interval: Duration::from_secs(args.tracking_interval),
            file_output_path: non_empty(args.file_output),
            remote_endpoint: non_empty(args.loki_endpoint),
            max_records_per_file: args.max_records_fileoutput,
            metrics_port: args.metrics_port,
            control_port: args.rest_port,
            silence_stdout: args.no_stdout,
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Parses a comma-separated FD list. Every non-empty token must be a base-10
/// integer (spec §6); an empty string yields an empty list ("all FDs").
fn parse_fds(raw: &str) -> Result<Vec<u32>, ConfigError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let mut fds = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        let fd: u32 = token
            .parse()
            .map_err(|_| ConfigError(format!("invalid FD token: {token:?}")))?;
        fds.push(fd);
    }
    if fds.len() > MAX_TARGET_FDS {
        return Err(ConfigError(format!(
            "too many FDs: {} (max {MAX_TARGET_FDS})",
            fds.len()
        )));
    }
    Ok(fds)
}

/// Diagnostic verbosity from `LOG_LEVEL` (spec §6); defaults to `INFO`.
pub fn log_level() -> &'static str {
    match std::env::var("LOG_LEVEL").as_deref() {
        Ok("DEBUG") => "debug",
        Ok("WARN") => "warn",
        Ok("ERROR") => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fd_list_means_all_fds() {
        assert_eq!(parse_fds("").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn parses_comma_separated_fds() {
        assert_eq!(parse_fds("1,2,3").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn rejects_non_integer_fd_token() {
        assert!(parse_fds("1,x,3").is_err());
    }

    #[test]
    fn rejects_pid_zero_and_rest_port_zero() {
        let args = Args {
            pid: 0,
            file_descriptors: String::new(),
            loki_endpoint: String::new(),
            file_output: String::new(),
            tracking_interval: 5,
            max_records_fileoutput: 1000,
            metrics_port: 2112,
            rest_port: 0,
            no_stdout: false,
        };
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn accepts_rest_port_only() {
        let args = Args {
            pid: 0,
            file_descriptors: String::new(),
            loki_endpoint: String::new(),
            file_output: String::new(),
            tracking_interval: 5,
            max_records_fileoutput: 1000,
            metrics_port: 2112,
            rest_port: 9092,
            no_stdout: false,
        };
        assert!(Config::from_args(args).is_ok());
    }
}
