use std::process::ExitStatus;
use thiserror::Error;

fn exit_label(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "exited".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Process is not running ({}). Command: {command}", exit_label(.status))]
    ProcessNotRunning {
        command: String,
        status: Option<ExitStatus>,
    },
    #[error("Failed to terminate tunnel process: {0}")]
    TerminationFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfiguration(String),
    #[error("No free local port left below 65536")]
    PortRangeExhausted,
    #[error("Local port {port} is not available.\nVerified with: {verified_with}")]
    LocalPortUnavailable { port: u16, verified_with: String },
    #[error("Failed to launch SSH tunnel: {0}")]
    LaunchFailed(#[source] ProcessError),
    #[error(
        "SSH tunnel is not working after {tries} attempts.\nCreated with: {created_with}\n\
         Verified with: {verified_with}"
    )]
    VerificationTimedOut {
        tries: u32,
        created_with: String,
        verified_with: String,
    },
    #[error("Failed to stop SSH tunnel: {0}")]
    TerminationFailed(#[source] ProcessError),
    #[error("Probe could not be run: {0}")]
    Probe(#[source] ProcessError),
}

impl TunnelError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        TunnelError::InvalidConfiguration(reason.into())
    }
}
