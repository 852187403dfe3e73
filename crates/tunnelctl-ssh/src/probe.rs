//! Port-availability and tunnel-liveness probes.
//!
//! Both answer with a three-valued result. `Unknown` means nothing was
//! configured to check with and is never reported as a confirmed answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;
use tunnelctl_config::{PortCheck, VerifyMethod};

use crate::command::{lsof_command, netcat_command};
use crate::error::ProcessError;
use crate::process::ProcessRunner;
use crate::spec::TunnelSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Free,
    InUse,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Up,
    Down,
    Unknown,
}

#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn check(&self, port: u16) -> Result<Availability, ProcessError>;
    /// How the check is performed, for error messages.
    fn describe(&self, port: u16) -> String;
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn check(&self, address: &str, port: u16) -> Result<Liveness, ProcessError>;
    fn describe(&self, address: &str, port: u16) -> String;
}

/// `lsof -P -n -i :<port>` exits 0 when it lists a listener and 1 when it lists nothing.
pub struct LsofPortProbe {
    lsof_path: String,
    runner: Arc<dyn ProcessRunner>,
}

impl LsofPortProbe {
    pub fn new(lsof_path: impl Into<String>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            lsof_path: lsof_path.into(),
            runner,
        }
    }
}

#[async_trait]
impl PortProbe for LsofPortProbe {
    async fn check(&self, port: u16) -> Result<Availability, ProcessError> {
        let code = self.runner.run_to_completion(&lsof_command(&self.lsof_path, port)).await?;
        let availability = match code {
            Some(0) => Availability::InUse,
            Some(1) => Availability::Free,
            _ => Availability::Unknown,
        };
        debug!("lsof on port {} exited with {:?}: {:?}", port, code, availability);
        Ok(availability)
    }

    fn describe(&self, port: u16) -> String {
        lsof_command(&self.lsof_path, port).to_string()
    }
}

/// Tries to bind the port ourselves and releases it straight away.
pub struct BindPortProbe {
    address: String,
}

impl BindPortProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl PortProbe for BindPortProbe {
    async fn check(&self, port: u16) -> Result<Availability, ProcessError> {
        match TcpListener::bind((self.address.as_str(), port)).await {
            Ok(_listener) => Ok(Availability::Free),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Ok(Availability::InUse),
            Err(e) => {
                debug!("bind test on {}:{} inconclusive: {}", self.address, port, e);
                Ok(Availability::Unknown)
            }
        }
    }

    fn describe(&self, port: u16) -> String {
        format!("bind test on {}:{}", self.address, port)
    }
}

/// `nc -vz <address> <port>`; exit status 0 means something accepted the connection.
pub struct NetcatLivenessProbe {
    nc_path: String,
    runner: Arc<dyn ProcessRunner>,
}

impl NetcatLivenessProbe {
    pub fn new(nc_path: impl Into<String>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            nc_path: nc_path.into(),
            runner,
        }
    }
}

#[async_trait]
impl LivenessProbe for NetcatLivenessProbe {
    async fn check(&self, address: &str, port: u16) -> Result<Liveness, ProcessError> {
        let code = self
            .runner
            .run_to_completion(&netcat_command(&self.nc_path, address, port))
            .await?;
        Ok(if code == Some(0) { Liveness::Up } else { Liveness::Down })
    }

    fn describe(&self, address: &str, port: u16) -> String {
        netcat_command(&self.nc_path, address, port).to_string()
    }
}

pub struct TcpLivenessProbe {
    timeout: Duration,
}

impl TcpLivenessProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpLivenessProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl LivenessProbe for TcpLivenessProbe {
    async fn check(&self, address: &str, port: u16) -> Result<Liveness, ProcessError> {
        match tokio::time::timeout(self.timeout, TcpStream::connect((address, port))).await {
            Ok(Ok(_stream)) => Ok(Liveness::Up),
            Ok(Err(e)) => {
                debug!("tcp connect to {}:{} failed: {}", address, port, e);
                Ok(Liveness::Down)
            }
            Err(_) => Ok(Liveness::Down),
        }
    }

    fn describe(&self, address: &str, port: u16) -> String {
        format!("tcp connect to {}:{}", address, port)
    }
}

pub fn port_probe_for(
    spec: &TunnelSpec,
    runner: Arc<dyn ProcessRunner>,
) -> Option<Arc<dyn PortProbe>> {
    match (spec.port_check, &spec.lsof_path) {
        (PortCheck::Lsof, Some(path)) => Some(Arc::new(LsofPortProbe::new(path.clone(), runner))),
        (PortCheck::Bind, _) => Some(Arc::new(BindPortProbe::new(spec.local_address.clone()))),
        _ => None,
    }
}

pub fn liveness_probe_for(
    spec: &TunnelSpec,
    runner: Arc<dyn ProcessRunner>,
) -> Option<Arc<dyn LivenessProbe>> {
    match (spec.verify_method, &spec.nc_path) {
        (VerifyMethod::Netcat, Some(path)) => {
            Some(Arc::new(NetcatLivenessProbe::new(path.clone(), runner)))
        }
        (VerifyMethod::Tcp, _) => Some(Arc::new(TcpLivenessProbe::default())),
        _ => None,
    }
}
