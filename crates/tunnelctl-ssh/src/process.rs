use std::fs::OpenOptions;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::CommandLine;
use crate::error::ProcessError;
use crate::spec::{LogDestination, TunnelSpec};

/// Runs short-lived commands such as probes.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Exit code of the finished command, `None` if a signal ended it.
    async fn run_to_completion(&self, command: &CommandLine) -> Result<Option<i32>, ProcessError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRunner;

#[async_trait]
impl ProcessRunner for CommandRunner {
    async fn run_to_completion(&self, command: &CommandLine) -> Result<Option<i32>, ProcessError> {
        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let status = cmd.status().await.map_err(|source| ProcessError::SpawnFailed {
            command: command.to_string(),
            source,
        })?;
        Ok(status.code())
    }
}

/// A tunnel process spawned and held by the supervisor.
pub struct ChildProcess {
    child: Child,
    command: CommandLine,
    process_group: bool,
    log_tasks: Vec<JoinHandle<()>>,
}

/// The live tunnel, or the command that can destroy it when we hold no process.
pub enum TunnelHandle {
    Child(ChildProcess),
    Pattern(CommandLine),
}

impl TunnelHandle {
    pub fn pid(&self) -> Option<u32> {
        match self {
            TunnelHandle::Child(process) => process.child.id(),
            TunnelHandle::Pattern(_) => None,
        }
    }

    /// Lets go of the child without killing it and keeps only `destroy`.
    pub fn release(self, destroy: CommandLine) -> TunnelHandle {
        if let TunnelHandle::Child(process) = self {
            debug!(
                "Releasing tunnel process {:?}, it will be stopped with: {}",
                process.child.id(),
                destroy
            );
        }
        TunnelHandle::Pattern(destroy)
    }

    /// Synchronous kill for paths that cannot await, such as `Drop`.
    ///
    /// A held child only gets a signal. A pattern handle blocks the calling
    /// thread until its destroy command exits, so that command should be
    /// something quick like `pkill`.
    pub fn kill_now(&mut self) -> Result<(), ProcessError> {
        match self {
            TunnelHandle::Child(process) => {
                for task in process.log_tasks.drain(..) {
                    task.abort();
                }
                #[cfg(unix)]
                if process.process_group {
                    if let Some(pid) = process.child.id() {
                        signal_tunnel(pid, true, nix::sys::signal::Signal::SIGKILL)?;
                        return Ok(());
                    }
                }
                process.child.start_kill()?;
                Ok(())
            }
            TunnelHandle::Pattern(destroy) => {
                let status = destroy
                    .to_std_command()
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()?;
                if status.success() {
                    Ok(())
                } else {
                    Err(ProcessError::TerminationFailed(format!(
                        "`{}` exited with {}",
                        destroy, status
                    )))
                }
            }
        }
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelHandle::Child(process) => f
                .debug_struct("Child")
                .field("pid", &process.child.id())
                .field("command", &process.command.to_string())
                .field("process_group", &process.process_group)
                .finish(),
            TunnelHandle::Pattern(destroy) => {
                f.debug_tuple("Pattern").field(&destroy.to_string()).finish()
            }
        }
    }
}

#[async_trait]
pub trait ProcessSupervisor: ProcessRunner {
    /// Spawns the tunnel. Fails if the process could not be created or has
    /// already exited by the time we look at it.
    async fn start(&self, command: &CommandLine) -> Result<TunnelHandle, ProcessError>;
    async fn is_running(&self, handle: &mut TunnelHandle) -> bool;
    /// SIGTERM, a grace period, then SIGKILL if `forceful`. A pattern handle
    /// runs its destroy command instead. The handle stays with the caller so a
    /// failed stop can be retried.
    async fn stop(&self, handle: &mut TunnelHandle, forceful: bool) -> Result<(), ProcessError>;
}

pub struct ProcessSupervisorImpl {
    log_destination: LogDestination,
    detach: bool,
    stop_grace: Duration,
    runner: CommandRunner,
}

impl ProcessSupervisorImpl {
    pub fn new(spec: &TunnelSpec) -> Self {
        Self {
            log_destination: spec.log_destination.clone(),
            detach: spec.detach,
            stop_grace: spec.stop_grace,
            runner: CommandRunner,
        }
    }

    fn wire_output(&self, cmd: &mut tokio::process::Command) -> Result<bool, ProcessError> {
        cmd.stdin(Stdio::null());
        match &self.log_destination {
            LogDestination::Discard => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
            LogDestination::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            LogDestination::Tracing => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
                return Ok(true);
            }
            LogDestination::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                cmd.stdout(file.try_clone()?).stderr(file);
            }
        }
        Ok(false)
    }
}

/// Re-emits the child's output line by line through `tracing`.
fn forward_output(child: &mut Child) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        tasks.push(tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                info!("[ssh] {}", line);
            }
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let mut lines = BufReader::new(stderr).lines();
        tasks.push(tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("[ssh] {}", line);
            }
        }));
    }
    tasks
}

#[cfg(unix)]
fn signal_tunnel(
    pid: u32,
    process_group: bool,
    signal: nix::sys::signal::Signal,
) -> Result<(), ProcessError> {
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid as i32);
    let result = if process_group { killpg(pid, signal) } else { kill(pid, signal) };
    result.map_err(|errno| ProcessError::Io(std::io::Error::from(errno)))
}

#[async_trait]
impl ProcessRunner for ProcessSupervisorImpl {
    async fn run_to_completion(&self, command: &CommandLine) -> Result<Option<i32>, ProcessError> {
        self.runner.run_to_completion(command).await
    }
}

#[async_trait]
impl ProcessSupervisor for ProcessSupervisorImpl {
    async fn start(&self, command: &CommandLine) -> Result<TunnelHandle, ProcessError> {
        let mut cmd = command.to_command();
        let forward = self.wire_output(&mut cmd)?;

        #[cfg(unix)]
        if self.detach {
            cmd.process_group(0);
        }

        info!("Spawning SSH tunnel: {}", command);

        let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            command: command.to_string(),
            source,
        })?;

        if let Some(status) = child.try_wait()? {
            error!("SSH tunnel exited immediately with {}", status);
            return Err(ProcessError::ProcessNotRunning {
                command: command.to_string(),
                status: Some(status),
            });
        }

        let log_tasks = if forward { forward_output(&mut child) } else { Vec::new() };

        Ok(TunnelHandle::Child(ChildProcess {
            child,
            command: command.clone(),
            process_group: self.detach,
            log_tasks,
        }))
    }

    async fn is_running(&self, handle: &mut TunnelHandle) -> bool {
        match handle {
            TunnelHandle::Child(process) => matches!(process.child.try_wait(), Ok(None)),
            // Nothing to ask; liveness is left to the verify probe.
            TunnelHandle::Pattern(_) => true,
        }
    }

    async fn stop(&self, handle: &mut TunnelHandle, forceful: bool) -> Result<(), ProcessError> {
        let process = match handle {
            TunnelHandle::Child(process) => process,
            TunnelHandle::Pattern(destroy) => {
                info!("Stopping SSH tunnel with: {}", destroy);
                return match self.runner.run_to_completion(destroy).await? {
                    Some(0) => Ok(()),
                    code => Err(ProcessError::TerminationFailed(format!(
                        "`{}` exited with {:?}",
                        destroy, code
                    ))),
                };
            }
        };

        for task in process.log_tasks.drain(..) {
            task.abort();
        }

        if let Some(status) = process.child.try_wait()? {
            debug!("SSH tunnel had already exited with {}", status);
            return Ok(());
        }

        let Some(pid) = process.child.id() else {
            return Ok(());
        };

        #[cfg(unix)]
        signal_tunnel(pid, process.process_group, nix::sys::signal::Signal::SIGTERM)?;
        #[cfg(not(unix))]
        process.child.start_kill()?;

        match tokio::time::timeout(self.stop_grace, process.child.wait()).await {
            Ok(status) => {
                info!("SSH tunnel {} stopped ({})", pid, status?);
                Ok(())
            }
            Err(_) if forceful => {
                warn!("SSH tunnel {} ignored SIGTERM, killing it", pid);
                #[cfg(unix)]
                if process.process_group {
                    signal_tunnel(pid, true, nix::sys::signal::Signal::SIGKILL)?;
                    process.child.wait().await?;
                    return Ok(());
                }
                process.child.kill().await?;
                Ok(())
            }
            Err(_) => Err(ProcessError::TerminationFailed(format!(
                "process {} still running {:?} after SIGTERM",
                pid, self.stop_grace
            ))),
        }
    }
}
