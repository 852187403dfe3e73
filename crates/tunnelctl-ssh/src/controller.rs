use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tunnelctl_config::Termination;

use crate::command::{CommandBuilder, RenderedCommands};
use crate::error::{ProcessError, TunnelError};
use crate::ports::PortAllocator;
use crate::probe::{
    liveness_probe_for, port_probe_for, Availability, Liveness, LivenessProbe, PortProbe,
};
use crate::process::{
    CommandRunner, ProcessRunner, ProcessSupervisor, ProcessSupervisorImpl, TunnelHandle,
};
use crate::spec::TunnelSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    /// The last `connect` failed. Another attempt is allowed.
    Failed,
}

/// Where callers reach the forwarded service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

pub struct TunnelControllerBuilder {
    spec: TunnelSpec,
    allocator: Option<PortAllocator>,
    supervisor: Option<Arc<dyn ProcessSupervisor>>,
    port_probe: Option<Option<Arc<dyn PortProbe>>>,
    liveness_probe: Option<Option<Arc<dyn LivenessProbe>>>,
}

impl TunnelControllerBuilder {
    pub fn port_allocator(mut self, allocator: PortAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Replaces the probe chosen by `port_check`; `None` disables the check.
    pub fn port_probe(mut self, probe: Option<Arc<dyn PortProbe>>) -> Self {
        self.port_probe = Some(probe);
        self
    }

    /// Replaces the probe chosen by `verify_method`; `None` disables verification.
    pub fn liveness_probe(mut self, probe: Option<Arc<dyn LivenessProbe>>) -> Self {
        self.liveness_probe = Some(probe);
        self
    }

    /// Validates the spec, fixes the local port, renders the commands and,
    /// when `auto_connect` is set, connects.
    pub async fn build(self) -> Result<TunnelController, TunnelError> {
        let spec = self.spec;
        spec.validate()?;

        let runner: Arc<dyn ProcessRunner> = Arc::new(CommandRunner);
        let supervisor = self.supervisor.unwrap_or_else(|| {
            Arc::new(ProcessSupervisorImpl::new(&spec)) as Arc<dyn ProcessSupervisor>
        });
        let port_probe = self
            .port_probe
            .unwrap_or_else(|| port_probe_for(&spec, runner.clone()));
        let liveness_probe = self
            .liveness_probe
            .unwrap_or_else(|| liveness_probe_for(&spec, runner));
        let allocator = self.allocator.unwrap_or_else(PortAllocator::shared);

        let local_port = allocator.resolve(spec.local_port, port_probe.as_deref()).await?;
        let commands = CommandBuilder::new(&spec).render(local_port);
        debug!(
            "Tunnel on {}:{} will be created with: {}",
            spec.local_address, local_port, commands.launch
        );

        let auto_connect = spec.auto_connect;
        let mut controller = TunnelController {
            spec,
            local_port,
            commands,
            supervisor,
            port_probe,
            liveness_probe,
            handle: None,
            state: ConnectionState::Unconnected,
            scoped: false,
        };

        if auto_connect {
            controller.connect().await?;
        }
        Ok(controller)
    }
}

/// Owns one SSH local port forward from launch to teardown.
pub struct TunnelController {
    spec: TunnelSpec,
    local_port: u16,
    commands: RenderedCommands,
    supervisor: Arc<dyn ProcessSupervisor>,
    port_probe: Option<Arc<dyn PortProbe>>,
    liveness_probe: Option<Arc<dyn LivenessProbe>>,
    handle: Option<TunnelHandle>,
    state: ConnectionState,
    scoped: bool,
}

impl TunnelController {
    pub fn builder(spec: TunnelSpec) -> TunnelControllerBuilder {
        TunnelControllerBuilder {
            spec,
            allocator: None,
            supervisor: None,
            port_probe: None,
            liveness_probe: None,
        }
    }

    pub async fn new(spec: TunnelSpec) -> Result<Self, TunnelError> {
        Self::builder(spec).build().await
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            address: self.spec.local_address.clone(),
            port: self.local_port,
        }
    }

    pub fn commands(&self) -> &RenderedCommands {
        &self.commands
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    fn verified_with(&self) -> String {
        match &self.liveness_probe {
            Some(probe) => probe.describe(&self.spec.local_address, self.local_port),
            None => "(no verification configured)".to_string(),
        }
    }

    /// Asks the liveness probe about the local end. `Unknown` when there is no probe.
    pub async fn is_connected(&self) -> Result<Liveness, TunnelError> {
        let Some(probe) = &self.liveness_probe else {
            return Ok(Liveness::Unknown);
        };
        let liveness = probe
            .check(&self.spec.local_address, self.local_port)
            .await
            .map_err(TunnelError::Probe)?;
        debug!("Tunnel {} liveness: {:?}", self.endpoint(), liveness);
        Ok(liveness)
    }

    pub async fn connect(&mut self) -> Result<(), TunnelError> {
        // A tunnel that already answers is fine, whoever started it.
        let liveness = self.is_connected().await?;
        if liveness == Liveness::Up {
            info!("SSH tunnel on {} is already up", self.endpoint());
            self.state = ConnectionState::Connected;
            return Ok(());
        }

        if let Some(handle) = self.handle.as_mut() {
            if liveness == Liveness::Unknown && self.supervisor.is_running(handle).await {
                debug!("SSH tunnel on {} is still running", self.endpoint());
                self.state = ConnectionState::Connected;
                return Ok(());
            }
            warn!("SSH tunnel on {} stopped answering, replacing it", self.endpoint());
            // The old process stays with us until it is gone; never spawn a second one over it.
            if let Err(e) = self.abandon_launch().await {
                self.state = ConnectionState::Failed;
                return Err(TunnelError::TerminationFailed(e));
            }
        }

        if let Some(probe) = &self.port_probe {
            let availability = probe.check(self.local_port).await.map_err(TunnelError::Probe)?;
            if availability == Availability::InUse {
                self.state = ConnectionState::Failed;
                return Err(TunnelError::LocalPortUnavailable {
                    port: self.local_port,
                    verified_with: probe.describe(self.local_port),
                });
            }
        }

        self.state = ConnectionState::Connecting;
        let handle = match self.supervisor.start(&self.commands.launch).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to launch SSH tunnel: {}", e);
                self.state = ConnectionState::Failed;
                return Err(TunnelError::LaunchFailed(e));
            }
        };
        self.handle = Some(match (self.spec.termination, &self.commands.destroy) {
            (Termination::Pattern, Some(destroy)) => handle.release(destroy.clone()),
            _ => handle,
        });

        match self.verify().await {
            Ok(()) => {
                info!(
                    "SSH tunnel established: {} -> {}:{}",
                    self.endpoint(),
                    self.spec.bind_host,
                    self.spec.bind_port
                );
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                error!("{}", e);
                if let Err(stop_err) = self.abandon_launch().await {
                    warn!("Failed to stop unusable SSH tunnel: {}", stop_err);
                }
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    /// Waits the settle interval, then polls up to `tries` times, `wait` apart.
    async fn verify(&mut self) -> Result<(), TunnelError> {
        let tries = self.spec.tries;
        sleep(self.spec.wait).await;

        for attempt in 1..=tries {
            if attempt > 1 {
                sleep(self.spec.wait).await;
            }

            let liveness = self.is_connected().await?;
            let running = match self.handle.as_mut() {
                Some(handle) => self.supervisor.is_running(handle).await,
                None => false,
            };
            debug!(
                "Verification attempt {}/{}: {:?}, process running: {}",
                attempt, tries, liveness, running
            );

            match liveness {
                Liveness::Up => return Ok(()),
                // Without a probe a live process is the best evidence we get.
                Liveness::Unknown if running => return Ok(()),
                _ => {}
            }

            if !running {
                return Err(TunnelError::LaunchFailed(ProcessError::ProcessNotRunning {
                    command: self.commands.launch.to_string(),
                    status: None,
                }));
            }
        }

        Err(TunnelError::VerificationTimedOut {
            tries,
            created_with: self.commands.launch.to_string(),
            verified_with: self.verified_with(),
        })
    }

    /// Stops a process we started but cannot use. On failure the handle is
    /// kept so `disconnect` or `Drop` can still reach it.
    async fn abandon_launch(&mut self) -> Result<(), ProcessError> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        if let Err(e) = self.supervisor.stop(&mut handle, true).await {
            self.handle = Some(handle);
            return Err(e);
        }
        Ok(())
    }

    /// Stops the tunnel. `Ok(false)` when there was nothing to stop.
    pub async fn disconnect(&mut self) -> Result<bool, TunnelError> {
        let Some(mut handle) = self.handle.take() else {
            debug!("No SSH tunnel to disconnect on {}", self.endpoint());
            return Ok(false);
        };

        match self.supervisor.stop(&mut handle, true).await {
            Ok(()) => {
                info!("SSH tunnel on {} disconnected", self.endpoint());
                self.state = ConnectionState::Unconnected;
                Ok(true)
            }
            Err(e) => {
                self.handle = Some(handle);
                Err(TunnelError::TerminationFailed(e))
            }
        }
    }

    /// Takes charge of a tunnel launched elsewhere with the same command line,
    /// so that `disconnect` can kill it by pattern.
    pub fn adopt(&mut self) -> Result<(), TunnelError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let destroy = self.commands.destroy.clone().ok_or_else(|| {
            TunnelError::invalid("adopting a tunnel requires pkill_path for pattern termination")
        })?;
        debug!("Adopting SSH tunnel on {}, destroy command: {}", self.endpoint(), destroy);
        self.handle = Some(TunnelHandle::Pattern(destroy));
        Ok(())
    }

    /// Connects if needed, runs `f` with the endpoint and disconnects on the
    /// way out. A disconnect failure is logged and does not replace `f`'s
    /// output. If the returned future is dropped early, `Drop` kills the tunnel.
    pub async fn scoped<F, Fut, T>(mut self, f: F) -> Result<T, TunnelError>
    where
        F: FnOnce(Endpoint) -> Fut,
        Fut: Future<Output = T>,
    {
        self.scoped = true;
        if self.state != ConnectionState::Connected {
            self.connect().await?;
        }

        let output = f(self.endpoint()).await;

        if let Err(e) = self.disconnect().await {
            warn!("Failed to disconnect SSH tunnel on {}: {}", self.endpoint(), e);
        }
        Ok(output)
    }
}

impl Drop for TunnelController {
    fn drop(&mut self) {
        if !(self.spec.auto_disconnect || self.scoped) {
            return;
        }
        if let Some(mut handle) = self.handle.take() {
            info!("Terminating SSH tunnel on {}...", self.endpoint());
            if let Err(e) = handle.kill_now() {
                error!("Failed to kill SSH tunnel: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandLine;
    use crate::ports::FIRST_AUTO_PORT;
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tunnelctl_config::VerifyMethod;

    struct FakeSupervisor {
        starts: AtomicUsize,
        stops: AtomicUsize,
        running: AtomicBool,
        stop_fails: AtomicBool,
        spawnable: bool,
        /// What `kill_now` runs for the handles this supervisor hands out.
        destroy: CommandLine,
    }

    impl FakeSupervisor {
        fn build(spawnable: bool, destroy: CommandLine) -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                running: AtomicBool::new(true),
                stop_fails: AtomicBool::new(false),
                spawnable,
                destroy,
            })
        }

        fn new() -> Arc<Self> {
            Self::build(true, CommandLine::new("true"))
        }

        fn broken() -> Arc<Self> {
            Self::build(false, CommandLine::new("true"))
        }

        fn destroying_with(destroy: CommandLine) -> Arc<Self> {
            Self::build(true, destroy)
        }

        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProcessRunner for FakeSupervisor {
        async fn run_to_completion(
            &self,
            _command: &CommandLine,
        ) -> Result<Option<i32>, ProcessError> {
            Ok(Some(0))
        }
    }

    #[async_trait]
    impl ProcessSupervisor for FakeSupervisor {
        async fn start(&self, command: &CommandLine) -> Result<TunnelHandle, ProcessError> {
            if !self.spawnable {
                return Err(ProcessError::SpawnFailed {
                    command: command.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                });
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(TunnelHandle::Pattern(self.destroy.clone()))
        }

        async fn is_running(&self, _handle: &mut TunnelHandle) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn stop(
            &self,
            _handle: &mut TunnelHandle,
            _forceful: bool,
        ) -> Result<(), ProcessError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.stop_fails.load(Ordering::SeqCst) {
                return Err(ProcessError::TerminationFailed("process ignored SIGKILL".to_string()));
            }
            Ok(())
        }
    }

    /// Replays scripted answers, then repeats `rest`.
    struct ScriptedLiveness {
        answers: Mutex<VecDeque<Liveness>>,
        rest: Liveness,
        checks: AtomicUsize,
    }

    impl ScriptedLiveness {
        fn new(answers: &[Liveness], rest: Liveness) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                rest,
                checks: AtomicUsize::new(0),
            })
        }

        fn checks(&self) -> usize {
            self.checks.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LivenessProbe for ScriptedLiveness {
        async fn check(&self, _address: &str, _port: u16) -> Result<Liveness, ProcessError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(self.answers.lock().unwrap().pop_front().unwrap_or(self.rest))
        }

        fn describe(&self, address: &str, port: u16) -> String {
            format!("nc -vz {address} {port}")
        }
    }

    struct FixedPort(Availability);

    #[async_trait]
    impl PortProbe for FixedPort {
        async fn check(&self, _port: u16) -> Result<Availability, ProcessError> {
            Ok(self.0)
        }

        fn describe(&self, port: u16) -> String {
            format!("lsof -P -n -i :{port}")
        }
    }

    fn spec() -> TunnelSpec {
        let mut spec = TunnelSpec::new("u", "h").unwrap();
        spec.auto_connect = false;
        spec.wait = Duration::from_millis(10);
        spec
    }

    fn builder(
        spec: TunnelSpec,
        supervisor: &Arc<FakeSupervisor>,
        liveness: &Arc<ScriptedLiveness>,
        port: Availability,
    ) -> TunnelControllerBuilder {
        TunnelController::builder(spec)
            .port_allocator(PortAllocator::new(FIRST_AUTO_PORT))
            .supervisor(supervisor.clone())
            .liveness_probe(Some(liveness.clone()))
            .port_probe(Some(Arc::new(FixedPort(port))))
    }

    #[tokio::test]
    async fn test_connect_first_auto_port() {
        let supervisor = FakeSupervisor::new();
        let liveness = ScriptedLiveness::new(&[Liveness::Down], Liveness::Up);
        let mut tunnel = builder(spec(), &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        assert_eq!(tunnel.local_port(), 2049);
        assert_eq!(tunnel.state(), ConnectionState::Unconnected);
        assert!(tunnel.commands().launch.arguments().iter().any(|a| a == "2049:127.0.0.1:3306"));

        tunnel.connect().await.unwrap();
        assert_eq!(tunnel.state(), ConnectionState::Connected);
        assert_eq!(supervisor.starts(), 1);
        // One check before launching, one successful attempt.
        assert_eq!(liveness.checks(), 2);
        assert_eq!(tunnel.is_connected().await.unwrap(), Liveness::Up);
        assert_eq!(tunnel.endpoint().to_string(), "127.0.0.1:2049");
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let supervisor = FakeSupervisor::new();
        let liveness = ScriptedLiveness::new(&[Liveness::Down], Liveness::Up);
        let mut tunnel = builder(spec(), &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        tunnel.connect().await.unwrap();
        tunnel.connect().await.unwrap();
        assert_eq!(supervisor.starts(), 1);
        assert_eq!(tunnel.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_occupied_port_never_spawns() {
        let supervisor = FakeSupervisor::new();
        let liveness = ScriptedLiveness::new(&[], Liveness::Down);
        let mut spec = spec();
        spec.local_port = 5432;
        let mut tunnel = builder(spec, &supervisor, &liveness, Availability::InUse)
            .build()
            .await
            .unwrap();
        assert_eq!(tunnel.local_port(), 5432);

        match tunnel.connect().await {
            Err(TunnelError::LocalPortUnavailable { port, verified_with }) => {
                assert_eq!(port, 5432);
                assert_eq!(verified_with, "lsof -P -n -i :5432");
            }
            other => panic!("expected LocalPortUnavailable, got {other:?}"),
        }
        assert_eq!(supervisor.starts(), 0);
        assert_eq!(tunnel.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_timeout_is_bounded() {
        let supervisor = FakeSupervisor::new();
        let liveness = ScriptedLiveness::new(&[], Liveness::Down);
        let mut spec = spec();
        spec.tries = 3;
        spec.wait = Duration::from_millis(1000);
        let mut tunnel = builder(spec, &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = tunnel.connect().await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(3000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3100), "{elapsed:?}");
        assert!(matches!(err, TunnelError::VerificationTimedOut { tries: 3, .. }));

        let message = err.to_string();
        assert!(message.contains("ssh -q -N -L 2049:127.0.0.1:3306 -p 22 u@h"));
        assert!(message.contains("nc -vz 127.0.0.1 2049"));

        // The pre-check plus exactly three attempts.
        assert_eq!(liveness.checks(), 4);
        assert_eq!(supervisor.stops(), 1);
        assert_eq!(tunnel.state(), ConnectionState::Failed);
        assert!(!tunnel.disconnect().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_controller_can_retry() {
        let supervisor = FakeSupervisor::new();
        // Pre-check and two failed attempts, then the second pre-check.
        let liveness = ScriptedLiveness::new(&[Liveness::Down; 4], Liveness::Up);
        let mut spec = spec();
        spec.tries = 2;
        let mut tunnel = builder(spec, &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        assert!(tunnel.connect().await.is_err());
        tunnel.connect().await.unwrap();
        assert_eq!(supervisor.starts(), 2);
        assert_eq!(tunnel.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let supervisor = FakeSupervisor::new();
        let liveness = ScriptedLiveness::new(&[], Liveness::Down);
        let mut tunnel = builder(spec(), &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        assert!(!tunnel.disconnect().await.unwrap());
        assert_eq!(supervisor.stops(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_after_connect() {
        let supervisor = FakeSupervisor::new();
        let liveness = ScriptedLiveness::new(&[Liveness::Down], Liveness::Up);
        let mut tunnel = builder(spec(), &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        tunnel.connect().await.unwrap();
        assert!(tunnel.disconnect().await.unwrap());
        assert_eq!(tunnel.state(), ConnectionState::Unconnected);
        assert!(!tunnel.disconnect().await.unwrap());
        assert_eq!(supervisor.stops(), 1);
    }

    #[tokio::test]
    async fn test_auto_disconnect_without_termination_fails_construction() {
        let supervisor = FakeSupervisor::new();
        let liveness = ScriptedLiveness::new(&[], Liveness::Up);
        let mut spec = spec();
        spec.auto_connect = true;
        spec.termination = Termination::None;

        let result = builder(spec, &supervisor, &liveness, Availability::Free).build().await;
        assert!(matches!(result, Err(TunnelError::InvalidConfiguration(_))));
        assert_eq!(supervisor.starts(), 0);
        assert_eq!(liveness.checks(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_failure() {
        let supervisor = FakeSupervisor::broken();
        let liveness = ScriptedLiveness::new(&[], Liveness::Down);
        let mut tunnel = builder(spec(), &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        let err = tunnel.connect().await.unwrap_err();
        assert!(matches!(err, TunnelError::LaunchFailed(ProcessError::SpawnFailed { .. })));
        assert_eq!(tunnel.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_without_probe_a_running_process_counts() {
        let supervisor = FakeSupervisor::new();
        let mut spec = spec();
        spec.verify_method = VerifyMethod::None;
        let mut tunnel = TunnelController::builder(spec)
            .port_allocator(PortAllocator::new(FIRST_AUTO_PORT))
            .supervisor(supervisor.clone())
            .port_probe(None)
            .build()
            .await
            .unwrap();

        assert_eq!(tunnel.is_connected().await.unwrap(), Liveness::Unknown);
        tunnel.connect().await.unwrap();
        assert_eq!(tunnel.state(), ConnectionState::Connected);
        assert_eq!(tunnel.is_connected().await.unwrap(), Liveness::Unknown);

        // Still running, so a second connect keeps the same process.
        tunnel.connect().await.unwrap();
        assert_eq!(supervisor.starts(), 1);
    }

    #[tokio::test]
    async fn test_process_exit_stops_verification_early() {
        let supervisor = FakeSupervisor::new();
        supervisor.running.store(false, Ordering::SeqCst);
        let liveness = ScriptedLiveness::new(&[], Liveness::Down);
        let mut tunnel = builder(spec(), &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        let err = tunnel.connect().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::LaunchFailed(ProcessError::ProcessNotRunning { .. })
        ));
        assert_eq!(liveness.checks(), 2);
    }

    #[tokio::test]
    async fn test_auto_connect_on_build() {
        let supervisor = FakeSupervisor::new();
        let liveness = ScriptedLiveness::new(&[Liveness::Down], Liveness::Up);
        let mut spec = spec();
        spec.auto_connect = true;
        let tunnel = builder(spec, &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        assert_eq!(tunnel.state(), ConnectionState::Connected);
        assert_eq!(supervisor.starts(), 1);
    }

    #[tokio::test]
    async fn test_adopt_then_disconnect() {
        let supervisor = FakeSupervisor::new();
        let liveness = ScriptedLiveness::new(&[], Liveness::Up);
        let mut spec = spec();
        spec.local_port = 2200;
        let mut tunnel = builder(spec, &supervisor, &liveness, Availability::InUse)
            .build()
            .await
            .unwrap();

        tunnel.adopt().unwrap();
        assert!(tunnel.disconnect().await.unwrap());
        assert_eq!(supervisor.stops(), 1);
        assert_eq!(supervisor.starts(), 0);
    }

    #[tokio::test]
    async fn test_adopt_requires_pkill() {
        let supervisor = FakeSupervisor::new();
        let liveness = ScriptedLiveness::new(&[], Liveness::Up);
        let mut spec = spec();
        spec.pkill_path = None;
        let mut tunnel = builder(spec, &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        assert!(matches!(tunnel.adopt(), Err(TunnelError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_scoped_always_disconnects() {
        let supervisor = FakeSupervisor::new();
        let liveness = ScriptedLiveness::new(&[Liveness::Down], Liveness::Up);
        let tunnel = builder(spec(), &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        let port = tunnel
            .scoped(|endpoint| async move {
                assert_eq!(endpoint.address, "127.0.0.1");
                endpoint.port
            })
            .await
            .unwrap();

        assert_eq!(port, 2049);
        assert_eq!(supervisor.starts(), 1);
        assert_eq!(supervisor.stops(), 1);
    }


    #[tokio::test]
    async fn test_replacement_waits_for_old_process_to_stop() {
        let supervisor = FakeSupervisor::new();
        // Launch verified, then the tunnel stops answering.
        let liveness = ScriptedLiveness::new(&[Liveness::Down, Liveness::Up], Liveness::Down);
        let mut tunnel = builder(spec(), &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();
        tunnel.connect().await.unwrap();

        supervisor.stop_fails.store(true, Ordering::SeqCst);
        let err = tunnel.connect().await.unwrap_err();
        assert!(matches!(err, TunnelError::TerminationFailed(_)));
        assert_eq!(supervisor.starts(), 1);
        assert_eq!(supervisor.stops(), 1);
        assert_eq!(tunnel.state(), ConnectionState::Failed);

        // The first process is still ours to stop.
        supervisor.stop_fails.store(false, Ordering::SeqCst);
        assert!(tunnel.disconnect().await.unwrap());
        assert_eq!(supervisor.stops(), 2);
    }

    #[cfg(unix)]
    fn marker(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("tunnelctl-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[cfg(unix)]
    fn touch(path: &std::path::Path) -> CommandLine {
        CommandLine::new("sh").arg("-c").arg(format!("touch '{}'", path.display()))
    }

    #[cfg(unix)]
    async fn connected(spec: TunnelSpec, supervisor: &Arc<FakeSupervisor>) -> TunnelController {
        let liveness = ScriptedLiveness::new(&[Liveness::Down], Liveness::Up);
        let mut tunnel = builder(spec, supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();
        tunnel.connect().await.unwrap();
        tunnel
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drop_kills_tunnel_with_auto_disconnect() {
        let path = marker("drop-kills");
        let supervisor = FakeSupervisor::destroying_with(touch(&path));
        let tunnel = connected(spec(), &supervisor).await;

        assert!(!path.exists());
        drop(tunnel);
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drop_leaves_tunnel_without_auto_disconnect() {
        let path = marker("drop-leaves");
        let supervisor = FakeSupervisor::destroying_with(touch(&path));
        let mut spec = spec();
        spec.auto_disconnect = false;
        let tunnel = connected(spec, &supervisor).await;

        drop(tunnel);
        assert!(!path.exists());
        assert_eq!(supervisor.stops(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drop_swallows_kill_failure() {
        let supervisor = FakeSupervisor::destroying_with(CommandLine::new("false"));
        let tunnel = connected(spec(), &supervisor).await;
        drop(tunnel);

        let supervisor = FakeSupervisor::destroying_with(CommandLine::new("/nonexistent/pkill"));
        let tunnel = connected(spec(), &supervisor).await;
        drop(tunnel);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_scope_kills_tunnel() {
        let path = marker("scope-cancelled");
        let supervisor = FakeSupervisor::destroying_with(touch(&path));
        let liveness = ScriptedLiveness::new(&[Liveness::Down], Liveness::Up);
        let mut spec = spec();
        spec.auto_disconnect = false;
        let tunnel = builder(spec, &supervisor, &liveness, Availability::Free)
            .build()
            .await
            .unwrap();

        let scope = tunnel.scoped(|_endpoint| std::future::pending::<()>());
        assert!(tokio::time::timeout(Duration::from_millis(200), scope).await.is_err());

        assert_eq!(supervisor.starts(), 1);
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_controllers_get_distinct_ports() {
        let allocator = PortAllocator::new(20_000);
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let allocator = allocator.clone();
                tokio::spawn(async move {
                    TunnelController::builder(spec())
                        .port_allocator(allocator)
                        .supervisor(FakeSupervisor::new())
                        .port_probe(None)
                        .liveness_probe(None)
                        .build()
                        .await
                        .unwrap()
                        .local_port()
                })
            })
            .collect();

        let mut ports = HashSet::new();
        for task in tasks {
            assert!(ports.insert(task.await.unwrap()));
        }
        assert_eq!(ports.len(), 16);
    }
}
