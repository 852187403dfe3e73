//! Opens, verifies and tears down SSH local port forwards.

mod command;
mod controller;
mod error;
mod ports;
mod probe;
mod process;
mod spec;

pub use command::{
    lsof_command, netcat_command, pattern_kill_command, shell_escape, CommandBuilder, CommandLine,
    RenderedCommands,
};
pub use controller::{ConnectionState, Endpoint, TunnelController, TunnelControllerBuilder};
pub use error::{ProcessError, TunnelError};
pub use ports::{PortAllocator, FIRST_AUTO_PORT};
pub use probe::{
    liveness_probe_for, port_probe_for, Availability, BindPortProbe, Liveness, LivenessProbe,
    LsofPortProbe, NetcatLivenessProbe, PortProbe, TcpLivenessProbe,
};
pub use process::{
    ChildProcess, CommandRunner, ProcessRunner, ProcessSupervisor, ProcessSupervisorImpl,
    TunnelHandle,
};
pub use spec::{LogDestination, TunnelSpec};
