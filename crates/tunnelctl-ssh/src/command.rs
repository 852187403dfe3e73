//! Argument vectors for the four external tools a tunnel relies on.
//!
//! Nothing here is ever handed to a shell: [`CommandLine`] is spawned as a
//! program plus an argument vector. The shell-quoted [`Display`] form exists for
//! logs and error messages so an operator can paste it into a terminal.

use std::borrow::Cow;
use std::fmt;

use tunnelctl_config::{PortCheck, VerifyMethod};

use crate::spec::TunnelSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    pub fn to_std_command(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// The command line as `pkill -f` sees it: words joined by single spaces,
    /// quote characters dropped, regex metacharacters escaped.
    pub fn to_pattern(&self) -> String {
        let joined = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let normalized = joined
            .replace(['\'', '"'], "")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        let mut pattern = String::with_capacity(normalized.len());
        for c in normalized.chars() {
            if matches!(
                c,
                '\\' | '.' | '[' | ']' | '(' | ')' | '*' | '+' | '?' | '{' | '}' | '|' | '^' | '$'
            ) {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_escape(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_escape(arg))?;
        }
        Ok(())
    }
}

/// POSIX single-quote escaping; plain words are left as they are.
pub fn shell_escape(s: &str) -> Cow<'_, str> {
    let plain = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '_' | '-' | '.' | '/' | ':' | '@' | '%' | '+' | '=' | ',')
        });
    if plain {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("'{}'", s.replace('\'', "'\\''")))
    }
}

pub fn lsof_command(lsof_path: &str, port: u16) -> CommandLine {
    CommandLine::new(lsof_path).args(["-P", "-n", "-i"]).arg(format!(":{port}"))
}

pub fn netcat_command(nc_path: &str, address: &str, port: u16) -> CommandLine {
    CommandLine::new(nc_path).arg("-vz").arg(address).arg(port.to_string())
}

pub fn pattern_kill_command(pkill_path: &str, launch: &CommandLine) -> CommandLine {
    CommandLine::new(pkill_path).arg("-f").arg(launch.to_pattern())
}

/// Everything a controller runs for one tunnel, fixed once the port is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommands {
    pub launch: CommandLine,
    pub port_probe: Option<CommandLine>,
    pub verify: Option<CommandLine>,
    pub destroy: Option<CommandLine>,
}

pub struct CommandBuilder<'a> {
    spec: &'a TunnelSpec,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(spec: &'a TunnelSpec) -> Self {
        Self { spec }
    }

    /// `<local port>:<bind host>:<bind port>`, bracketing IPv6 literals.
    pub fn forward_spec(&self, port: u16) -> String {
        let host = &self.spec.bind_host;
        if host.contains(':') && !host.starts_with('[') {
            format!("{}:[{}]:{}", port, host, self.spec.bind_port)
        } else {
            format!("{}:{}:{}", port, host, self.spec.bind_port)
        }
    }

    pub fn launch(&self, port: u16) -> CommandLine {
        let spec = self.spec;
        let mut cmd = CommandLine::new(&spec.ssh_path).args(spec.ssh_options.iter().cloned());
        if let Some(identity) = &spec.identity_file {
            cmd = cmd.arg("-i").arg(identity.to_string_lossy());
        }
        cmd.arg("-N")
            .arg("-L")
            .arg(self.forward_spec(port))
            .arg("-p")
            .arg(spec.ssh_port.to_string())
            .arg(spec.destination())
    }

    pub fn port_probe(&self, port: u16) -> Option<CommandLine> {
        match (self.spec.port_check, &self.spec.lsof_path) {
            (PortCheck::Lsof, Some(path)) => Some(lsof_command(path, port)),
            _ => None,
        }
    }

    pub fn verify(&self, port: u16) -> Option<CommandLine> {
        match (self.spec.verify_method, &self.spec.nc_path) {
            (VerifyMethod::Netcat, Some(path)) => {
                Some(netcat_command(path, &self.spec.local_address, port))
            }
            _ => None,
        }
    }

    pub fn destroy(&self, port: u16) -> Option<CommandLine> {
        self.spec
            .pkill_path
            .as_deref()
            .map(|path| pattern_kill_command(path, &self.launch(port)))
    }

    pub fn render(&self, port: u16) -> RenderedCommands {
        RenderedCommands {
            launch: self.launch(port),
            port_probe: self.port_probe(port),
            verify: self.verify(port),
            destroy: self.destroy(port),
        }
    }
}
