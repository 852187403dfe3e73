//! The immutable description of one tunnel, validated from a [`Config`].

use std::path::PathBuf;
use std::time::Duration;

use merge::Merge;
use tunnelctl_config::{expand_tilde, Config, PortCheck, Termination, VerifyMethod};

use crate::error::TunnelError;

/// Where the tunnel process writes its stdout and stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Discard,
    Inherit,
    /// Pipe both streams and re-emit every line through `tracing`.
    Tracing,
    /// Append to a file.
    File(PathBuf),
}

impl LogDestination {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "discard" | "/dev/null" => LogDestination::Discard,
            "inherit" => LogDestination::Inherit,
            "tracing" => LogDestination::Tracing,
            path => LogDestination::File(expand_tilde(path).unwrap_or_else(|| PathBuf::from(path))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub ssh_user: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub local_address: String,
    /// 0 asks the port allocator for one.
    pub local_port: u16,
    pub bind_host: String,
    pub bind_port: u16,
    pub identity_file: Option<PathBuf>,
    pub ssh_options: Vec<String>,
    /// Settle interval after launch and between verification attempts.
    pub wait: Duration,
    pub tries: u32,
    pub auto_connect: bool,
    pub auto_disconnect: bool,
    pub detach: bool,
    pub ssh_path: String,
    pub lsof_path: Option<String>,
    pub nc_path: Option<String>,
    pub pkill_path: Option<String>,
    pub port_check: PortCheck,
    pub verify_method: VerifyMethod,
    pub termination: Termination,
    pub stop_grace: Duration,
    pub log_destination: LogDestination,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Rejects values ssh would read as an option or split into several words.
fn check_token(field: &str, value: &str) -> Result<(), TunnelError> {
    if value.starts_with('-') {
        return Err(TunnelError::invalid(format!("{field} must not start with '-': {value:?}")));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(TunnelError::invalid(format!(
            "{field} contains whitespace or control characters: {value:?}"
        )));
    }
    Ok(())
}

impl TunnelSpec {
    /// Defaults for everything except the SSH endpoint.
    pub fn new(
        ssh_user: impl Into<String>,
        ssh_host: impl Into<String>,
    ) -> Result<Self, TunnelError> {
        let config = Config {
            ssh_user: Some(ssh_user.into()),
            ssh_host: Some(ssh_host.into()),
            ..Config::empty()
        };
        Self::try_from(&config)
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.ssh_host.is_empty() {
            return Err(TunnelError::invalid("ssh_host is required"));
        }
        check_token("ssh_host", &self.ssh_host)?;
        if !self.ssh_user.is_empty() {
            check_token("ssh_user", &self.ssh_user)?;
        }
        if self.bind_host.is_empty() || self.local_address.is_empty() {
            return Err(TunnelError::invalid("bind_host and local_address must not be empty"));
        }
        check_token("bind_host", &self.bind_host)?;
        check_token("local_address", &self.local_address)?;
        if self.ssh_port == 0 || self.bind_port == 0 {
            return Err(TunnelError::invalid("ssh_port and bind_port must be between 1 and 65535"));
        }
        if self.tries == 0 {
            return Err(TunnelError::invalid("tries must be at least 1"));
        }
        if self.ssh_path.trim().is_empty() {
            return Err(TunnelError::invalid("ssh_path must not be empty"));
        }
        if self.auto_disconnect {
            match self.termination {
                Termination::None => {
                    return Err(TunnelError::invalid(
                        "auto_disconnect requires a termination method, but termination is 'none'",
                    ));
                }
                Termination::Pattern if self.pkill_path.is_none() => {
                    return Err(TunnelError::invalid(
                        "auto_disconnect with pattern termination requires pkill_path",
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The destination argument, `user@host` or just `host`.
    pub fn destination(&self) -> String {
        if self.ssh_user.is_empty() {
            self.ssh_host.clone()
        } else {
            format!("{}@{}", self.ssh_user, self.ssh_host)
        }
    }
}

impl TryFrom<&Config> for TunnelSpec {
    type Error = TunnelError;

    fn try_from(layer: &Config) -> Result<Self, Self::Error> {
        let mut config = Config::default();
        config.merge(layer.clone());

        let spec = TunnelSpec {
            ssh_user: config.ssh_user.unwrap_or_default(),
            ssh_host: config.ssh_host.unwrap_or_default(),
            ssh_port: config.ssh_port.unwrap_or(22),
            local_address: config.local_address.unwrap_or_else(|| "127.0.0.1".to_string()),
            local_port: config.local_port.unwrap_or(0),
            bind_host: config.bind_host.unwrap_or_else(|| "127.0.0.1".to_string()),
            bind_port: config.bind_port.unwrap_or(3306),
            identity_file: non_empty(config.identity_file)
                .map(|path| expand_tilde(&path).unwrap_or_else(|| PathBuf::from(path))),
            ssh_options: config.ssh_options.unwrap_or_default(),
            wait: Duration::from_millis(config.wait_ms.unwrap_or(1000)),
            tries: config.tries.unwrap_or(10),
            auto_connect: config.auto_connect.unwrap_or(true),
            auto_disconnect: config.auto_disconnect.unwrap_or(true),
            detach: config.detach.unwrap_or(false),
            ssh_path: config.ssh_path.unwrap_or_else(|| "ssh".to_string()),
            lsof_path: non_empty(config.lsof_path),
            nc_path: non_empty(config.nc_path),
            pkill_path: non_empty(config.pkill_path),
            port_check: config.port_check.unwrap_or(PortCheck::Lsof),
            verify_method: config.verify_method.unwrap_or(VerifyMethod::Netcat),
            termination: config.termination.unwrap_or(Termination::Signal),
            stop_grace: Duration::from_millis(config.stop_grace_ms.unwrap_or(250)),
            log_destination: LogDestination::parse(
                config.log_destination.as_deref().unwrap_or("discard"),
            ),
        };
        spec.validate()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let spec = TunnelSpec::new("u", "h").unwrap();
        assert_eq!(spec.ssh_port, 22);
        assert_eq!(spec.local_port, 0);
        assert_eq!(spec.bind_host, "127.0.0.1");
        assert_eq!(spec.bind_port, 3306);
        assert_eq!(spec.wait, Duration::from_millis(1000));
        assert_eq!(spec.tries, 10);
        assert_eq!(spec.ssh_options, vec!["-q".to_string()]);
        assert!(spec.auto_connect && spec.auto_disconnect);
        assert_eq!(spec.log_destination, LogDestination::Discard);
        assert_eq!(spec.destination(), "u@h");
    }

    #[test]
    fn test_empty_user_uses_bare_host() {
        let spec = TunnelSpec::new("", "bastion").unwrap();
        assert_eq!(spec.destination(), "bastion");
    }

    #[test]
    fn test_option_like_host_rejected() {
        let err = TunnelSpec::new("u", "-oProxyCommand=touch /tmp/x").unwrap_err();
        assert!(matches!(err, TunnelError::InvalidConfiguration(_)));

        let err = TunnelSpec::new("u x", "h").unwrap_err();
        assert!(matches!(err, TunnelError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_auto_disconnect_without_termination() {
        let config = Config {
            ssh_user: Some("u".to_string()),
            ssh_host: Some("h".to_string()),
            termination: Some(Termination::None),
            ..Config::empty()
        };
        let err = TunnelSpec::try_from(&config).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidConfiguration(_)));

        let config = Config {
            auto_disconnect: Some(false),
            ..config
        };
        assert!(TunnelSpec::try_from(&config).is_ok());
    }

    #[test]
    fn test_pattern_termination_needs_pkill() {
        let config = Config {
            ssh_host: Some("h".to_string()),
            termination: Some(Termination::Pattern),
            pkill_path: Some(String::new()),
            ..Config::empty()
        };
        assert!(matches!(
            TunnelSpec::try_from(&config),
            Err(TunnelError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_zero_tries_rejected() {
        let config = Config {
            ssh_host: Some("h".to_string()),
            tries: Some(0),
            ..Config::empty()
        };
        assert!(TunnelSpec::try_from(&config).is_err());
    }

    #[test]
    fn test_empty_tool_paths_disable_probes() {
        let config = Config {
            ssh_host: Some("h".to_string()),
            lsof_path: Some(String::new()),
            nc_path: Some("  ".to_string()),
            ..Config::empty()
        };
        let spec = TunnelSpec::try_from(&config).unwrap();
        assert_eq!(spec.lsof_path, None);
        assert_eq!(spec.nc_path, None);
    }

    #[test]
    fn test_log_destination_parse() {
        assert_eq!(LogDestination::parse("discard"), LogDestination::Discard);
        assert_eq!(LogDestination::parse("tracing"), LogDestination::Tracing);
        assert_eq!(
            LogDestination::parse("/var/log/tunnel.log"),
            LogDestination::File(PathBuf::from("/var/log/tunnel.log"))
        );
    }
}
