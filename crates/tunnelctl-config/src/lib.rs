use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use directories::BaseDirs;
use merge::Merge;
use serde::Deserialize;
use thiserror::Error;

/// A custom merge strategy for `Option<T>` fields. It overwrites the destination
/// (`left`) with the source (`right`) only if the source is `Some`.
fn overwrite_if_some<T>(left: &mut Option<T>, right: Option<T>) {
    if right.is_some() {
        *left = right;
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Unknown value '{value}' for {field}, expected one of: {expected}")]
    UnknownValue {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// How the controller decides whether a local port is already taken.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortCheck {
    /// Run `lsof -P -n -i :<port>`.
    Lsof,
    /// Try to bind the port in-process.
    Bind,
    None,
}

/// How the controller verifies that the tunnel accepts connections.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMethod {
    /// Run `nc -vz <address> <port>`.
    Netcat,
    /// Open and immediately close a TCP stream in-process.
    Tcp,
    None,
}

/// How a running tunnel gets torn down.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Termination {
    /// Signal the child process we spawned.
    Signal,
    /// Run `pkill -f` against the launch command line.
    Pattern,
    None,
}

macro_rules! selector {
    ($ty:ident, $field:literal, { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(ConfigError::UnknownValue {
                        field: $field,
                        value: s.to_string(),
                        expected: concat!($($name, " "),+),
                    }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($ty::$variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

selector!(PortCheck, "port_check", { "lsof" => Lsof, "bind" => Bind, "none" => None });
selector!(VerifyMethod, "verify_method", { "netcat" => Netcat, "tcp" => Tcp, "none" => None });
selector!(Termination, "termination", { "signal" => Signal, "pattern" => Pattern, "none" => None });

#[derive(Deserialize, Merge, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub local_address: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub local_port: Option<u16>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub bind_host: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub bind_port: Option<u16>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub identity_file: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub wait_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub tries: Option<u32>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_options: Option<Vec<String>>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub auto_connect: Option<bool>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub auto_disconnect: Option<bool>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub detach: Option<bool>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub lsof_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub nc_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub pkill_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub port_check: Option<PortCheck>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub verify_method: Option<VerifyMethod>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub termination: Option<Termination>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub stop_grace_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub log_destination: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ssh_user: None,
            ssh_host: None,
            ssh_port: Some(22),
            local_address: Some("127.0.0.1".to_string()),
            local_port: Some(0),
            bind_host: Some("127.0.0.1".to_string()),
            bind_port: Some(3306),
            identity_file: None,
            wait_ms: Some(1000),
            tries: Some(10),
            ssh_options: Some(vec!["-q".to_string()]),
            auto_connect: Some(true),
            auto_disconnect: Some(true),
            detach: Some(false),
            ssh_path: Some("ssh".to_string()),
            lsof_path: Some("lsof".to_string()),
            nc_path: Some("nc".to_string()),
            pkill_path: Some("pkill".to_string()),
            port_check: Some(PortCheck::Lsof),
            verify_method: Some(VerifyMethod::Netcat),
            termination: Some(Termination::Signal),
            stop_grace_ms: Some(250),
            log_destination: Some("discard".to_string()),
            log_level: Some("info".to_string()),
        }
    }
}

impl Config {
    /// A layer with every field unset, used when no file is present.
    pub fn empty() -> Self {
        Self {
            ssh_user: None, ssh_host: None, ssh_port: None,
            local_address: None, local_port: None, bind_host: None, bind_port: None,
            identity_file: None, wait_ms: None, tries: None, ssh_options: None,
            auto_connect: None, auto_disconnect: None, detach: None,
            ssh_path: None, lsof_path: None, nc_path: None, pkill_path: None,
            port_check: None, verify_method: None, termination: None,
            stop_grace_ms: None, log_destination: None, log_level: None,
        }
    }

    /// Loads a single layer from an explicit file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Loads configuration from standard paths.
pub fn load_from_paths() -> Result<Config, ConfigError> {
    let home_dir_path = BaseDirs::new().map(|dirs| {
        dirs.home_dir().join(".tunnelctl/config.json")
    });

    let current_dir_path = Path::new("./tunnelctl.json").to_path_buf();

    let paths_to_check = [
        home_dir_path,
        Some(current_dir_path)
    ];

    for path in paths_to_check.iter().flatten() {
        if path.exists() {
            return Config::from_file(path);
        }
    }

    Ok(Config::empty())
}

/// Resolves a path that may start with `~/`.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    let path = path.as_ref();
    let Ok(rest) = path.strip_prefix("~") else {
        return Some(path.to_path_buf());
    };

    BaseDirs::new().map(|dirs| dirs.home_dir().join(rest))
}
