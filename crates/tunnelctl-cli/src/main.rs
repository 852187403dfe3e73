use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use merge::Merge;
use tokio::signal;
use tracing::{debug, info, warn};
use tunnelctl_config::{load_from_paths, Config, PortCheck, Termination, VerifyMethod};
use tunnelctl_logging::init_logging;
use tunnelctl_ssh::{CommandBuilder, Liveness, PortAllocator, TunnelController, TunnelSpec};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true)]
    pub ssh_user: Option<String>,
    #[arg(long, global = true)]
    pub ssh_host: Option<String>,
    #[arg(long, global = true)]
    pub ssh_port: Option<u16>,
    #[arg(long, global = true)]
    pub local_address: Option<String>,
    #[arg(long, global = true)]
    pub local_port: Option<u16>,
    #[arg(long, global = true)]
    pub bind_host: Option<String>,
    #[arg(long, global = true)]
    pub bind_port: Option<u16>,
    #[arg(long, global = true)]
    pub identity_file: Option<String>,
    #[arg(long, global = true)]
    pub wait_ms: Option<u64>,
    #[arg(long, global = true)]
    pub tries: Option<u32>,
    /// Extra ssh option, repeatable. Replaces the configured list.
    #[arg(long = "ssh-option", global = true, allow_hyphen_values = true)]
    pub ssh_options: Vec<String>,
    #[arg(long, global = true)]
    pub auto_connect: Option<bool>,
    #[arg(long, global = true)]
    pub auto_disconnect: Option<bool>,
    #[arg(long, global = true)]
    pub detach: Option<bool>,
    #[arg(long, global = true)]
    pub ssh_path: Option<String>,
    #[arg(long, global = true)]
    pub lsof_path: Option<String>,
    #[arg(long, global = true)]
    pub nc_path: Option<String>,
    #[arg(long, global = true)]
    pub pkill_path: Option<String>,
    #[arg(long, global = true)]
    pub port_check: Option<PortCheck>,
    #[arg(long, global = true)]
    pub verify_method: Option<VerifyMethod>,
    #[arg(long, global = true)]
    pub termination: Option<Termination>,
    #[arg(long, global = true)]
    pub stop_grace_ms: Option<u64>,
    #[arg(long, global = true)]
    pub log_destination: Option<String>,
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    #[arg(long, global = true)]
    pub config: Option<String>,
    #[arg(long, global = true)]
    pub no_color: bool,
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Opens the tunnel and holds it until Ctrl+C.
    Open,
    /// Reports whether the tunnel on --local-port answers.
    Check,
    /// Kills a detached tunnel on --local-port by its command line.
    Close,
}

impl Cli {
    fn config_layer(&self) -> Config {
        Config {
            ssh_user: self.ssh_user.clone(),
            ssh_host: self.ssh_host.clone(),
            ssh_port: self.ssh_port,
            local_address: self.local_address.clone(),
            local_port: self.local_port,
            bind_host: self.bind_host.clone(),
            bind_port: self.bind_port,
            identity_file: self.identity_file.clone(),
            wait_ms: self.wait_ms,
            tries: self.tries,
            ssh_options: (!self.ssh_options.is_empty()).then(|| self.ssh_options.clone()),
            auto_connect: self.auto_connect,
            auto_disconnect: self.auto_disconnect,
            detach: self.detach,
            ssh_path: self.ssh_path.clone(),
            lsof_path: self.lsof_path.clone(),
            nc_path: self.nc_path.clone(),
            pkill_path: self.pkill_path.clone(),
            port_check: self.port_check,
            verify_method: self.verify_method,
            termination: self.termination,
            stop_grace_ms: self.stop_grace_ms,
            log_destination: self.log_destination.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- Configuration Setup ---
    let file_config = match &cli.config {
        Some(path) => Config::from_file(path).with_context(|| format!("Failed to load {}", path))?,
        None => load_from_paths()?,
    };
    let mut config = Config::default();
    config.merge(file_config);
    config.merge(cli.config_layer());

    // --- Logging ---
    init_logging(config.log_level.as_deref().unwrap_or("info"), !cli.no_color)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    debug!("Final configuration: {:#?}", config);
    let mut spec = TunnelSpec::try_from(&config)?;

    if cli.dry_run {
        return dry_run(&spec).await;
    }

    match cli.command {
        Commands::Open => open(spec).await,
        Commands::Check => {
            require_explicit_port(&spec, "check")?;
            spec.auto_connect = false;
            let tunnel = TunnelController::new(spec).await?;
            let liveness = tunnel.is_connected().await?;
            let label = match liveness {
                Liveness::Up => "up",
                Liveness::Down => "down",
                Liveness::Unknown => "unknown",
            };
            println!("{} {}", tunnel.endpoint(), label);
            if liveness == Liveness::Down {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Close => {
            require_explicit_port(&spec, "close")?;
            spec.auto_connect = false;
            let mut tunnel = TunnelController::new(spec).await?;
            tunnel.adopt()?;
            tunnel.disconnect().await?;
            info!("Closed SSH tunnel on {}", tunnel.endpoint());
            Ok(())
        }
    }
}

fn require_explicit_port(spec: &TunnelSpec, command: &str) -> anyhow::Result<()> {
    if spec.local_port == 0 {
        bail!("`{}` needs the tunnel's --local-port", command);
    }
    Ok(())
}

async fn dry_run(spec: &TunnelSpec) -> anyhow::Result<()> {
    // A throwaway allocator, so nothing is probed and the shared counter is untouched.
    let port = PortAllocator::default().resolve(spec.local_port, None).await?;
    let commands = CommandBuilder::new(spec).render(port);

    info!("[dry-run] Would execute the following steps:");
    match &commands.port_probe {
        Some(probe) => info!("[dry-run] 1. Check local port {} with: {}", port, probe),
        None => info!("[dry-run] 1. Use local port {} without checking it", port),
    }
    info!("[dry-run] 2. Launch the tunnel with: {}", commands.launch);
    match &commands.verify {
        Some(verify) => info!(
            "[dry-run] 3. Verify up to {} times, {:?} apart, with: {}",
            spec.tries, spec.wait, verify
        ),
        None => info!("[dry-run] 3. Accept the tunnel while the process keeps running"),
    }
    match (spec.termination, &commands.destroy) {
        (Termination::Pattern, Some(destroy)) => {
            info!("[dry-run] 4. On exit, stop it with: {}", destroy)
        }
        (Termination::None, _) => info!("[dry-run] 4. Leave the tunnel running on exit"),
        _ => info!("[dry-run] 4. On exit, signal the ssh process"),
    }
    Ok(())
}

/// Only a detached tunnel is out of reach of the Ctrl+C that stops us.
fn outlives_shutdown(spec: &TunnelSpec) -> bool {
    !spec.auto_disconnect && spec.detach
}

async fn open(spec: TunnelSpec) -> anyhow::Result<()> {
    let auto_disconnect = spec.auto_disconnect;
    let outlives = outlives_shutdown(&spec);
    if !auto_disconnect && !outlives {
        warn!(
            "auto_disconnect is off but the tunnel shares our process group, so Ctrl+C \
             will stop it too. Pass --detach true to keep it running."
        );
    }

    let mut tunnel = TunnelController::builder(spec).build().await?;
    tunnel.connect().await?;

    println!("{}", tunnel.endpoint());
    info!("SSH tunnel is now running on {}", tunnel.endpoint());
    info!("Press Ctrl+C to exit.");

    signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    warn!("Received shutdown signal. Cleaning up...");

    if auto_disconnect {
        tunnel.disconnect().await?;
        info!("Shutdown complete.");
    } else if outlives {
        info!("Leaving detached SSH tunnel on {} running", tunnel.endpoint());
    } else {
        info!("SSH tunnel on {} received the same interrupt and is gone", tunnel.endpoint());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_detached_tunnel_outlives_shutdown() {
        let mut spec = TunnelSpec::new("u", "h").unwrap();
        assert!(!outlives_shutdown(&spec));

        spec.auto_disconnect = false;
        assert!(!outlives_shutdown(&spec));

        spec.detach = true;
        assert!(outlives_shutdown(&spec));
    }

    #[test]
    fn test_cli_layer_overrides_file_layer() {
        let cli = Cli::parse_from([
            "tunnelctl",
            "--ssh-host",
            "bastion",
            "--detach",
            "true",
            "--ssh-option",
            "-v",
            "open",
        ]);
        let mut config = Config::default();
        config.merge(Config {
            ssh_host: Some("from-file".to_string()),
            ..Config::empty()
        });
        config.merge(cli.config_layer());

        assert_eq!(config.ssh_host.as_deref(), Some("bastion"));
        assert_eq!(config.detach, Some(true));
        assert_eq!(config.ssh_options, Some(vec!["-v".to_string()]));
    }
}
