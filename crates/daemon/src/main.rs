use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::warn;
use wirelift::client;
use wirelift::config::Settings;
use wirelift::daemon::Daemon;
use wirelift::messages::SessionExit;
use wirelift::recover;

fn load_settings(args: &Args) -> Settings {
    if let Some(path) = &args.config {
        Settings::load(path).unwrap_or_else(|e| {
            warn!(
                "Failed to load config from {:?}: {}. Using defaults.",
                path, e
            );
            Settings::default()
        })
    } else {
        Settings::load_or_default()
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "wirelift",
    version,
    about = "Upgrade your existing Tailscale connection by transitioning to pure WireGuard",
    long_about = "Wirelift\n\n\
        Upgrades a relayed Tailscale link between two hosts into a direct\n\
        peer-to-peer WireGuard tunnel, and recovers it when it degrades.\n\n\
        Examples:\n  \
          # Run the daemon (normally under systemd)\n  \
          wirelift daemon start\n\n  \
          # Upgrade the connection to a peer\n  \
          wirelift upgrade peerb"
)]
struct Args {
    /// Path to config file
    #[arg(long, short = 'C')]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Commands to manage the daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Duplicate a Tailscale connection with pure WireGuard
    Upgrade {
        /// IP address or Tailscale name of the peer to connect to
        peer: String,

        /// Path to a WireGuard config template.
        /// Defaults to /etc/wirelift/{peername}.conf
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Interface name WireGuard will set up. Defaults to {peername}
        #[arg(long, short = 'i')]
        interface: Option<String>,

        /// Prevent numeric suffix addition to existing interface names
        #[arg(long)]
        no_suffix: bool,

        /// Prevent automatic removal of the WireGuard interface if the
        /// connection is permanently lost
        #[arg(long)]
        disable_autoremove: bool,
    },
    /// Recover a lost connection on an interface set up by wirelift
    Recover {
        /// Interface whose tunnel should be reestablished
        interface: String,
    },
    /// Deactivate a WireGuard interface set up by wirelift
    Down {
        /// Shortcut for 'wg-quick down /run/wirelift/{interface}.conf'
        interface: String,
    },
    /// Handshake-staleness watchdog launched by the autoremove units
    #[command(hide = true)]
    Autoremove {
        interface: String,
        peer_ip: Ipv4Addr,
        is_remote: u8,
        start_time: u32,
    },
}

#[derive(Subcommand, Debug)]
enum DaemonAction {
    /// Start the daemon in the foreground. Must be run as root
    Start {
        /// Prevent numeric suffix addition to existing interface names
        #[arg(long)]
        no_suffix: bool,

        /// Never register idle-teardown watchdogs for new tunnels
        #[arg(long)]
        disable_autoremove: bool,
    },
    /// Ask a running daemon to stop accepting new requests
    Stop,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    let mut settings = load_settings(&args);

    let code = match args.command {
        Command::Daemon {
            action:
                DaemonAction::Start {
                    no_suffix,
                    disable_autoremove,
                },
        } => {
            settings.upgrade.suffix &= !no_suffix;
            settings.upgrade.autoremove &= !disable_autoremove;
            match Arc::new(Daemon::new(settings)).run().await {
                Ok(()) => 0,
                Err(e) => match e.downcast_ref::<SessionExit>() {
                    Some(SessionExit(status)) => *status,
                    None => {
                        eprintln!("Error: {e:#}");
                        1
                    }
                },
            }
        }
        Command::Daemon {
            action: DaemonAction::Stop,
        } => client::stop(&settings).await,
        Command::Upgrade {
            peer,
            config,
            interface,
            no_suffix,
            disable_autoremove,
        } => {
            client::upgrade(
                &settings,
                &peer,
                config,
                interface,
                !no_suffix,
                !disable_autoremove,
            )
            .await
        }
        Command::Recover { interface } => client::recover(&settings, &interface).await,
        Command::Down { interface } => client::down(&settings, &interface).await,
        Command::Autoremove {
            interface,
            peer_ip,
            is_remote,
            start_time,
        } => {
            match recover::autoremove_watchdog(
                &interface,
                peer_ip,
                is_remote != 0,
                start_time,
                &settings,
            )
            .await
            {
                Ok(status) => status,
                Err(e) => {
                    eprintln!("Error: {e:#}");
                    1
                }
            }
        }
    };
    std::process::exit(code);
}
