//! Unix-socket client side of the local channel.
//!
//! Connects to the daemon, sends exactly one request, then streams
//! `INFO`/`SUCCESS`/error messages to the terminal until the daemon
//! closes the channel. Exit codes: 0 success, 1 generic fatal, 2
//! reachability fatal (also used when the daemon itself is absent).

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::time::timeout;

use crate::channel::Channel;
use crate::config::Settings;
use crate::locker;
use crate::messages::{self, ActionCode, Message, SessionExit};
use crate::systemd;
use crate::tailscale;
use crate::wgconfig;

async fn connect(settings: &Settings) -> Option<Channel> {
    println!("Connecting to local UNIX socket...");
    match UnixStream::connect(&settings.daemon.socket_path).await {
        Ok(stream) => {
            println!("Connection to local UNIX socket established");
            Some(Channel::unix(stream))
        }
        Err(e) => {
            eprintln!("{} ({e})", messages::UNIX_SOCKET);
            None
        }
    }
}

/// Map a failed preparation step to its exit status. Adapter failures
/// have already printed their own report.
fn report_failure(e: anyhow::Error) -> i32 {
    match e.downcast_ref::<SessionExit>() {
        Some(SessionExit(status)) => *status,
        None => {
            eprintln!("Error: {e:#}");
            1
        }
    }
}

/// Print the message stream until a result arrives; the daemon never
/// closes the channel silently.
async fn stream_responses(mut channel: Channel) -> i32 {
    loop {
        match channel.recv().await {
            Ok(Some(message)) => {
                if let Some(code) = message.error_code {
                    if let Some(text) = &message.error_message {
                        eprintln!("{text}");
                    }
                    return code.exit_status();
                }
                match message.code {
                    Some(ActionCode::Info) => {
                        if let Some(text) = message.message {
                            println!("{text}");
                        }
                    }
                    Some(ActionCode::Success) => {
                        if let Some(text) = message.message {
                            println!("{text}");
                        }
                        return 0;
                    }
                    _ => {}
                }
            }
            Ok(None) => {
                eprintln!("Error: The connection was closed before a result was received");
                return 1;
            }
            Err(e) => {
                eprintln!("Error: {e:#}");
                return 1;
            }
        }
    }
}

/// Resolve and sanity-check the peer argument. The whole sequence is
/// atomic with respect to every other wirelift invocation on this
/// host: resolve the name, verify it is a distinct known host, verify
/// an endpoint is available.
async fn check_peer(settings: &Settings, peer: &str) -> Result<Ipv4Addr> {
    let peer = peer.trim();
    if peer.is_empty() {
        bail!("you provided an empty peer");
    }
    let _lock = locker::lock(&settings.daemon.runtime_dir).await?;
    let ip = match peer.parse::<Ipv4Addr>() {
        Ok(ip) => ip,
        Err(_) => tailscale::peer_ip(peer).await?,
    };
    if ip == tailscale::my_ip().await? {
        bail!("you should not connect to your own machine");
    }
    tailscale::peer(ip).await?;
    tailscale::peer_endpoint(ip).await?;
    Ok(ip)
}

pub async fn upgrade(
    settings: &Settings,
    peer: &str,
    config: Option<PathBuf>,
    interface: Option<String>,
    suffix: bool,
    autoremove: bool,
) -> i32 {
    if let Some(name) = &interface {
        if !wgconfig::valid_interface_name(name) {
            eprintln!("Error: '{name}' is not a valid name for a WireGuard interface");
            return 1;
        }
    }
    println!("Checking peer '{peer}' is correct. This might take some minutes...");
    let peer_ip = match check_peer(settings, peer).await {
        Ok(ip) => ip,
        Err(e) => return report_failure(e),
    };

    let Some(mut channel) = connect(settings).await else {
        return 2;
    };
    let request = Message::upgrade_request(
        peer_ip,
        config.as_deref(),
        interface.as_deref(),
        suffix,
        autoremove,
    );
    if let Err(e) = channel.send(&request).await {
        eprintln!("Error: {e:#}");
        return 1;
    }
    stream_responses(channel).await
}

pub async fn stop(settings: &Settings) -> i32 {
    let Some(mut channel) = connect(settings).await else {
        return 2;
    };
    if channel.send(&Message::stop()).await.is_err() {
        eprintln!("Error: The UNIX server is not responding to the stop request");
        return 1;
    }
    // The daemon acknowledges by closing the channel; an error reply
    // means it was already shutting down.
    match timeout(Duration::from_secs(40), channel.recv()).await {
        Err(_) => {
            eprintln!("Error: The UNIX server is not responding to the stop request");
            1
        }
        Ok(Ok(None)) => {
            println!("Connection has been successfully closed");
            0
        }
        Ok(Ok(Some(message))) => {
            if let Some(text) = message.error_message {
                eprintln!("{text}");
            }
            1
        }
        Ok(Err(e)) => {
            eprintln!("Error: {e:#}");
            1
        }
    }
}

pub async fn recover(settings: &Settings, interface: &str) -> i32 {
    let unit = systemd::autoremove_unit(interface);
    let exec_start = match systemd::show_property(&unit, "ExecStart").await {
        Ok(value) => value,
        Err(e) => return report_failure(e),
    };
    let Some(args) = systemd::parse_autoremove_args(&exec_start) else {
        eprintln!("Error: No active autoremove unit was found for interface '{interface}'");
        return 1;
    };
    let latest_handshake = wgconfig::latest_handshake(interface).await.unwrap_or(0);

    let Some(mut channel) = connect(settings).await else {
        return 2;
    };
    let request = Message::recover_request(interface, args.peer_ip, latest_handshake);
    if let Err(e) = channel.send(&request).await {
        eprintln!("Error: {e:#}");
        return 1;
    }
    stream_responses(channel).await
}

/// `wg-quick down` on a runtime config generated by this daemon.
pub async fn down(settings: &Settings, interface: &str) -> i32 {
    let runfile = settings.daemon.runtime_dir.join(format!("{interface}.conf"));
    if !runfile.exists() {
        eprintln!("Error: file '{}' does not exist", runfile.display());
        return 1;
    }
    match Command::new("wg-quick")
        .args(["down", &runfile.display().to_string()])
        .status()
        .await
    {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            eprintln!("Error: failed to run wg-quick: {e}");
            1
        }
    }
}
