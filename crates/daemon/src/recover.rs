//! Liveness recovery for an established tunnel, and the idle-teardown
//! watchdog that triggers it.
//!
//! A degraded tunnel is usually the fallout of a backend restart on one
//! of the two hosts, so recovery first waits (bounded) for the control
//! plane to report the peer reachable again, then tears the stale
//! interface down and re-enters the normal negotiation under the same
//! interface name.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use log::{info, warn};
use tokio::process::Command;
use tokio::time::sleep;

use crate::client;
use crate::config::Settings;
use crate::messages::{send_info, ErrorCode, ErrorReport, Message};
use crate::session::Session;
use crate::systemd;
use crate::tailscale;
use crate::upgrade;
use crate::wgconfig;

/// Daemon-side recovery worker. Runs as the initiator once the peer is
/// reachable again; the other host serves it like any inbound upgrade.
pub async fn run_recovery(
    session: &Arc<Session>,
    request: &Message,
    settings: &Settings,
) -> Result<()> {
    let Some(interface) = request.interface.clone() else {
        return ErrorReport::new(ErrorCode::Generic)
            .local("Error: The recover request is missing the interface name")
            .send()
            .await;
    };
    let peer_name = session.peer_name().await?;
    let wait = settings.timing.recovery_wait();

    send_info(
        format!(
            "Waiting for tailscale to be fully operational again. This could take up to {} \
             seconds...",
            wait.as_secs()
        ),
        None,
    )
    .await;
    if !tailscale::wait_until_peer_is_online(session.peer_ip, wait).await {
        return ErrorReport::new(ErrorCode::Generic)
            .local(format!(
                "Error: Either this tailscale instance or the peer '{peer_name}' ({}) has not \
                 fully recovered and cannot reestablish the connection",
                session.peer_ip
            ))
            .send()
            .await;
    }
    send_info("Tailscale is fully working again!", None).await;

    let runfile = settings.daemon.runtime_dir.join(format!("{interface}.conf"));
    if runfile.exists() {
        send_info(
            format!("Bringing down the stale interface '{interface}'..."),
            None,
        )
        .await;
        let down = Command::new("wg-quick")
            .args(["down", &runfile.display().to_string()])
            .output()
            .await;
        if let Ok(output) = down {
            if !output.status.success() {
                warn!(
                    "wg-quick down {} failed: {}",
                    runfile.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
    }
    let unit = systemd::autoremove_unit(&interface);
    let _ = systemd::stop(&unit).await;
    systemd::reset_failed(&unit).await;

    // Renegotiate under the same name. The stale interface is gone, so
    // no suffix is needed unless something else claimed the name.
    let request = Message::upgrade_request(
        session.peer_ip,
        None,
        Some(interface.as_str()),
        settings.upgrade.suffix,
        settings.upgrade.autoremove,
    );
    upgrade::run_initiator(session, &request, settings).await
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Handshake-staleness watchdog, run by the transient autoremove unit
/// wg-quick launches on PostUp. Watches the interface's latest
/// handshake; once it goes stale, asks the daemon to recover the
/// tunnel, and tears the interface down for good if recovery fails.
pub async fn autoremove_watchdog(
    interface: &str,
    peer_ip: Ipv4Addr,
    is_remote: bool,
    start_time: u32,
    settings: &Settings,
) -> Result<i32> {
    let interval = settings.timing.watchdog_interval();
    // Desynchronize the two ends so they do not both hole-punch at
    // once; the responder side lags behind the initiator.
    let stagger = Duration::from_secs(u64::from(start_time % 10))
        + if is_remote {
            Duration::from_secs(15)
        } else {
            Duration::ZERO
        };
    info!(
        "watching interface '{interface}' for peer {peer_ip} (stagger {}s)",
        stagger.as_secs()
    );
    sleep(interval + stagger).await;

    loop {
        let handshake = match wgconfig::latest_handshake(interface).await {
            Ok(stamp) => stamp,
            Err(_) => {
                info!("interface '{interface}' is gone, stopping the watchdog");
                return Ok(0);
            }
        };
        let age = now_secs().saturating_sub(handshake);
        if handshake != 0 && age > settings.timing.handshake_stale_secs {
            warn!(
                "latest handshake on '{interface}' is {age}s old, attempting recovery"
            );
            let status = client::recover(settings, interface).await;
            if status != 0 {
                eprintln!(
                    "Error: Could not recover interface '{interface}'; removing it after \
                     prolonged inactivity"
                );
                let runfile = settings.daemon.runtime_dir.join(format!("{interface}.conf"));
                let _ = Command::new("wg-quick")
                    .args(["down", &runfile.display().to_string()])
                    .output()
                    .await;
                let _ = std::fs::remove_file(&runfile);
                return Ok(status);
            }
        }
        sleep(interval).await;
    }
}
