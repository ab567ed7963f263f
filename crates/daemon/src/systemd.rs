//! Service-manager glue: unit start/stop, property queries and the
//! transient idle-teardown units.

use std::net::Ipv4Addr;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

pub async fn start(unit: &str) -> Result<bool> {
    let status = Command::new("systemctl")
        .args(["start", unit])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .with_context(|| format!("failed to run systemctl start {unit}"))?;
    Ok(status.success())
}

pub async fn stop(unit: &str) -> Result<bool> {
    let status = Command::new("systemctl")
        .args(["stop", unit])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .with_context(|| format!("failed to run systemctl stop {unit}"))?;
    Ok(status.success())
}

pub async fn is_active(unit: &str) -> bool {
    Command::new("systemctl")
        .args(["is-active", unit])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// One property of a unit, via `systemctl show -p <property> --value`.
/// Empty when the unit does not exist.
pub async fn show_property(unit: &str, property: &str) -> Result<String> {
    let output = Command::new("systemctl")
        .args(["show", "-p", property, "--value", unit])
        .output()
        .await
        .with_context(|| format!("failed to query {property} of {unit}"))?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub async fn reset_failed(unit: &str) {
    let _ = Command::new("systemctl")
        .args(["reset-failed", unit])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

pub fn autoremove_unit(interface: &str) -> String {
    format!("autoremove-{interface}")
}

/// Arguments an idle-teardown unit was launched with, recovered from
/// its ExecStart property.
#[derive(Debug, PartialEq, Eq)]
pub struct AutoremoveArgs {
    pub interface: String,
    pub peer_ip: Ipv4Addr,
}

/// Parse the argv recorded in a unit's ExecStart string. The unit runs
/// `wirelift autoremove <interface> <peer_ip> <is_remote> <start_time>`,
/// so the two leading operands after the subcommand identify the
/// session the tunnel belongs to.
pub fn parse_autoremove_args(exec_start: &str) -> Option<AutoremoveArgs> {
    let mut tokens = exec_start
        .split(|c: char| c.is_whitespace() || c == ';')
        .skip_while(|t| *t != "autoremove");
    tokens.next()?;
    let interface = tokens.next()?.to_string();
    let peer_ip = tokens.next()?.parse().ok()?;
    Some(AutoremoveArgs { interface, peer_ip })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_autoremove_args() {
        let exec_start = "{ path=/usr/local/bin/wirelift ; argv[]=/usr/local/bin/wirelift \
                          autoremove peerA 100.64.0.7 1 33 ; ignore_errors=no }";
        let args = parse_autoremove_args(exec_start).unwrap();
        assert_eq!(args.interface, "peerA");
        assert_eq!(args.peer_ip, Ipv4Addr::new(100, 64, 0, 7));
    }

    #[test]
    fn test_parse_autoremove_args_missing_unit() {
        assert_eq!(parse_autoremove_args(""), None);
        assert_eq!(parse_autoremove_args("{ path=/bin/true ; argv[]=/bin/true }"), None);
    }
}
