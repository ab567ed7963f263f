//! Control-plane adapter over the externally running tailscale agent.
//!
//! Every query shells out to the `tailscale` CLI (or `ss` for the local
//! listen port) and parses its output. Identity lookups that cannot
//! change without a daemon restart are memoized for the process
//! lifetime. Failures that end a negotiation are converted right here
//! into reports against the calling worker's channels.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::unistd::Uid;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::{sleep, Instant};

use crate::messages::{self, send_info, ErrorCode, ErrorReport};
use crate::session::Session;
use crate::systemd;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

static MY_IP: OnceCell<Ipv4Addr> = OnceCell::const_new();
static DNS_SUFFIX: OnceCell<String> = OnceCell::const_new();

/// Parsed `tailscale status --json`, reduced to the fields the
/// negotiation needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Status {
    pub backend_state: String,
    #[serde(rename = "MagicDNSSuffix", default)]
    pub magic_dns_suffix: String,
    #[serde(rename = "Self")]
    pub self_node: Option<Node>,
    #[serde(default)]
    pub peer: HashMap<String, Node>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    #[serde(rename = "DNSName", default)]
    pub dns_name: String,
    #[serde(default)]
    pub online: bool,
    #[serde(rename = "TailscaleIPs", default)]
    pub tailscale_ips: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WhoisReply {
    node: WhoisNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WhoisNode {
    key: String,
}

async fn tailscale_output(args: &[&str]) -> Result<std::process::Output> {
    Command::new("tailscale")
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run tailscale {}", args.join(" ")))
}

pub async fn start() -> Result<bool> {
    systemd::start("tailscaled").await
}

pub async fn stop() -> Result<bool> {
    systemd::stop("tailscaled").await
}

pub async fn service_is_running() -> bool {
    systemd::is_active("tailscaled.service").await
}

async fn check_service_running() -> Result<()> {
    if !service_is_running().await {
        return ErrorReport::new(ErrorCode::Generic)
            .local(messages::TS_SYSTEMD_STOPPED)
            .send()
            .await;
    }
    Ok(())
}

/// Fresh backend status. Fails the session when the tailscaled service
/// itself is stopped.
pub async fn status() -> Result<Status> {
    check_service_running().await?;
    let output = tailscale_output(&["status", "--json"]).await?;
    serde_json::from_slice(&output.stdout).context("failed to parse tailscale status")
}

/// Block until the backend exposes a state, then fail the session
/// unless it is logged in and running.
pub async fn check_running() -> Result<()> {
    loop {
        if !status().await?.backend_state.eq_ignore_ascii_case("NoState") {
            break;
        }
        sleep(POLL_INTERVAL).await;
    }
    let state = status().await?.backend_state;
    if state.eq_ignore_ascii_case("NeedsLogin") {
        return ErrorReport::new(ErrorCode::Generic)
            .local(messages::TS_NO_LOGGED)
            .send()
            .await;
    }
    if state.eq_ignore_ascii_case("Stopped") {
        return ErrorReport::new(ErrorCode::Generic)
            .local(messages::TS_STOPPED)
            .send()
            .await;
    }
    if !state.eq_ignore_ascii_case("Running") {
        return ErrorReport::new(ErrorCode::Generic)
            .local(messages::TS_NOT_RUNNING)
            .send()
            .await;
    }
    Ok(())
}

/// The tailnet's MagicDNS suffix, memoized for the process lifetime.
pub async fn dns_suffix() -> Result<String> {
    DNS_SUFFIX
        .get_or_try_init(|| async { Ok(status().await?.magic_dns_suffix.to_lowercase()) })
        .await
        .cloned()
}

fn strip_dns_suffix(dns_name: &str, suffix: &str) -> String {
    let name = dns_name.trim_end_matches('.');
    match name.strip_suffix(&format!(".{suffix}")) {
        Some(stripped) => stripped.to_string(),
        None => name.to_string(),
    }
}

pub async fn my_name() -> Result<String> {
    let status = status().await?;
    let node = status
        .self_node
        .ok_or_else(|| anyhow!("tailscale status reports no self node"))?;
    Ok(strip_dns_suffix(&node.dns_name, &dns_suffix().await?))
}

/// Local tailscale IPv4 address. Resolved once; it cannot change
/// without a tailscaled restart, which takes this daemon down with it.
pub async fn my_ip() -> Result<Ipv4Addr> {
    MY_IP
        .get_or_try_init(|| async {
            check_running().await?;
            let output = tailscale_output(&["ip", "-4"]).await?;
            let text = String::from_utf8_lossy(&output.stdout);
            text.split_whitespace()
                .next()
                .unwrap_or_default()
                .parse()
                .context("failed to parse the local tailscale IPv4 address")
        })
        .await
        .copied()
}

/// Peer record for a tailscale address. No matching peer fails the
/// session with a "no such peer" report.
pub async fn peer(ip: Ipv4Addr) -> Result<Node> {
    check_running().await?;
    let output = tailscale_output(&["whois", "--json", &ip.to_string()]).await?;
    if !output.status.success() {
        return ErrorReport::new(ErrorCode::Generic)
            .local(format!("Error: No peer found matching the IP '{ip}'"))
            .fail()
            .await;
    }
    let whois: WhoisReply =
        serde_json::from_slice(&output.stdout).context("failed to parse tailscale whois")?;
    match status().await?.peer.get(&whois.node.key) {
        Some(node) => Ok(node.clone()),
        None => {
            ErrorReport::new(ErrorCode::Generic)
                .local(format!("Error: No peer found matching the IP '{ip}'"))
                .fail()
                .await
        }
    }
}

pub async fn peer_name(ip: Ipv4Addr) -> Result<String> {
    let node = peer(ip).await?;
    Ok(strip_dns_suffix(&node.dns_name, &dns_suffix().await?))
}

pub async fn peer_ip(name: &str) -> Result<Ipv4Addr> {
    check_running().await?;
    let output = tailscale_output(&["ip", "-4", name]).await?;
    if !output.status.success() {
        return ErrorReport::new(ErrorCode::Generic)
            .local(format!("Error: No IPv4 found for peer '{name}'"))
            .fail()
            .await;
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .with_context(|| format!("failed to parse the tailscale IPv4 address of '{name}'"))
}

/// Short bounded reachability probe.
pub async fn peer_is_online(ip: Ipv4Addr) -> bool {
    Command::new("tailscale")
        .args([
            "ping",
            "-c",
            "3",
            "--until-direct=false",
            "--timeout",
            "3s",
            &ip.to_string(),
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn probe_once(ip: Ipv4Addr) -> bool {
    Command::new("tailscale")
        .args(["ping", "-c", "1", "--until-direct=false", &ip.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Poll until `probe` succeeds or `timeout` elapses.
pub(crate) async fn wait_for<F, Fut>(timeout: Duration, poll: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(poll).await;
    }
}

/// Block until the peer is reachable again, bounded by `timeout`. Used
/// by the recovery path to wait out a backend restart on either host.
pub async fn wait_until_peer_is_online(ip: Ipv4Addr, timeout: Duration) -> bool {
    wait_for(timeout, POLL_INTERVAL, || probe_once(ip)).await
}

fn parse_endpoint(output: &str) -> Option<(Ipv4Addr, u16)> {
    let token = output.split_whitespace().rev().nth(2)?;
    let (addr, port) = token.rsplit_once(':')?;
    Some((addr.parse().ok()?, port.parse().ok()?))
}

/// Discover the direct address:port the peer is reachable at. An
/// offline peer, or a peer that answers the short probe but yields no
/// endpoint under the forced long probe, fails the session with the
/// distinguished reachability status.
pub async fn peer_endpoint(ip: Ipv4Addr) -> Result<(Ipv4Addr, u16)> {
    check_running().await?;
    let peer_name = match Session::current() {
        Some(session) => session.peer_name().await?,
        None => peer_name(ip).await?,
    };
    send_info(
        format!("Checking that an endpoint is available for peer '{peer_name}' ({ip})..."),
        None,
    )
    .await;
    if !peer_is_online(ip).await {
        return ErrorReport::new(ErrorCode::Unreachable)
            .local(format!("Error: Peer '{peer_name}' ({ip}) is offline"))
            .fail()
            .await;
    }
    let forced = tailscale_output(&["ping", "-c", "30", &ip.to_string()]).await?;
    if !forced.status.success() {
        return ErrorReport::new(ErrorCode::Unreachable)
            .local(format!(
                "Sorry, it was impossible to find a public endpoint for peer '{peer_name}' ({ip})"
            ))
            .fail()
            .await;
    }
    send_info(format!("Peer '{peer_name}' ({ip}) is reachable"), None).await;
    parse_endpoint(&String::from_utf8_lossy(&forced.stdout))
        .context("failed to parse an endpoint from tailscale ping output")
}

fn first_port(line: &str) -> Option<u16> {
    let mut rest = line;
    while let Some(idx) = rest.find(':') {
        rest = &rest[idx + 1..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if !digits.is_empty() {
            return digits.parse().ok();
        }
    }
    None
}

fn tailscale_ports(output: &str) -> Vec<u16> {
    output
        .lines()
        .filter(|line| line.contains("tailscale"))
        .filter_map(first_port)
        .collect()
}

/// Local UDP port the backend's own transport listens on. Requires
/// root; retried while the backend shows more than one candidate.
pub async fn local_port() -> Result<u16> {
    check_running().await?;
    if !Uid::effective().is_root() {
        return ErrorReport::new(ErrorCode::Generic)
            .local(messages::SUDO)
            .fail()
            .await;
    }
    loop {
        let output = Command::new("ss")
            .args(["-lunp4"])
            .output()
            .await
            .context("failed to run ss")?;
        let ports = tailscale_ports(&String::from_utf8_lossy(&output.stdout));
        match ports.as_slice() {
            [port] => return Ok(*port),
            [] => {
                return ErrorReport::new(ErrorCode::Generic)
                    .local(messages::TS_NO_PORT)
                    .fail()
                    .await;
            }
            _ => sleep(POLL_INTERVAL).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_dns_suffix() {
        assert_eq!(
            strip_dns_suffix("hosta.tail1234.ts.net.", "tail1234.ts.net"),
            "hosta"
        );
        assert_eq!(strip_dns_suffix("bare-host", "tail1234.ts.net"), "bare-host");
    }

    #[test]
    fn test_parse_status_fixture() {
        let fixture = r#"{
            "BackendState": "Running",
            "MagicDNSSuffix": "tail1234.ts.net",
            "Self": {"DNSName": "hosta.tail1234.ts.net.", "Online": true, "TailscaleIPs": ["100.64.0.1"]},
            "Peer": {
                "nodekey:aa": {"DNSName": "peerb.tail1234.ts.net.", "Online": true, "TailscaleIPs": ["100.64.0.2"]}
            }
        }"#;
        let status: Status = serde_json::from_str(fixture).unwrap();
        assert_eq!(status.backend_state, "Running");
        assert_eq!(status.peer["nodekey:aa"].dns_name, "peerb.tail1234.ts.net.");
        assert!(status.self_node.unwrap().online);
    }

    #[test]
    fn test_parse_endpoint_from_forced_ping() {
        let out = "pong from peerb (100.64.0.2) via 203.0.113.5:41641 in 23ms\n";
        assert_eq!(
            parse_endpoint(out),
            Some(("203.0.113.5".parse().unwrap(), 41641))
        );
        assert_eq!(parse_endpoint(""), None);
    }

    #[test]
    fn test_tailscale_ports_from_ss_output() {
        let out = "\
State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process\n\
UNCONN 0      0            0.0.0.0:41641     0.0.0.0:*     users:((\"tailscaled\",pid=618,fd=12))\n\
UNCONN 0      0            0.0.0.0:5353      0.0.0.0:*     users:((\"avahi-daemon\",pid=400,fd=10))\n";
        assert_eq!(tailscale_ports(out), vec![41641]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_gives_up_after_timeout() {
        let ok = wait_for(Duration::from_secs(45), POLL_INTERVAL, || async { false }).await;
        assert!(!ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_succeeds_once_probe_recovers() {
        let mut remaining_failures: i32 = 5;
        let started = Instant::now();
        let ok = wait_for(Duration::from_secs(45), POLL_INTERVAL, || {
            let up = remaining_failures == 0;
            remaining_failures = remaining_failures.saturating_sub(1);
            async move { up }
        })
        .await;
        assert!(ok);
        assert!(started.elapsed() >= POLL_INTERVAL * 5);
    }
}
