//! WireGuard tunnel configuration.
//!
//! Parses the template the operator keeps under /etc/wirelift, merges
//! the parameters negotiated with the peer, writes the runtime config
//! the tunnel is brought up from, and drives `wg-quick` itself. The
//! template is INI-style with case-insensitive, repeatable keys, the
//! way wg-quick accepts it.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::locker;
use crate::messages::{self, send_info};
use crate::tailscale;

/// The tunnel bring-up sequence stops tailscaled while wg-quick runs,
/// so only one may be in flight per host at a time.
static TUNNEL_GATE: Mutex<()> = Mutex::const_new(());

/// A parsed INI document preserving repeated keys in order.
struct IniDoc {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl IniDoc {
    fn parse(text: &str) -> Result<IniDoc> {
        let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .ok_or_else(|| anyhow!("line {}: malformed section header", index + 1))?;
                sections.push((name.trim().to_string(), Vec::new()));
            } else {
                let (key, value) = line
                    .split_once('=')
                    .ok_or_else(|| anyhow!("line {}: expected 'key = value'", index + 1))?;
                let section = sections
                    .last_mut()
                    .ok_or_else(|| anyhow!("line {}: entry outside of any section", index + 1))?;
                section
                    .1
                    .push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        Ok(IniDoc { sections })
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.get_all(section, key).into_iter().next()
    }

    fn get_all(&self, section: &str, key: &str) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(section))
            .flat_map(|(_, entries)| entries.iter())
            .filter(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
            .collect()
    }
}

/// An address block in CIDR notation. A bare address is the /32 (or
/// /128) network of itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpNet {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpNet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.trim().parse().context("invalid network address")?;
                let prefix: u8 = prefix.trim().parse().context("invalid network prefix")?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = s.trim().parse().context("invalid network address")?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                (addr, prefix)
            }
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            bail!("network prefix /{prefix} is out of range for {addr}");
        }
        Ok(IpNet { addr, prefix })
    }
}

/// A WireGuard key: 32 raw bytes in standard base64.
pub fn valid_key(key: &str) -> bool {
    BASE64.decode(key).map(|b| b.len() == 32).unwrap_or(false)
}

pub fn valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_=+.-".contains(c))
}

/// Why a template could not be turned into a usable configuration.
/// Distinguished so failures map to the right report on each role.
#[derive(Debug)]
pub enum ConfigIssue {
    MissingAddress,
    MissingAllowedIps,
    BadPrivateKey,
    BadPublicKey,
    BadPsk,
    Other(anyhow::Error),
}

/// The tunnel configuration for one negotiation: the operator's
/// template plus everything learned from the control plane and the
/// peer.
pub struct WgConfig {
    pub file_path: PathBuf,
    pub interface: String,
    pub autoremove: bool,
    /// Local tunnel addresses, parsed from the template's Address lines.
    pub addresses: BTreeSet<IpAddr>,
    /// Peer tunnel addresses, merged from the negotiation.
    pub remote_addresses: BTreeSet<IpAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub private_key: String,
    pub public_key: String,
    pub remote_pubkey: Option<String>,
    pub psk: String,
    pub has_psk: bool,
    pub listen_port: Option<u16>,
    pub endpoint: Option<(Ipv4Addr, u16)>,
    /// Second-of-minute stamp both hosts use to desynchronize their
    /// idle-teardown watchdogs.
    pub start_time: u32,
    pub keepalive_secs: u64,
    /// Tailscale address of the peer, for the watchdog unit.
    pub peer_ip: Option<Ipv4Addr>,
    pub is_remote: bool,
    pub runtime_dir: PathBuf,
    address_lines: Vec<String>,
    dns_lines: Vec<String>,
    allowed_ips_lines: Vec<String>,
    pre_up: Vec<String>,
    post_up: Vec<String>,
    pre_down: Vec<String>,
    post_down: Vec<String>,
    table: Option<String>,
    mtu: Option<String>,
    fwmark: Option<String>,
}

impl WgConfig {
    /// Read and validate a template. Missing keys are generated with
    /// the `wg` tool, exactly like a fresh wg-quick setup would.
    pub async fn load(path: &Path, runtime_dir: &Path) -> Result<WgConfig, ConfigIssue> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))
            .map_err(ConfigIssue::Other)?;
        let doc = IniDoc::parse(&text).map_err(ConfigIssue::Other)?;

        let address_lines: Vec<String> = doc
            .get_all("Interface", "Address")
            .into_iter()
            .map(str::to_string)
            .collect();
        if address_lines.is_empty() {
            return Err(ConfigIssue::MissingAddress);
        }
        let mut addresses = BTreeSet::new();
        for token in split_value_list(&address_lines) {
            let net: IpNet = token.parse().map_err(ConfigIssue::Other)?;
            addresses.insert(net.addr);
        }

        let allowed_ips_lines: Vec<String> = doc
            .get_all("Peer", "AllowedIPs")
            .into_iter()
            .map(str::to_string)
            .collect();
        if allowed_ips_lines.is_empty() {
            return Err(ConfigIssue::MissingAllowedIps);
        }
        let mut allowed_ips = Vec::new();
        for token in split_value_list(&allowed_ips_lines) {
            allowed_ips.push(token.parse().map_err(ConfigIssue::Other)?);
        }

        let remote_pubkey = match doc.get("Peer", "PublicKey") {
            Some(key) if !valid_key(key) => return Err(ConfigIssue::BadPublicKey),
            Some(key) => Some(key.to_string()),
            None => None,
        };
        let (psk, has_psk) = match doc.get("Peer", "PresharedKey") {
            Some(key) if !valid_key(key) => return Err(ConfigIssue::BadPsk),
            Some(key) => (key.to_string(), true),
            None => (generate_psk().await.map_err(ConfigIssue::Other)?, false),
        };
        let private_key = match doc.get("Interface", "PrivateKey") {
            Some(key) if !valid_key(key) => return Err(ConfigIssue::BadPrivateKey),
            Some(key) => key.to_string(),
            None => generate_private_key().await.map_err(ConfigIssue::Other)?,
        };
        let public_key = derive_public_key(&private_key)
            .await
            .map_err(ConfigIssue::Other)?;

        Ok(WgConfig {
            file_path: path.to_path_buf(),
            interface: String::new(),
            autoremove: false,
            addresses,
            remote_addresses: BTreeSet::new(),
            allowed_ips,
            private_key,
            public_key,
            remote_pubkey,
            psk,
            has_psk,
            listen_port: None,
            endpoint: None,
            start_time: second_of_minute(),
            keepalive_secs: 10,
            peer_ip: None,
            is_remote: false,
            runtime_dir: runtime_dir.to_path_buf(),
            address_lines,
            dns_lines: doc
                .get_all("Interface", "DNS")
                .into_iter()
                .map(str::to_string)
                .collect(),
            allowed_ips_lines,
            pre_up: doc
                .get_all("Interface", "PreUp")
                .into_iter()
                .map(str::to_string)
                .collect(),
            post_up: doc
                .get_all("Interface", "PostUp")
                .into_iter()
                .map(str::to_string)
                .collect(),
            pre_down: doc
                .get_all("Interface", "PreDown")
                .into_iter()
                .map(str::to_string)
                .collect(),
            post_down: doc
                .get_all("Interface", "PostDown")
                .into_iter()
                .map(str::to_string)
                .collect(),
            table: doc.get("Interface", "Table").map(str::to_string),
            mtu: doc.get("Interface", "MTU").map(str::to_string),
            fwmark: doc.get("Interface", "FwMark").map(str::to_string),
        })
    }

    pub fn ip_is_allowed(&self, ip: &IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(ip))
    }

    /// Path of the generated runtime configuration.
    pub fn runfile(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.conf", self.interface))
    }

    /// Write the runtime configuration the interface is brought up
    /// from: the template enriched with the negotiated peer parameters,
    /// firewall bookkeeping, the first-handshake wait and, when
    /// requested, the idle-teardown unit launch.
    pub fn generate_new_config(&self) -> Result<PathBuf> {
        let listen_port = self
            .listen_port
            .context("listen port has not been resolved")?;
        let (endpoint_ip, endpoint_port) =
            self.endpoint.context("peer endpoint has not been resolved")?;
        let remote_pubkey = self
            .remote_pubkey
            .as_deref()
            .context("remote public key has not been negotiated")?;
        if self.interface.is_empty() {
            bail!("interface name has not been chosen");
        }

        let mut text = String::new();
        writeln!(text, "[Interface]")?;
        for line in &self.address_lines {
            writeln!(text, "Address = {line}")?;
        }
        for line in &self.dns_lines {
            writeln!(text, "DNS = {line}")?;
        }
        writeln!(text, "ListenPort = {listen_port}")?;
        writeln!(text, "PrivateKey = {}", self.private_key)?;
        if let Some(table) = &self.table {
            writeln!(text, "Table = {table}")?;
        }
        if let Some(mtu) = &self.mtu {
            writeln!(text, "MTU = {mtu}")?;
        }
        if let Some(fwmark) = &self.fwmark {
            writeln!(text, "FwMark = {fwmark}")?;
        }
        writeln!(
            text,
            "PreUp = iptables -I INPUT -p udp --dport {listen_port} -j ACCEPT"
        )?;
        writeln!(text, "PreUp = iptables -I INPUT -i %i -j ACCEPT")?;
        for line in &self.pre_up {
            writeln!(text, "PreUp = {line}")?;
        }
        writeln!(text, "PostUp = {}", first_handshake_script(remote_pubkey))?;
        if self.autoremove {
            writeln!(text, "PostUp = {}", self.autoremove_script()?)?;
        }
        for line in &self.post_up {
            writeln!(text, "PostUp = {line}")?;
        }
        for line in &self.pre_down {
            writeln!(text, "PreDown = {line}")?;
        }
        writeln!(
            text,
            "PostDown = iptables -D INPUT -p udp --dport {listen_port} -j ACCEPT"
        )?;
        writeln!(text, "PostDown = iptables -D INPUT -i %i -j ACCEPT")?;
        for line in &self.post_down {
            writeln!(text, "PostDown = {line}")?;
        }
        writeln!(text, "PostDown = rm -f {}", self.runfile().display())?;
        writeln!(text)?;
        writeln!(text, "[Peer]")?;
        writeln!(text, "PublicKey = {remote_pubkey}")?;
        writeln!(text, "PresharedKey = {}", self.psk)?;
        writeln!(text, "Endpoint = {endpoint_ip}:{endpoint_port}")?;
        writeln!(text, "PersistentKeepalive = {}", self.keepalive_secs)?;
        for line in &self.allowed_ips_lines {
            writeln!(text, "AllowedIPs = {line}")?;
        }

        let runfile = self.runfile();
        fs::create_dir_all(&self.runtime_dir)
            .with_context(|| format!("failed to create {}", self.runtime_dir.display()))?;
        fs::write(&runfile, text)
            .with_context(|| format!("failed to write {}", runfile.display()))?;
        Ok(runfile)
    }

    fn autoremove_script(&self) -> Result<String> {
        let peer_ip = self
            .peer_ip
            .context("peer address has not been recorded for autoremove")?;
        let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("wirelift"));
        Ok(format!(
            "echo -n \"Launching autoremove subprocess. \"; \
             systemd-run -u autoremove-%i {} autoremove %i {} {} {}",
            exe.display(),
            peer_ip,
            u8::from(self.is_remote),
            self.start_time,
        ))
    }

    /// Bring the tunnel interface up. Tailscaled is stopped for the
    /// duration so wg-quick can take over the port, and restarted no
    /// matter how wg-quick fared; the whole sequence holds the
    /// host-wide lock.
    pub async fn upgrade(&self) -> Result<UpgradeOutput> {
        let runfile = self.runfile();
        let _gate = TUNNEL_GATE.lock().await;
        let _lock = locker::lock(&self.runtime_dir).await?;
        tailscale::stop().await?;
        let output = Command::new("wg-quick")
            .args(["up", &runfile.display().to_string()])
            .output()
            .await
            .context("failed to run wg-quick");
        tailscale::start().await?;
        let output = output?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let status = output.status.code().unwrap_or(1);
        if status == 0 {
            for line in combined.lines() {
                if line.to_lowercase().contains("running as unit") {
                    send_info(line, None).await;
                }
            }
            println!("{}", messages::success_text(&self.interface));
        } else {
            if let Err(e) = fs::remove_file(&runfile) {
                debug!("failed to remove {}: {e}", runfile.display());
            }
            eprintln!("{}", messages::FINAL_ERROR);
        }
        Ok(UpgradeOutput {
            status,
            output: combined,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> WgConfig {
        WgConfig {
            file_path: PathBuf::from("/etc/wirelift/peer.conf"),
            interface: "peer".to_string(),
            autoremove: false,
            addresses: BTreeSet::from([IpAddr::from([10, 11, 0, 1])]),
            remote_addresses: BTreeSet::new(),
            allowed_ips: vec!["10.11.0.0/24".parse().unwrap()],
            private_key: BASE64.encode([1u8; 32]),
            public_key: BASE64.encode([2u8; 32]),
            remote_pubkey: Some(BASE64.encode([3u8; 32])),
            psk: BASE64.encode([4u8; 32]),
            has_psk: false,
            listen_port: Some(41641),
            endpoint: Some((Ipv4Addr::new(203, 0, 113, 5), 41641)),
            start_time: 33,
            keepalive_secs: 10,
            peer_ip: Some(Ipv4Addr::new(100, 64, 0, 2)),
            is_remote: false,
            runtime_dir: std::env::temp_dir(),
            address_lines: vec!["10.11.0.1/24".to_string()],
            dns_lines: Vec::new(),
            allowed_ips_lines: vec!["10.11.0.0/24".to_string()],
            pre_up: Vec::new(),
            post_up: Vec::new(),
            pre_down: Vec::new(),
            post_down: Vec::new(),
            table: None,
            mtu: None,
            fwmark: None,
        }
    }
}

/// Outcome of the tunnel-up tool: its exit status and combined output.
pub struct UpgradeOutput {
    pub status: i32,
    pub output: String,
}

impl UpgradeOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

fn split_value_list(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .flat_map(|line| line.split([',', ' ']))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn second_of_minute() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (secs % 60) as u32
}

fn first_handshake_script(remote_pubkey: &str) -> String {
    format!(
        "/bin/sh -c 'count=0; while [ $count -le 10 ]; do \
         handshake=$(wg show %i latest-handshakes | \
         awk -v pubkey=\"{remote_pubkey}\" '\\''$1 == pubkey {{print $2}}'\\''); \
         if [ $handshake -eq 0 ]; then sleep 0.5; count=$((count+1)); \
         else exit 0; fi; done; exit 1'"
    )
}

async fn run_wg(args: &[&str], stdin: Option<&str>) -> Result<String> {
    let mut command = Command::new("wg");
    command.args(args).stdout(Stdio::piped());
    if stdin.is_some() {
        command.stdin(Stdio::piped());
    }
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to run wg {}", args.join(" ")))?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .context("failed to write to wg stdin")?;
        drop(pipe);
    }
    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to run wg {}", args.join(" ")))?;
    if !output.status.success() {
        bail!("wg {} failed", args.join(" "));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn generate_private_key() -> Result<String> {
    run_wg(&["genkey"], None).await
}

async fn generate_psk() -> Result<String> {
    run_wg(&["genpsk"], None).await
}

async fn derive_public_key(private_key: &str) -> Result<String> {
    run_wg(&["pubkey"], Some(private_key)).await
}

/// Newest handshake stamp of an interface, from
/// `wg show <interface> latest-handshakes`. Zero when no handshake has
/// completed yet.
pub async fn latest_handshake(interface: &str) -> Result<u64> {
    let output = Command::new("wg")
        .args(["show", interface, "latest-handshakes"])
        .output()
        .await
        .context("failed to run wg show")?;
    if !output.status.success() {
        bail!("no WireGuard interface '{interface}'");
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .filter_map(|token| token.parse::<u64>().ok())
        .max()
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "\
# wirelift template for peerB\n\
[Interface]\n\
Address = 10.11.0.1/24\n\
address = fd7a:115c::1/64\n\
PrivateKey = AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=\n\
PostUp = echo up\n\
\n\
[Peer]\n\
PublicKey = Hh4eHh4eHh4eHh4eHh4eHh4eHh4eHh4eHh4eHh4eHh4=\n\
AllowedIPs = 10.11.0.0/24, fd7a:115c::/64\n";

    #[test]
    fn test_ini_repeatable_case_insensitive_keys() {
        let doc = IniDoc::parse(TEMPLATE).unwrap();
        assert_eq!(doc.get_all("interface", "ADDRESS").len(), 2);
        assert_eq!(doc.get("peer", "publickey").unwrap().len(), 44);
        assert!(doc.get("Interface", "MTU").is_none());
    }

    #[test]
    fn test_ini_rejects_entries_outside_sections() {
        assert!(IniDoc::parse("Address = 10.0.0.1/24\n").is_err());
    }

    #[test]
    fn test_ipnet_contains() {
        let net: IpNet = "10.11.0.0/24".parse().unwrap();
        assert!(net.contains(&"10.11.0.7".parse().unwrap()));
        assert!(!net.contains(&"10.12.0.7".parse().unwrap()));
        assert!(!net.contains(&"fd7a:115c::1".parse().unwrap()));

        let net6: IpNet = "fd7a:115c::/64".parse().unwrap();
        assert!(net6.contains(&"fd7a:115c::42".parse().unwrap()));

        let bare: IpNet = "10.11.0.7".parse().unwrap();
        assert_eq!(bare.prefix, 32);
        assert!("10.11.0.0/33".parse::<IpNet>().is_err());
    }

    #[test]
    fn test_valid_key() {
        assert!(valid_key(&BASE64.encode([9u8; 32])));
        assert!(!valid_key("not-base64!"));
        assert!(!valid_key(&BASE64.encode([9u8; 16])));
    }

    #[test]
    fn test_valid_interface_name() {
        assert!(valid_interface_name("peerA"));
        assert!(valid_interface_name("wg_0.vpn-x"));
        assert!(!valid_interface_name(""));
        assert!(!valid_interface_name("a-name-that-is-too-long"));
        assert!(!valid_interface_name("bad name"));
    }

    #[tokio::test]
    async fn test_load_reports_missing_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.conf");
        fs::write(&path, "[Interface]\n[Peer]\nAllowedIPs = 10.0.0.0/24\n").unwrap();
        assert!(matches!(
            WgConfig::load(&path, dir.path()).await,
            Err(ConfigIssue::MissingAddress)
        ));
    }

    #[tokio::test]
    async fn test_load_reports_missing_allowed_ips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.conf");
        fs::write(&path, "[Interface]\nAddress = 10.0.0.1/24\n[Peer]\n").unwrap();
        assert!(matches!(
            WgConfig::load(&path, dir.path()).await,
            Err(ConfigIssue::MissingAllowedIps)
        ));
    }

    #[tokio::test]
    async fn test_load_reports_malformed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.conf");
        fs::write(
            &path,
            "[Interface]\nAddress = 10.0.0.1/24\n[Peer]\nAllowedIPs = 10.0.0.0/24\nPublicKey = short\n",
        )
        .unwrap();
        assert!(matches!(
            WgConfig::load(&path, dir.path()).await,
            Err(ConfigIssue::BadPublicKey)
        ));

        fs::write(
            &path,
            "[Interface]\nAddress = 10.0.0.1/24\n[Peer]\nAllowedIPs = 10.0.0.0/24\nPresharedKey = short\n",
        )
        .unwrap();
        assert!(matches!(
            WgConfig::load(&path, dir.path()).await,
            Err(ConfigIssue::BadPsk)
        ));
    }

    #[test]
    fn test_generate_new_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = WgConfig::for_tests();
        cfg.runtime_dir = dir.path().to_path_buf();
        cfg.interface = "peerB".to_string();
        cfg.autoremove = true;
        cfg.remote_addresses = BTreeSet::from([IpAddr::from([10, 11, 0, 2])]);

        let runfile = cfg.generate_new_config().unwrap();
        assert_eq!(runfile, dir.path().join("peerB.conf"));
        let text = fs::read_to_string(&runfile).unwrap();
        assert!(text.contains("ListenPort = 41641"));
        assert!(text.contains("Endpoint = 203.0.113.5:41641"));
        assert!(text.contains("PersistentKeepalive = 10"));
        assert!(text.contains("AllowedIPs = 10.11.0.0/24"));
        assert!(text.contains(&format!("PresharedKey = {}", cfg.psk)));
        assert!(text.contains("systemd-run -u autoremove-%i"));
        assert!(text.contains(&format!("PostDown = rm -f {}", runfile.display())));
        // Firewall bookkeeping is symmetric.
        assert!(text.contains("PreUp = iptables -I INPUT -i %i -j ACCEPT"));
        assert!(text.contains("PostDown = iptables -D INPUT -i %i -j ACCEPT"));
    }

    #[test]
    fn test_generate_requires_negotiated_state() {
        let mut cfg = WgConfig::for_tests();
        cfg.remote_pubkey = None;
        assert!(cfg.generate_new_config().is_err());
    }
}
