//! The upgrade state machine, run with role inversion on both hosts.
//!
//! The initiator resolves the peer's endpoint, opens the network
//! channel and drives UPGRADE -> UPGRADE_RESPONSE -> UPGRADE_GO; the
//! responder validates the claimed configuration against its own
//! record for that peer before answering. Every fatal condition is
//! converted at its detection point into a report against the right
//! channels.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use log::debug;
use tokio::net::TcpStream;

use crate::channel::Channel;
use crate::config::Settings;
use crate::locker;
use crate::messages::{send_info, ActionCode, ErrorCode, ErrorReport, Message, SessionExit};
use crate::session::Session;
use crate::tailscale;
use crate::wgconfig::{ConfigIssue, WgConfig};

pub fn interface_exists(name: &str) -> bool {
    nix::net::if_::if_nametoindex(name).is_ok()
}

/// First free interface name: the requested one, or the first numeric
/// suffix that is not taken.
pub fn next_interface_with_suffix(name: &str) -> String {
    if !interface_exists(name) {
        return name.to_string();
    }
    let mut counter = 1;
    loop {
        let candidate = format!("{name}{counter}");
        if !interface_exists(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Resolve the interface name a session will use. An existing name is
/// fatal when suffixing is disabled, on either role.
pub async fn check_interface(session: &Session, interface: &str, suffix: bool) -> Result<String> {
    if !suffix && interface_exists(interface) {
        let local = format!(
            "Error: A network interface '{interface}' already exists and Wirelift was started \
             with the --no-suffix option"
        );
        let report = ErrorReport::new(ErrorCode::InterfaceExists).local(local);
        let report = if session.running_in_remote {
            report.remote(format!(
                "Error: A network interface '{interface}' already exists on peer '{}' ({}) and \
                 its Wirelift was started with the --no-suffix option",
                session.my_name().await?,
                session.my_ip
            ))
        } else {
            report
        };
        return report.fail().await;
    }
    Ok(next_interface_with_suffix(interface))
}

pub async fn check_config_path(session: &Session, config: &Path) -> Result<PathBuf> {
    let problem = if !config.exists() {
        Some(format!("path '{}' does not exist", config.display()))
    } else if !config.is_file() {
        Some(format!("path '{}' is not a regular file", config.display()))
    } else {
        None
    };
    let Some(local) = problem else {
        return Ok(config.to_path_buf());
    };
    let report = ErrorReport::new(ErrorCode::ConfigPathError).local(local);
    let report = if session.running_in_remote {
        report.remote(format!(
            "Error: Remote peer '{}' ({}) cannot locate a configuration file for '{}'",
            session.my_name().await?,
            session.my_ip,
            session.peer_name().await?
        ))
    } else {
        report
    };
    report.fail().await
}

pub async fn check_wgconfig(
    session: &Session,
    config: &Path,
    runtime_dir: &Path,
) -> Result<WgConfig> {
    let issue = match WgConfig::load(config, runtime_dir).await {
        Ok(cfg) => return Ok(cfg),
        Err(issue) => issue,
    };
    let file = config.display();
    let local = match &issue {
        ConfigIssue::MissingAddress => {
            format!("Error: 'Address' option missing in 'Interface' section of file '{file}'")
        }
        ConfigIssue::MissingAllowedIps => {
            format!("Error: 'AllowedIPs' option missing in 'Peer' section of file '{file}'")
        }
        ConfigIssue::BadPrivateKey => {
            format!("Error: The private key has not the correct length or format in file '{file}'")
        }
        ConfigIssue::BadPublicKey => {
            format!("Error: The public key has not the correct length or format in file '{file}'")
        }
        ConfigIssue::BadPsk => format!(
            "Error: The pre-shared key has not the correct length or format in file '{file}'"
        ),
        ConfigIssue::Other(e) => format!("Error: {e:#}"),
    };
    let report = ErrorReport::new(ErrorCode::ConfigError).local(local);
    let report = if session.running_in_remote {
        let my_name = session.my_name().await?;
        let peer_name = session.peer_name().await?;
        let my_ip = session.my_ip;
        let remote = match &issue {
            ConfigIssue::MissingAddress => format!(
                "Error: 'Address' option missing in remote peer '{my_name}' ({my_ip}) \
                 configuration file for '{peer_name}'"
            ),
            ConfigIssue::MissingAllowedIps => format!(
                "Error: 'AllowedIPs' option missing in remote peer '{my_name}' ({my_ip}) \
                 configuration file for '{peer_name}'"
            ),
            ConfigIssue::BadPrivateKey => format!(
                "Error: The private key has not the correct length or format in remote peer \
                 '{my_name}' ({my_ip}) configuration file for '{peer_name}'"
            ),
            ConfigIssue::BadPublicKey => format!(
                "Error: The public key has not the correct length or format in remote peer \
                 '{my_name}' ({my_ip}) configuration file for '{peer_name}'"
            ),
            ConfigIssue::BadPsk => format!(
                "Error: The pre-shared key has not the correct length or format in remote peer \
                 '{my_name}' ({my_ip}) configuration file for '{peer_name}'"
            ),
            ConfigIssue::Other(_) => format!(
                "Error: Remote peer '{my_name}' ({my_ip}) has a syntax error in its \
                 configuration file for '{peer_name}'"
            ),
        };
        report.remote(remote)
    } else {
        report
    };
    report.fail().await
}

/// Public-key consistency in both directions: the key the peer sent
/// must match our record for it, and the key the peer has on record for
/// us must match ours. A mismatch is fatal and reported to both sides.
pub async fn match_pubkeys(
    session: &Session,
    cfg: &mut WgConfig,
    remote_pubkey: &str,
    my_pubkey: Option<&str>,
) -> Result<()> {
    // None = consistent, Some(true) = peer sent a key inconsistent with
    // our record, Some(false) = peer's record of our key is stale.
    let mut peer_is_sender = None;
    match &cfg.remote_pubkey {
        Some(recorded) if recorded != remote_pubkey => peer_is_sender = Some(true),
        _ => cfg.remote_pubkey = Some(remote_pubkey.to_string()),
    }
    if let Some(expected) = my_pubkey {
        if cfg.public_key != expected {
            peer_is_sender = Some(false);
        }
    }
    let Some(peer_is_sender) = peer_is_sender else {
        return Ok(());
    };
    let my_name = session.my_name().await?;
    let peer_name = session.peer_name().await?;
    let (sender_name, sender_ip, receiver_name, receiver_ip) = if peer_is_sender {
        (peer_name, session.peer_ip, my_name, session.my_ip)
    } else {
        (my_name, session.my_ip, peer_name, session.peer_ip)
    };
    let text = format!(
        "Error: The public key provided by '{sender_name}' ({sender_ip}) is inconsistent with \
         the one that '{receiver_name}' ({receiver_ip}) has on record for this peer."
    );
    ErrorReport::new(ErrorCode::PubkeyMismatch)
        .local(text.clone())
        .remote(text)
        .exit(1)
        .send()
        .await
}

/// Pre-shared-key consistency in both directions. When neither side
/// had one configured, the responder adopts the key the initiator
/// generated and sent.
pub async fn match_psk(
    session: &Session,
    cfg: &mut WgConfig,
    remote_has_psk: bool,
    remote_psk: Option<String>,
) -> Result<()> {
    if cfg.has_psk != remote_has_psk {
        let my_name = session.my_name().await?;
        let peer_name = session.peer_name().await?;
        let (with_name, with_ip, without_name, without_ip) = if cfg.has_psk {
            (my_name, session.my_ip, peer_name, session.peer_ip)
        } else {
            (peer_name, session.peer_ip, my_name, session.my_ip)
        };
        let text = format!(
            "Error: Peer '{without_name}' ({without_ip}) does not have a pre-shared key for \
             '{with_name}' ({with_ip}), but '{with_name}' has one configured for \
             '{without_name}'. Ensure key consistency."
        );
        return ErrorReport::new(ErrorCode::PskMismatch)
            .local(text.clone())
            .remote(text)
            .exit(1)
            .send()
            .await;
    }
    if !cfg.has_psk {
        if let Some(psk) = remote_psk {
            cfg.psk = psk;
        }
    }
    Ok(())
}

/// Every address the peer advertises must be covered by our AllowedIPs,
/// or traffic for it would never enter the tunnel.
pub async fn check_addresses_in_allowedips(session: &Session, cfg: &WgConfig) -> Result<()> {
    if cfg.remote_addresses.iter().all(|ip| cfg.ip_is_allowed(ip)) {
        return Ok(());
    }
    let text = format!(
        "Error: IPs from the 'Address' field of '{}' ({}) are not fully covered in the \
         'AllowedIPs' field of '{}' ({})",
        session.peer_name().await?,
        session.peer_ip,
        session.my_name().await?,
        session.my_ip
    );
    ErrorReport::new(ErrorCode::AllowedIpsMismatch)
        .local(text.clone())
        .remote(text)
        .exit(1)
        .send()
        .await
}

async fn malformed(session: &Session, what: &str) -> Result<()> {
    let text = format!("Error: The negotiation message is missing {what}");
    let report = ErrorReport::new(ErrorCode::Generic).local(text.clone());
    let report = if session.running_in_remote {
        report.remote(text)
    } else {
        report
    };
    report.send().await
}

/// Initiator half of the network exchange: send UPGRADE, merge the
/// responder's answer into the local configuration, signal
/// UPGRADE_GO. The caller brings the interface up afterwards.
pub async fn initiate_exchange(session: &Session, cfg: &mut WgConfig) -> Result<()> {
    session.send_remote(&Message::upgrade(cfg)).await;
    loop {
        let Some(message) = session.recv_remote().await? else {
            return ErrorReport::new(ErrorCode::Generic)
                .local("Error: The remote peer closed the connection before the negotiation finished")
                .send()
                .await;
        };
        if message.error_code.is_some() {
            if let Some(text) = &message.error_message {
                eprintln!("{text}");
            }
            session.send_local(&message).await;
            session.close_channels().await;
            return Err(SessionExit(1).into());
        }
        match message.code {
            Some(ActionCode::Info) => {
                if let Some(text) = message.message {
                    send_info(text, None).await;
                }
            }
            Some(ActionCode::UpgradeResponse) => {
                let Some(pubkey) = message.pubkey.as_deref() else {
                    return malformed(session, "the responder's public key").await;
                };
                match_pubkeys(session, cfg, pubkey, None).await?;
                match message.addresses {
                    Some(addresses) if !addresses.is_empty() => {
                        cfg.remote_addresses = addresses.into_iter().collect();
                    }
                    _ => return malformed(session, "the responder's tunnel addresses").await,
                }
                check_addresses_in_allowedips(session, cfg).await?;
                if let Err(e) = cfg.generate_new_config() {
                    return ErrorReport::new(ErrorCode::Generic)
                        .local(format!("Error: {e:#}"))
                        .send()
                        .await;
                }
                session.send_remote(&Message::upgrade_go()).await;
                return Ok(());
            }
            other => debug!("ignoring unexpected message during upgrade: {other:?}"),
        }
    }
}

/// Responder half of the network exchange: validate the initiator's
/// claimed configuration against the local record, answer with
/// UPGRADE_RESPONSE and wait for UPGRADE_GO. The caller brings the
/// interface up afterwards.
pub async fn respond_exchange(
    session: &Session,
    cfg: &mut WgConfig,
    request: &Message,
) -> Result<()> {
    let Some(pubkey) = request.pubkey.as_deref() else {
        return malformed(session, "the initiator's public key").await;
    };
    let Some(remote_has_psk) = request.has_psk else {
        return malformed(session, "the pre-shared-key flag").await;
    };
    match &request.addresses {
        Some(addresses) if !addresses.is_empty() => {
            cfg.remote_addresses = addresses.iter().copied().collect();
        }
        _ => return malformed(session, "the initiator's tunnel addresses").await,
    }
    if let Some(start_time) = request.start_time {
        cfg.start_time = start_time;
    }
    match_pubkeys(session, cfg, pubkey, request.remote_pubkey.as_deref()).await?;
    match_psk(session, cfg, remote_has_psk, request.psk.clone()).await?;
    check_addresses_in_allowedips(session, cfg).await?;
    if let Err(e) = cfg.generate_new_config() {
        return ErrorReport::new(ErrorCode::Generic)
            .local(format!("Error: {e:#}"))
            .remote("Error: Remote peer could not generate its runtime configuration")
            .send()
            .await;
    }
    session.send_remote(&Message::upgrade_response(cfg)).await;
    loop {
        let Some(message) = session.recv_remote().await? else {
            return ErrorReport::new(ErrorCode::Generic)
                .local("Error: The initiator closed the connection before sending the go-ahead")
                .send()
                .await;
        };
        if message.error_code.is_some() {
            if let Some(text) = &message.error_message {
                eprintln!("{text}");
            }
            session.close_channels().await;
            return Err(SessionExit(1).into());
        }
        match message.code {
            Some(ActionCode::UpgradeGo) => return Ok(()),
            other => debug!("ignoring unexpected message while awaiting go-ahead: {other:?}"),
        }
    }
}

/// Full initiator path for one worker: resolve everything the exchange
/// needs, run it, bring the interface up and report the outcome to the
/// local client.
pub async fn run_initiator(
    session: &Arc<Session>,
    request: &Message,
    settings: &Settings,
) -> Result<()> {
    let peer_name = session.peer_name().await?;
    let suffix = settings.upgrade.suffix && request.suffix.unwrap_or(true);
    let autoremove = settings.upgrade.autoremove && request.autoremove.unwrap_or(true);

    let requested = request.interface.clone().unwrap_or_else(|| peer_name.clone());
    let interface = check_interface(session, &requested, suffix).await?;
    let config_path = request
        .config
        .clone()
        .unwrap_or_else(|| settings.daemon.config_dir.join(format!("{peer_name}.conf")));
    let config_path = check_config_path(session, &config_path).await?;
    let mut cfg =
        check_wgconfig(session, &config_path, &settings.daemon.runtime_dir).await?;
    cfg.interface = interface;
    cfg.autoremove = autoremove;
    cfg.peer_ip = Some(session.peer_ip);
    cfg.is_remote = session.running_in_remote;
    cfg.keepalive_secs = settings.timing.keepalive_secs;
    cfg.listen_port = Some(tailscale::local_port().await?);
    {
        let _lock = locker::lock(&settings.daemon.runtime_dir).await?;
        cfg.endpoint = Some(tailscale::peer_endpoint(session.peer_ip).await?);
    }

    send_info(
        format!(
            "Enqueueing upgrade request to peer '{peer_name}' ({})...",
            session.peer_ip
        ),
        None,
    )
    .await;
    let stream = match TcpStream::connect((session.peer_ip, settings.daemon.tcp_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            return ErrorReport::new(ErrorCode::MissingDaemon)
                .local(format!(
                    "Error: Remote peer '{peer_name}' ({}) does not have Wirelift running ({e})",
                    session.peer_ip
                ))
                .send()
                .await;
        }
    };
    session.attach_remote(Channel::tcp(stream)).await;
    send_info(
        format!(
            "Starting to process the upgrade request for the peer '{peer_name}' ({})",
            session.peer_ip
        ),
        None,
    )
    .await;

    initiate_exchange(session, &mut cfg).await?;
    let outcome = match cfg.upgrade().await {
        Ok(outcome) => outcome,
        Err(e) => {
            let text = format!("Error: {e:#}");
            return ErrorReport::new(ErrorCode::FinalError)
                .local(text.clone())
                .remote_if_responder(text)
                .send()
                .await;
        }
    };
    session
        .send_local(&Message::upgrade_result(&outcome, &cfg.interface))
        .await;
    session.close_channels().await;
    if outcome.success() {
        Ok(())
    } else {
        Err(SessionExit(outcome.status).into())
    }
}

/// Full responder path for one worker, from an accepted UPGRADE to an
/// established tunnel or a reported failure.
pub async fn run_responder(
    session: &Arc<Session>,
    request: &Message,
    settings: &Settings,
) -> Result<()> {
    let peer_name = session.peer_name().await?;
    let my_name = session.my_name().await?;
    send_info(
        format!(
            "Starting to process the upgrade request coming from peer '{peer_name}' ({})",
            session.peer_ip
        ),
        Some(format!(
            "Remote peer '{my_name}' ({}) has started to process our upgrade request",
            session.my_ip
        )),
    )
    .await;

    let interface = check_interface(session, &peer_name, settings.upgrade.suffix).await?;
    let config_path = settings.daemon.config_dir.join(format!("{peer_name}.conf"));
    let config_path = check_config_path(session, &config_path).await?;
    let mut cfg =
        check_wgconfig(session, &config_path, &settings.daemon.runtime_dir).await?;
    cfg.interface = interface;
    cfg.autoremove = settings.upgrade.autoremove;
    cfg.peer_ip = Some(session.peer_ip);
    cfg.is_remote = session.running_in_remote;
    cfg.keepalive_secs = settings.timing.keepalive_secs;
    cfg.listen_port = Some(tailscale::local_port().await?);
    {
        let _lock = locker::lock(&settings.daemon.runtime_dir).await?;
        cfg.endpoint = Some(tailscale::peer_endpoint(session.peer_ip).await?);
    }

    respond_exchange(session, &mut cfg, request).await?;
    let outcome = match cfg.upgrade().await {
        Ok(outcome) => outcome,
        Err(e) => {
            let text = format!("Error: {e:#}");
            return ErrorReport::new(ErrorCode::FinalError)
                .local(text.clone())
                .remote_if_responder(text)
                .send()
                .await;
        }
    };
    session.close_channels().await;
    if outcome.success() {
        Ok(())
    } else {
        Err(SessionExit(outcome.status).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ActionCode, ErrorCode};
    use crate::session;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::collections::BTreeSet;
    use std::net::{IpAddr, Ipv4Addr};

    const CALLER: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 1);
    const RECEIVER: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 2);

    fn key(tag: u8) -> String {
        BASE64.encode([tag; 32])
    }

    fn side_config(runtime_dir: &Path, own_tag: u8, peer_tag: u8, own_last_octet: u8) -> WgConfig {
        let mut cfg = WgConfig::for_tests();
        cfg.runtime_dir = runtime_dir.to_path_buf();
        cfg.public_key = key(own_tag);
        cfg.private_key = key(own_tag + 100);
        cfg.remote_pubkey = Some(key(peer_tag));
        cfg.psk = key(own_tag + 200);
        cfg.has_psk = false;
        cfg.addresses = BTreeSet::from([IpAddr::from([10, 11, 0, own_last_octet])]);
        cfg
    }

    struct ScenarioOutcome {
        initiator: Result<()>,
        responder: Result<()>,
        responder_cfg: WgConfig,
        observer: Channel,
    }

    /// Run both halves of the network exchange against each other over
    /// in-memory channels, with an observer playing the local client.
    async fn run_exchange(mut init_cfg: WgConfig, resp_cfg: WgConfig) -> ScenarioOutcome {
        let (init_remote, resp_remote) = Channel::pair();
        let (local, observer) = Channel::pair();

        let init_session = Arc::new(Session::for_tests(
            CALLER, RECEIVER, CALLER, "hosta", "peerb",
        ));
        init_session.attach_local(local).await;
        init_session.attach_remote(init_remote).await;

        let resp_session = Arc::new(Session::for_tests(
            CALLER, RECEIVER, RECEIVER, "peerb", "hosta",
        ));

        let responder = tokio::spawn(async move {
            resp_session.attach_remote(resp_remote).await;
            let request = resp_session.recv_remote().await.unwrap().unwrap();
            assert_eq!(request.code, Some(ActionCode::Upgrade));
            let mut cfg = resp_cfg;
            let result = session::scope(resp_session.clone(), async {
                respond_exchange(&resp_session, &mut cfg, &request).await
            })
            .await;
            (result, cfg)
        });

        let initiator = session::scope(init_session.clone(), async {
            initiate_exchange(&init_session, &mut init_cfg).await
        })
        .await;
        let (responder, responder_cfg) = responder.await.unwrap();
        // The initiator reports its bring-up result out of band; make
        // sure the observer sees whatever was forwarded so far.
        init_session.close_channels().await;

        ScenarioOutcome {
            initiator,
            responder,
            responder_cfg,
            observer,
        }
    }

    #[tokio::test]
    async fn test_agreeing_configs_negotiate_end_to_end() {
        let init_dir = tempfile::tempdir().unwrap();
        let resp_dir = tempfile::tempdir().unwrap();
        let init_cfg = side_config(init_dir.path(), 1, 2, 1);
        let mut resp_cfg = side_config(resp_dir.path(), 2, 1, 2);
        resp_cfg.start_time = 7;

        let outcome = run_exchange(init_cfg, resp_cfg).await;
        outcome.initiator.unwrap();
        outcome.responder.unwrap();

        // The responder merged the initiator's addresses and adopted
        // its generated pre-shared key.
        assert_eq!(
            outcome.responder_cfg.remote_addresses,
            BTreeSet::from([IpAddr::from([10, 11, 0, 1])])
        );
        assert_eq!(outcome.responder_cfg.psk, key(201));
        assert_eq!(outcome.responder_cfg.start_time, 33);
        // Both runtime configurations were written.
        assert!(init_dir.path().join("peer.conf").exists());
        assert!(resp_dir.path().join("peer.conf").exists());
    }

    #[tokio::test]
    async fn test_success_result_reaches_the_local_client() {
        let (local, mut observer) = Channel::pair();
        let session = Arc::new(Session::for_tests(CALLER, RECEIVER, CALLER, "hosta", "peerb"));
        session.attach_local(local).await;

        let outcome = crate::wgconfig::UpgradeOutput {
            status: 0,
            output: String::new(),
        };
        session
            .send_local(&Message::upgrade_result(&outcome, "peerA"))
            .await;
        session.close_channels().await;

        let message = observer.recv().await.unwrap().unwrap();
        assert_eq!(message.code, Some(ActionCode::Success));
        assert_eq!(message.interface.as_deref(), Some("peerA"));
        assert!(observer.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uncovered_addresses_abort_both_sides() {
        let init_dir = tempfile::tempdir().unwrap();
        let resp_dir = tempfile::tempdir().unwrap();
        let init_cfg = side_config(init_dir.path(), 1, 2, 1);
        let mut resp_cfg = side_config(resp_dir.path(), 2, 1, 2);
        // The responder's record does not cover the initiator's 10.11.0.0/24.
        resp_cfg.allowed_ips = vec!["10.99.0.0/24".parse().unwrap()];

        let mut outcome = run_exchange(init_cfg, resp_cfg).await;
        let responder = outcome.responder.unwrap_err();
        assert_eq!(
            responder.downcast_ref::<SessionExit>(),
            Some(&SessionExit(1))
        );
        let initiator = outcome.initiator.unwrap_err();
        assert_eq!(
            initiator.downcast_ref::<SessionExit>(),
            Some(&SessionExit(1))
        );

        // No interface was touched: the responder never generated a
        // runtime config, and the error reached the local client.
        assert!(!resp_dir.path().join("peer.conf").exists());
        let forwarded = outcome.observer.recv().await.unwrap().unwrap();
        assert_eq!(forwarded.error_code, Some(ErrorCode::AllowedIpsMismatch));
    }

    #[tokio::test]
    async fn test_pubkey_mismatch_aborts_both_sides() {
        let init_dir = tempfile::tempdir().unwrap();
        let resp_dir = tempfile::tempdir().unwrap();
        let init_cfg = side_config(init_dir.path(), 1, 2, 1);
        let mut resp_cfg = side_config(resp_dir.path(), 2, 1, 2);
        // The responder has a different key on record for this peer.
        resp_cfg.remote_pubkey = Some(key(9));

        let mut outcome = run_exchange(init_cfg, resp_cfg).await;
        assert!(outcome.responder.is_err());
        assert!(outcome.initiator.is_err());
        let forwarded = outcome.observer.recv().await.unwrap().unwrap();
        assert_eq!(forwarded.error_code, Some(ErrorCode::PubkeyMismatch));
    }

    #[tokio::test]
    async fn test_psk_mismatch_aborts_the_negotiation() {
        let init_dir = tempfile::tempdir().unwrap();
        let resp_dir = tempfile::tempdir().unwrap();
        let init_cfg = side_config(init_dir.path(), 1, 2, 1);
        let mut resp_cfg = side_config(resp_dir.path(), 2, 1, 2);
        resp_cfg.has_psk = true;

        let outcome = run_exchange(init_cfg, resp_cfg).await;
        assert!(outcome.responder.is_err());
        assert!(outcome.initiator.is_err());
    }

    #[test]
    fn test_next_interface_with_suffix() {
        // The loopback interface always exists on Linux.
        assert_eq!(next_interface_with_suffix("lo"), "lo1");
        assert_eq!(
            next_interface_with_suffix("wirelift-none"),
            "wirelift-none"
        );
    }

    #[tokio::test]
    async fn test_existing_interface_is_fatal_without_suffix() {
        let session = Arc::new(Session::for_tests(CALLER, RECEIVER, CALLER, "hosta", "peerb"));
        let (local, mut observer) = Channel::pair();
        session.attach_local(local).await;

        let result = session::scope(session.clone(), async {
            check_interface(&session, "lo", false).await
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.downcast_ref::<SessionExit>(), Some(&SessionExit(1)));
        let forwarded = observer.recv().await.unwrap().unwrap();
        assert_eq!(forwarded.error_code, Some(ErrorCode::InterfaceExists));
    }
}
