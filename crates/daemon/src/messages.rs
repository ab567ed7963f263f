//! Wire message vocabulary and the two send sites.
//!
//! Every message is one JSON object per line, UTF-8, with the full field
//! set always present (absent values serialize as explicit `null`).
//! Receivers ignore unknown fields. A message carries either an action
//! code or an error code as its primary discriminant, never both.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::session::Session;
use crate::wgconfig::{UpgradeOutput, WgConfig};

/// Closed set of protocol actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionCode {
    Ack,
    Info,
    Stop,
    Success,
    Upgrade,
    UpgradeResponse,
    UpgradeGo,
    Recover,
}

/// Error codes carried by failure notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Closed,
    RemoteClosed,
    ConfigPathError,
    ConfigError,
    Generic,
    FinalError,
    InterfaceExists,
    PubkeyMismatch,
    PskMismatch,
    AllowedIpsMismatch,
    Unreachable,
    MissingDaemon,
    MissingAutoremove,
}

impl ErrorCode {
    /// Process exit status a local client maps this error to.
    /// Reachability failures are distinguished from generic fatals.
    pub fn exit_status(self) -> i32 {
        match self {
            ErrorCode::Unreachable => 2,
            _ => 1,
        }
    }
}

/// A single protocol message. All fields are serialized explicitly so
/// that absent values appear as `null` on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub code: Option<ActionCode>,
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub addresses: Option<Vec<IpAddr>>,
    #[serde(default)]
    pub pubkey: Option<String>,
    #[serde(default)]
    pub remote_pubkey: Option<String>,
    #[serde(default)]
    pub has_psk: Option<bool>,
    #[serde(default)]
    pub psk: Option<String>,
    #[serde(default)]
    pub start_time: Option<u32>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub suffix: Option<bool>,
    #[serde(default)]
    pub autoremove: Option<bool>,
    #[serde(default)]
    pub config: Option<PathBuf>,
    #[serde(default)]
    pub peer_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub latest_handshake: Option<u64>,
}

impl Message {
    /// Local-channel STOP notice.
    pub fn stop() -> Self {
        Message {
            code: Some(ActionCode::Stop),
            ..Default::default()
        }
    }

    /// Informational text forwarded to a channel.
    pub fn info(text: impl Into<String>) -> Self {
        Message {
            code: Some(ActionCode::Info),
            message: Some(text.into()),
            ..Default::default()
        }
    }

    /// Failure notification.
    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Message {
            error_code: Some(code),
            error_message: Some(text.into()),
            ..Default::default()
        }
    }

    /// Local-channel upgrade request, client to daemon.
    pub fn upgrade_request(
        peer_ip: Ipv4Addr,
        config: Option<&Path>,
        interface: Option<&str>,
        suffix: bool,
        autoremove: bool,
    ) -> Self {
        Message {
            code: Some(ActionCode::Upgrade),
            peer_ip: Some(peer_ip),
            config: config.map(Path::to_path_buf),
            interface: interface.map(str::to_string),
            suffix: Some(suffix),
            autoremove: Some(autoremove),
            ..Default::default()
        }
    }

    /// Local-channel recovery request, client to daemon.
    pub fn recover_request(interface: &str, peer_ip: Ipv4Addr, latest_handshake: u64) -> Self {
        Message {
            code: Some(ActionCode::Recover),
            interface: Some(interface.to_string()),
            peer_ip: Some(peer_ip),
            latest_handshake: Some(latest_handshake),
            ..Default::default()
        }
    }

    /// Local-channel result of the tunnel bring-up: `SUCCESS` with the
    /// interface name on a zero exit, `FINAL_ERROR` with the tool's
    /// captured output otherwise.
    pub fn upgrade_result(outcome: &UpgradeOutput, interface: &str) -> Self {
        if outcome.success() {
            Message {
                code: Some(ActionCode::Success),
                interface: Some(interface.to_string()),
                message: Some(success_text(interface)),
                ..Default::default()
            }
        } else {
            Message {
                error_code: Some(ErrorCode::FinalError),
                error_message: Some(outcome.output.trim().to_string()),
                ..Default::default()
            }
        }
    }

    /// Network-channel UPGRADE carrying the initiator's tunnel
    /// parameters. The pre-shared key value travels only when the
    /// sender had none configured (it generated a fresh one the
    /// responder must adopt); a configured key is never put on the
    /// wire.
    pub fn upgrade(cfg: &WgConfig) -> Self {
        Message {
            code: Some(ActionCode::Upgrade),
            addresses: Some(cfg.addresses.iter().copied().collect()),
            pubkey: Some(cfg.public_key.clone()),
            remote_pubkey: cfg.remote_pubkey.clone(),
            has_psk: Some(cfg.has_psk),
            psk: if cfg.has_psk { None } else { Some(cfg.psk.clone()) },
            start_time: Some(cfg.start_time),
            ..Default::default()
        }
    }

    /// Network-channel UPGRADE_RESPONSE carrying the responder's
    /// addresses and public key only.
    pub fn upgrade_response(cfg: &WgConfig) -> Self {
        Message {
            code: Some(ActionCode::UpgradeResponse),
            addresses: Some(cfg.addresses.iter().copied().collect()),
            pubkey: Some(cfg.public_key.clone()),
            ..Default::default()
        }
    }

    /// Network-channel bare "proceed now" signal.
    pub fn upgrade_go() -> Self {
        Message {
            code: Some(ActionCode::UpgradeGo),
            ..Default::default()
        }
    }
}

pub const CLOSED: &str =
    "Error: Wirelift is shutting down and is no longer accepting new requests";
pub const FINAL_ERROR: &str =
    "Something went wrong and, finally, it was not possible to establish the P2P connection";
pub const SUDO: &str = "Error: This program must be run as a superuser";
pub const TS_NO_PORT: &str = "Error: No listening port for Tailscale was found";
pub const TS_SYSTEMD_STOPPED: &str =
    "Error: 'tailscaled.service' is stopped. Start the service with systemd";
pub const TS_STOPPED: &str = "Error: Tailscale is stopped. Run 'sudo tailscale up'";
pub const TS_NO_LOGGED: &str = "Error: Tailscale is logged out";
pub const TS_NOT_RUNNING: &str = "Error: Tailscale is not running";
pub const UNIX_SOCKET: &str = "Error: Couldn't connect to the local UNIX socket";

pub fn success_text(interface: &str) -> String {
    format!("Success! Now you have a new working P2P connection through interface '{interface}'")
}

/// Marker error a worker's top level (and the CLI process) unwraps to
/// recover the exit status of a terminated unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExit(pub i32);

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session terminated with exit status {}", self.0)
    }
}

impl std::error::Error for SessionExit {}

/// Print an informational line locally and, when the calling worker has
/// a Session Context, forward it as an `INFO` message over the local
/// channel. A remote-facing text, when supplied, is sent on the remote
/// channel unconditionally.
pub async fn send_info(local: impl Into<String>, remote: Option<String>) {
    let local = local.into();
    println!("{local}");
    if let Some(session) = Session::current() {
        if session.has_local().await {
            session.send_local(&Message::info(local.as_str())).await;
        }
        if let Some(remote) = remote {
            session.send_remote(&Message::info(remote)).await;
        }
    }
}

/// One of the two places messages leave the process. Prints the local
/// text, forwards to the channels attached to the calling worker's
/// Session Context, closes those channels and, unless `keep_running`
/// was requested, terminates the current unit of work by returning a
/// [`SessionExit`] error.
///
/// The remote channel only sees the report when it was requested with
/// [`remote`](ErrorReport::remote), or when the report was built with
/// [`remote_if_responder`](ErrorReport::remote_if_responder) and the
/// calling worker is the session responder. A responder's local failure
/// is always surfaced to the initiator this way, while an initiator's
/// local-only failures are not leaked to the responder.
#[must_use]
pub struct ErrorReport {
    code: ErrorCode,
    local: Option<String>,
    remote: Option<String>,
    always_send_to_remote: bool,
    exit: Option<i32>,
}

impl ErrorReport {
    pub fn new(code: ErrorCode) -> Self {
        ErrorReport {
            code,
            local: None,
            remote: None,
            always_send_to_remote: true,
            exit: Some(code.exit_status()),
        }
    }

    pub fn local(mut self, text: impl Into<String>) -> Self {
        self.local = Some(text.into());
        self
    }

    /// Remote-facing text, sent whenever a remote channel is attached.
    pub fn remote(mut self, text: impl Into<String>) -> Self {
        self.remote = Some(text.into());
        self.always_send_to_remote = true;
        self
    }

    /// Remote-facing text, sent only when the calling worker is the
    /// session responder.
    pub fn remote_if_responder(mut self, text: impl Into<String>) -> Self {
        self.remote = Some(text.into());
        self.always_send_to_remote = false;
        self
    }

    pub fn exit(mut self, status: i32) -> Self {
        self.exit = Some(status);
        self
    }

    /// Report without terminating the current unit of work.
    pub fn keep_running(mut self) -> Self {
        self.exit = None;
        self
    }

    pub async fn send(self) -> Result<()> {
        if let Some(local) = &self.local {
            eprintln!("{local}");
        }
        if let Some(session) = Session::current() {
            if let Some(local) = &self.local {
                session.send_local(&Message::error(self.code, local.as_str())).await;
            }
            if let Some(remote) = &self.remote {
                if self.always_send_to_remote || session.running_in_remote {
                    session
                        .send_remote(&Message::error(self.code, remote.as_str()))
                        .await;
                }
            }
            session.close_channels().await;
        }
        match self.exit {
            Some(status) => Err(SessionExit(status).into()),
            None => Ok(()),
        }
    }

    /// Send and terminate, for call sites that must produce a value.
    /// Forces an exit status so the report can never fall through.
    pub async fn fail<T>(mut self) -> Result<T> {
        self.exit.get_or_insert(self.code.exit_status());
        self.send().await?;
        unreachable!("a fatal report always terminates the unit of work")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_wgconfig(has_psk: bool) -> WgConfig {
        let mut cfg = WgConfig::for_tests();
        cfg.has_psk = has_psk;
        cfg.psk = "GENERATED_OR_CONFIGURED_PSK=".to_string();
        cfg
    }

    #[test]
    fn test_round_trip_every_action_code() {
        let codes = [
            ActionCode::Ack,
            ActionCode::Info,
            ActionCode::Stop,
            ActionCode::Success,
            ActionCode::Upgrade,
            ActionCode::UpgradeResponse,
            ActionCode::UpgradeGo,
            ActionCode::Recover,
        ];
        for code in codes {
            let msg = Message {
                code: Some(code),
                message: Some("text".to_string()),
                ..Default::default()
            };
            let line = serde_json::to_string(&msg).unwrap();
            let back: Message = serde_json::from_str(&line).unwrap();
            assert_eq!(msg, back);
        }
    }

    #[test]
    fn test_absent_fields_serialize_as_null() {
        let line = serde_json::to_string(&Message::upgrade_go()).unwrap();
        assert!(line.contains("\"error_code\":null"));
        assert!(line.contains("\"psk\":null"));
        assert!(line.contains("\"code\":\"UPGRADE_GO\""));
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let back: Message =
            serde_json::from_str(r#"{"code":"ACK","brand_new_field":42}"#).unwrap();
        assert_eq!(back.code, Some(ActionCode::Ack));
    }

    #[test]
    fn test_upgrade_withholds_configured_psk() {
        let msg = Message::upgrade(&test_wgconfig(true));
        assert_eq!(msg.has_psk, Some(true));
        assert_eq!(msg.psk, None);
    }

    #[test]
    fn test_upgrade_sends_generated_psk() {
        let cfg = test_wgconfig(false);
        let msg = Message::upgrade(&cfg);
        assert_eq!(msg.has_psk, Some(false));
        assert_eq!(msg.psk.as_deref(), Some(cfg.psk.as_str()));
    }

    #[test]
    fn test_upgrade_result_maps_exit_status() {
        let ok = UpgradeOutput {
            status: 0,
            output: "[#] ip link add wg0 type wireguard\n".to_string(),
        };
        let msg = Message::upgrade_result(&ok, "peerA");
        assert_eq!(msg.code, Some(ActionCode::Success));
        assert_eq!(msg.interface.as_deref(), Some("peerA"));

        let failed = UpgradeOutput {
            status: 1,
            output: "wg-quick: `wg0' already exists\n".to_string(),
        };
        let msg = Message::upgrade_result(&failed, "peerA");
        assert_eq!(msg.code, None);
        assert_eq!(msg.error_code, Some(ErrorCode::FinalError));
        assert_eq!(
            msg.error_message.as_deref(),
            Some("wg-quick: `wg0' already exists")
        );
    }

    #[test]
    fn test_exit_status_distinguishes_reachability() {
        assert_eq!(ErrorCode::Unreachable.exit_status(), 2);
        assert_eq!(ErrorCode::Generic.exit_status(), 1);
        assert_eq!(ErrorCode::FinalError.exit_status(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_report_terminates_with_status_two() {
        let err = ErrorReport::new(ErrorCode::Unreachable)
            .local("Error: Peer 'peerb' (100.64.0.2) is offline")
            .fail::<()>()
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<SessionExit>(), Some(&SessionExit(2)));
    }
}
