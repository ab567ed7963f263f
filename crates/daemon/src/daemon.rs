//! Daemon runtime: the two accept loops, one worker per accepted
//! connection, and the cooperative shutdown flag.
//!
//! The unix listener serves the local CLI; the TCP listener, bound on
//! the local tailscale address, serves remote daemons. Each accepted
//! connection gets its own worker task owning one Session Context for
//! its whole lifetime. Shutdown refuses new requests with CLOSED but
//! never cancels a negotiation in flight.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{fs, io};

use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use nix::unistd::Uid;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;

use crate::channel::Channel;
use crate::config::Settings;
use crate::messages::{self, ActionCode, ErrorCode, Message, SessionExit};
use crate::recover;
use crate::session::{self, Session};
use crate::tailscale;
use crate::upgrade;

/// One negotiation at a time per listener, mirroring the serialization
/// the control plane needs anyway.
static LOCAL_UPGRADE_GATE: Mutex<()> = Mutex::const_new(());
static REMOTE_UPGRADE_GATE: Mutex<()> = Mutex::const_new(());

/// Process-wide shutdown flag, set once and polled cooperatively.
pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Daemon {
    settings: Settings,
    shutdown: Shutdown,
}

impl Daemon {
    pub fn new(settings: Settings) -> Self {
        Daemon {
            settings,
            shutdown: Shutdown::new(),
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        if !Uid::effective().is_root() {
            bail!("the wirelift daemon must be run as root");
        }
        let runtime_dir = &self.settings.daemon.runtime_dir;
        fs::create_dir_all(runtime_dir)
            .with_context(|| format!("failed to create {}", runtime_dir.display()))?;

        let my_ip = tailscale::my_ip().await?;
        let socket_path = &self.settings.daemon.socket_path;
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(socket_path) {
            Ok(()) => debug!("removed stale socket {}", socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("failed to remove stale unix socket"),
        }
        let unix = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))?;
        let tcp = TcpListener::bind((my_ip, self.settings.daemon.tcp_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind {}:{}",
                    my_ip, self.settings.daemon.tcp_port
                )
            })?;
        info!(
            "🚀 wirelift daemon listening on {} and {}:{}",
            socket_path.display(),
            my_ip,
            self.settings.daemon.tcp_port
        );

        let mut workers = JoinSet::new();
        loop {
            if self.shutdown.is_set() && workers.is_empty() {
                break;
            }
            tokio::select! {
                _ = self.shutdown.wait(), if !self.shutdown.is_set() => {}
                Some(result) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = result {
                        error!("worker task failed: {e}");
                    }
                }
                accepted = unix.accept() => match accepted {
                    Ok((stream, _)) => {
                        let daemon = self.clone();
                        workers.spawn(async move {
                            daemon.handle_local(stream, my_ip).await;
                        });
                    }
                    Err(e) => error!("unix accept failed: {e}"),
                },
                accepted = tcp.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let daemon = self.clone();
                        workers.spawn(async move {
                            daemon.handle_remote(stream, addr, my_ip).await;
                        });
                    }
                    Err(e) => error!("tcp accept failed: {e}"),
                },
            }
        }
        info!("wirelift daemon stopped");
        Ok(())
    }

    /// Worker for one local client connection.
    async fn handle_local(&self, stream: UnixStream, my_ip: Ipv4Addr) {
        let mut channel = Channel::unix(stream);
        if self.shutdown.is_set() {
            refuse(channel, ErrorCode::Closed, messages::CLOSED).await;
            return;
        }
        let request = match channel.recv().await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!("dropping malformed local request: {e:#}");
                return;
            }
        };
        match request.code {
            Some(ActionCode::Stop) => {
                self.shutdown.trigger();
                info!("The server has been set to shut down");
                channel.close().await;
            }
            Some(ActionCode::Upgrade) => {
                let _gate = LOCAL_UPGRADE_GATE.lock().await;
                if self.shutdown.is_set() {
                    refuse(channel, ErrorCode::Closed, messages::CLOSED).await;
                    return;
                }
                self.local_session(channel, request, my_ip, false).await;
            }
            Some(ActionCode::Recover) => {
                let _gate = LOCAL_UPGRADE_GATE.lock().await;
                if self.shutdown.is_set() {
                    refuse(channel, ErrorCode::Closed, messages::CLOSED).await;
                    return;
                }
                self.local_session(channel, request, my_ip, true).await;
            }
            other => {
                debug!("ignoring local request with unsupported action {other:?}");
                channel.close().await;
            }
        }
    }

    /// Allocate a Session Context for a local request and run the
    /// initiator (or recovery) state machine inside its scope.
    async fn local_session(
        &self,
        channel: Channel,
        request: Message,
        my_ip: Ipv4Addr,
        recovery: bool,
    ) {
        let Some(peer_ip) = request.peer_ip else {
            refuse(
                channel,
                ErrorCode::Generic,
                "Error: The request is missing the peer address",
            )
            .await;
            return;
        };
        if peer_ip == my_ip {
            refuse(
                channel,
                ErrorCode::Generic,
                "Error: you should not connect to your own machine",
            )
            .await;
            return;
        }
        let session = Arc::new(Session::new(my_ip, peer_ip, my_ip));
        session.attach_local(channel).await;
        let result = {
            let session = session.clone();
            let settings = &self.settings;
            session::scope(session.clone(), async move {
                if recovery {
                    recover::run_recovery(&session, &request, settings).await
                } else {
                    upgrade::run_initiator(&session, &request, settings).await
                }
            })
            .await
        };
        finish(&session, result).await;
    }

    /// Worker for one inbound daemon-to-daemon connection.
    async fn handle_remote(&self, stream: TcpStream, addr: SocketAddr, my_ip: Ipv4Addr) {
        let IpAddr::V4(caller) = addr.ip() else {
            debug!("dropping non-IPv4 remote connection from {addr}");
            return;
        };
        let mut channel = Channel::tcp(stream);
        if self.shutdown.is_set() {
            refuse(
                channel,
                ErrorCode::RemoteClosed,
                &format!(
                    "Error: Wirelift instance at {my_ip} has been set to stop receiving requests"
                ),
            )
            .await;
            return;
        }
        let request = match channel.recv().await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!("dropping malformed remote request from {caller}: {e:#}");
                return;
            }
        };
        if request.code != Some(ActionCode::Upgrade) {
            debug!("ignoring remote request with action {:?}", request.code);
            channel.close().await;
            return;
        }
        let _gate = REMOTE_UPGRADE_GATE.lock().await;
        let session = Arc::new(Session::new(caller, my_ip, my_ip));
        session.attach_remote(channel).await;
        let result = {
            let session = session.clone();
            let settings = &self.settings;
            session::scope(session.clone(), async move {
                upgrade::run_responder(&session, &request, settings).await
            })
            .await
        };
        finish(&session, result).await;
    }
}

/// Reject a fresh connection that never gets a Session Context.
async fn refuse(mut channel: Channel, code: ErrorCode, text: &str) {
    let _ = channel.send(&Message::error(code, text)).await;
    channel.close().await;
}

/// Worker epilogue: a SessionExit is the normal end of a failed
/// negotiation, anything else is a bug worth logging loudly. Channels
/// are released either way.
async fn finish(session: &Session, result: Result<()>) {
    match result {
        Ok(()) => {}
        Err(e) => match e.downcast_ref::<SessionExit>() {
            Some(SessionExit(status)) => debug!("session ended with exit status {status}"),
            None => error!("session failed unexpectedly: {e:#}"),
        },
    }
    session.close_channels().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_flag_is_sticky_and_wakes_waiters() {
        let shutdown = Arc::new(Shutdown::new());
        assert!(!shutdown.is_set());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };
        shutdown.trigger();
        waiter.await.unwrap();
        assert!(shutdown.is_set());

        // A second trigger is a no-op, and waits return immediately.
        shutdown.trigger();
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn test_refuse_sends_closed_and_hangs_up() {
        let (channel, mut client) = Channel::pair();
        refuse(channel, ErrorCode::Closed, messages::CLOSED).await;
        let got = client.recv().await.unwrap().unwrap();
        assert_eq!(got.error_code, Some(ErrorCode::Closed));
        assert_eq!(got.error_message.as_deref(), Some(messages::CLOSED));
        assert!(client.recv().await.unwrap().is_none());
    }
}
