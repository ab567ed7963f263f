//! Per-negotiation Session Context and the worker-keyed registry.
//!
//! Exactly one context exists per worker; the registry is the tokio
//! task-local scope the worker runs inside, so a lookup always returns
//! "the context of whoever is asking" and never another worker's. Deep
//! helpers (control-plane queries, error reporting) retrieve it through
//! [`Session::current`] instead of threading it through every call.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Result;
use log::debug;
use tokio::sync::{Mutex, OnceCell};

use crate::channel::Channel;
use crate::messages::Message;
use crate::tailscale;

tokio::task_local! {
    static SESSION: Arc<Session>;
}

/// Run a worker future with `session` registered as its context. The
/// registration ends when the future does, covering error exits.
pub async fn scope<T>(session: Arc<Session>, fut: impl Future<Output = T>) -> T {
    SESSION.scope(session, fut).await
}

/// State shared by every routine executing on behalf of one
/// negotiation.
pub struct Session {
    /// Tailscale address of the host that initiated the session.
    pub caller: Ipv4Addr,
    /// Tailscale address of the host the session is directed at.
    pub receiver: Ipv4Addr,
    pub my_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
    /// True exactly when this daemon instance is the responder.
    pub running_in_remote: bool,
    my_name: OnceCell<String>,
    peer_name: OnceCell<String>,
    remote: Mutex<Option<Channel>>,
    local: Mutex<Option<Channel>>,
}

impl Session {
    pub fn new(caller: Ipv4Addr, receiver: Ipv4Addr, my_ip: Ipv4Addr) -> Self {
        let running_in_remote = receiver == my_ip;
        let peer_ip = if running_in_remote { caller } else { receiver };
        Session {
            caller,
            receiver,
            my_ip,
            peer_ip,
            running_in_remote,
            my_name: OnceCell::new(),
            peer_name: OnceCell::new(),
            remote: Mutex::new(None),
            local: Mutex::new(None),
        }
    }

    /// The context of the calling worker, if one is registered.
    pub fn current() -> Option<Arc<Session>> {
        SESSION.try_with(Arc::clone).ok()
    }

    /// Local host name, resolved once per context.
    pub async fn my_name(&self) -> Result<String> {
        self.my_name
            .get_or_try_init(tailscale::my_name)
            .await
            .cloned()
    }

    /// Peer host name, resolved once per context. Resolution fails the
    /// session when the control plane knows no such peer.
    pub async fn peer_name(&self) -> Result<String> {
        self.peer_name
            .get_or_try_init(|| tailscale::peer_name(self.peer_ip))
            .await
            .cloned()
    }

    pub async fn attach_local(&self, channel: Channel) {
        *self.local.lock().await = Some(channel);
    }

    pub async fn attach_remote(&self, channel: Channel) {
        *self.remote.lock().await = Some(channel);
    }

    pub async fn has_local(&self) -> bool {
        self.local.lock().await.is_some()
    }

    pub async fn has_remote(&self) -> bool {
        self.remote.lock().await.is_some()
    }

    /// Best-effort send on the local channel; a missing channel or a
    /// dead peer never fails the caller.
    pub async fn send_local(&self, message: &Message) {
        if let Some(channel) = self.local.lock().await.as_mut() {
            if let Err(e) = channel.send(message).await {
                debug!("dropping local-channel message: {e:#}");
            }
        }
    }

    pub async fn send_remote(&self, message: &Message) {
        if let Some(channel) = self.remote.lock().await.as_mut() {
            if let Err(e) = channel.send(message).await {
                debug!("dropping remote-channel message: {e:#}");
            }
        }
    }

    /// Next message from the remote daemon. `Ok(None)` when the channel
    /// is absent or the peer closed it.
    pub async fn recv_remote(&self) -> Result<Option<Message>> {
        match self.remote.lock().await.as_mut() {
            Some(channel) => channel.recv().await,
            None => Ok(None),
        }
    }

    /// Close and drop every attached channel.
    pub async fn close_channels(&self) {
        if let Some(mut channel) = self.local.lock().await.take() {
            channel.close().await;
        }
        if let Some(mut channel) = self.remote.lock().await.take() {
            channel.close().await;
        }
    }

    #[cfg(test)]
    pub fn for_tests(
        caller: Ipv4Addr,
        receiver: Ipv4Addr,
        my_ip: Ipv4Addr,
        my_name: &str,
        peer_name: &str,
    ) -> Self {
        let session = Session::new(caller, receiver, my_ip);
        session.my_name.set(my_name.to_string()).unwrap();
        session.peer_name.set(peer_name.to_string()).unwrap();
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ErrorCode, ErrorReport, SessionExit};

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(100, 64, 0, last)
    }

    #[test]
    fn test_derived_fields_on_the_initiator() {
        let session = Session::new(ip(1), ip(2), ip(1));
        assert!(!session.running_in_remote);
        assert_eq!(session.peer_ip, ip(2));
    }

    #[test]
    fn test_derived_fields_on_the_responder() {
        let session = Session::new(ip(1), ip(2), ip(2));
        assert!(session.running_in_remote);
        assert_eq!(session.peer_ip, ip(1));
    }

    #[tokio::test]
    async fn test_current_is_none_outside_a_worker() {
        assert!(Session::current().is_none());
    }

    #[tokio::test]
    async fn test_current_returns_the_scoped_context() {
        let session = Arc::new(Session::new(ip(1), ip(2), ip(1)));
        let found = scope(session.clone(), async { Session::current() }).await;
        assert_eq!(found.unwrap().peer_ip, session.peer_ip);
        assert!(Session::current().is_none());
    }

    #[tokio::test]
    async fn test_send_error_degrades_without_a_context() {
        // No registered context: prints locally only, still terminates.
        let err = ErrorReport::new(ErrorCode::Generic)
            .local("no context here")
            .send()
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<SessionExit>(), Some(&SessionExit(1)));
    }

    #[tokio::test]
    async fn test_send_error_closes_all_attached_channels() {
        let session = Arc::new(Session::new(ip(1), ip(2), ip(1)));
        let (local, mut local_peer) = Channel::pair();
        let (remote, mut remote_peer) = Channel::pair();
        session.attach_local(local).await;
        session.attach_remote(remote).await;

        let result = scope(
            session.clone(),
            ErrorReport::new(ErrorCode::Generic).local("fatal").send(),
        )
        .await;
        assert!(result.is_err());
        assert!(!session.has_local().await);
        assert!(!session.has_remote().await);

        // The local peer sees the error, then a clean close.
        let got = local_peer.recv().await.unwrap().unwrap();
        assert_eq!(got.error_code, Some(ErrorCode::Generic));
        assert!(local_peer.recv().await.unwrap().is_none());
        assert!(remote_peer.recv().await.unwrap().is_none());
    }

    async fn remote_forwarding_case(responder: bool, always: bool) -> bool {
        let my_ip = if responder { ip(2) } else { ip(1) };
        let session = Arc::new(Session::new(ip(1), ip(2), my_ip));
        let (remote, mut remote_peer) = Channel::pair();
        session.attach_remote(remote).await;

        let report = ErrorReport::new(ErrorCode::Generic).local("local text");
        let report = if always {
            report.remote("remote text")
        } else {
            report.remote_if_responder("remote text")
        };
        let _ = scope(session, report.send()).await;
        remote_peer.recv().await.unwrap().is_some()
    }

    #[tokio::test]
    async fn test_send_error_remote_forwarding_matrix() {
        // Forwarded iff always_send_to_remote OR the worker responds.
        assert!(remote_forwarding_case(false, true).await);
        assert!(remote_forwarding_case(true, true).await);
        assert!(remote_forwarding_case(true, false).await);
        assert!(!remote_forwarding_case(false, false).await);
    }
}
