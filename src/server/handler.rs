// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! SSH protocol handler for one connection.
//!
//! Implements `russh::server::Handler`: password authentication against
//! the shared credential set, demultiplexing of incoming channels
//! (`session` only, everything else rejected), and routing of channel
//! requests to the per-channel [`Session`]s. russh invokes these
//! callbacks in wire order, which gives each session its in-order
//! request stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use russh::server::{Auth, Msg, Session as SshSession};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty, Sig};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use super::auth::CredentialSet;
use super::session::Session;

/// Per-connection handler.
pub struct ConnectionHandler {
    credentials: Arc<CredentialSet>,
    shell: PathBuf,
    peer_addr: Option<SocketAddr>,
    shutdown: CancellationToken,

    /// Authenticated user, set once password auth succeeds.
    user: Option<String>,

    /// One session per accepted `session` channel.
    sessions: HashMap<ChannelId, Arc<Session>>,
}

impl ConnectionHandler {
    pub fn new(
        credentials: Arc<CredentialSet>,
        shell: PathBuf,
        peer_addr: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            credentials,
            shell,
            peer_addr,
            shutdown,
            user: None,
            sessions: HashMap::new(),
        }
    }

    fn password_only() -> MethodSet {
        MethodSet::from([MethodKind::Password].as_slice())
    }

    fn session(&self, channel_id: ChannelId) -> Option<Arc<Session>> {
        self.sessions.get(&channel_id).cloned()
    }

    fn reply(session: &mut SshSession, channel_id: ChannelId, ok: bool) {
        if ok {
            let _ = session.channel_success(channel_id);
        } else {
            let _ = session.channel_failure(channel_id);
        }
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::debug!(user = %user, remote = ?self.peer_addr, "auth none attempt");
        Ok(Auth::Reject {
            proceed_with_methods: Some(Self::password_only()),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let password = Zeroizing::new(password.to_string());

        if self.credentials.verify(user, &password) {
            tracing::info!(user = %user, remote = ?self.peer_addr, "client authenticated");
            self.user = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            // Indistinct on purpose: unknown user and wrong password
            // produce the same rejection.
            tracing::warn!(user = %user, remote = ?self.peer_addr, "auth rejected");
            Ok(Auth::Reject {
                proceed_with_methods: Some(Self::password_only()),
                partial_success: false,
            })
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        tracing::debug!(user = %user, remote = ?self.peer_addr, "public key auth not offered");
        Ok(Auth::Reject {
            proceed_with_methods: Some(Self::password_only()),
            partial_success: false,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        let Some(user) = self.user.clone() else {
            return Ok(false);
        };

        tracing::debug!(
            user = %user,
            channel = ?channel.id(),
            remote = ?self.peer_addr,
            "session channel opened"
        );

        let session = Session::new(user, self.shell.clone(), self.shutdown.child_token());
        self.sessions.insert(channel.id(), Arc::new(session));
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        tracing::warn!(
            remote = ?self.peer_addr,
            target = %format!("{host_to_connect}:{port_to_connect}"),
            "direct-tcpip channel rejected"
        );
        drop(channel);
        Ok(false)
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        tracing::warn!(remote = ?self.peer_addr, "forwarded-tcpip channel rejected");
        drop(channel);
        Ok(false)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let ok = match self.session(channel_id) {
            Some(s) => s.pty_request(term, col_width, row_height).await,
            None => false,
        };
        Self::reply(session, channel_id, ok);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let ok = match self.session(channel_id) {
            Some(s) => s.env_request(variable_name, variable_value).await,
            None => false,
        };
        Self::reply(session, channel_id, ok);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let ok = match self.session(channel_id) {
            Some(s) => s.window_change(col_width, row_height).await,
            None => false,
        };
        Self::reply(session, channel_id, ok);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let ok = match self.session(channel_id) {
            Some(s) => match s.start_shell(channel_id, session.handle()).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(
                        remote = ?self.peer_addr,
                        error = %err,
                        "shell request failed"
                    );
                    false
                }
            },
            None => false,
        };
        Self::reply(session, channel_id, ok);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();

        let ok = match self.session(channel_id) {
            Some(s) => match s.start_exec(&command, channel_id, session.handle()).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(
                        remote = ?self.peer_addr,
                        command = %command,
                        error = %err,
                        "exec request failed"
                    );
                    false
                }
            },
            None => false,
        };
        Self::reply(session, channel_id, ok);
        Ok(())
    }

    async fn signal(
        &mut self,
        channel_id: ChannelId,
        signal: Sig,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let ok = match self.session(channel_id) {
            Some(s) => s.signal(&signal).await,
            None => false,
        };
        Self::reply(session, channel_id, ok);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            subsystem = %name,
            remote = ?self.peer_addr,
            "subsystem rejected"
        );
        Self::reply(session, channel_id, false);
        Ok(())
    }

    /// Reverse port forwarding (`ssh -R`) is not offered.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            remote = ?self.peer_addr,
            address = %address,
            port = %port,
            "tcpip-forward rejected"
        );
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            remote = ?self.peer_addr,
            address = %address,
            port = %port,
            "cancel-tcpip-forward rejected"
        );
        Ok(false)
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        if let Some(s) = self.session(channel_id) {
            s.data(data).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        if let Some(s) = self.session(channel_id) {
            s.eof().await;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.sessions.remove(&channel_id);
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if let Some(user) = &self.user {
            tracing::info!(user = %user, remote = ?self.peer_addr, "client disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::User;
    use russh::server::Handler;

    fn handler() -> ConnectionHandler {
        let credentials = Arc::new(CredentialSet::new(&[User {
            username: "demo".into(),
            password: "pw".into(),
        }]));
        ConnectionHandler::new(
            credentials,
            PathBuf::from("/bin/sh"),
            None,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_auth_none_rejected_advertising_password() {
        let mut h = handler();
        match h.auth_none("demo").await.unwrap() {
            Auth::Reject {
                proceed_with_methods: Some(methods),
                ..
            } => {
                assert!(methods.contains(&MethodKind::Password));
                assert!(!methods.contains(&MethodKind::PublicKey));
            }
            _ => panic!("expected reject advertising the password method"),
        }
        assert!(h.user.is_none());
    }

    #[tokio::test]
    async fn test_auth_password_success() {
        let mut h = handler();
        assert!(matches!(
            h.auth_password("demo", "pw").await.unwrap(),
            Auth::Accept
        ));
        assert_eq!(h.user.as_deref(), Some("demo"));
    }

    #[tokio::test]
    async fn test_auth_password_rejections_indistinct() {
        let mut h = handler();

        let wrong_password = h.auth_password("demo", "nope").await.unwrap();
        let unknown_user = h.auth_password("ghost", "pw").await.unwrap();

        // Same variant shape for both failure causes.
        match (&wrong_password, &unknown_user) {
            (
                Auth::Reject {
                    partial_success: a, ..
                },
                Auth::Reject {
                    partial_success: b, ..
                },
            ) => assert_eq!(a, b),
            _ => panic!("expected both attempts to be rejected"),
        }
        assert!(h.user.is_none());
    }

    #[tokio::test]
    async fn test_auth_publickey_rejected() {
        // Any valid public key must be turned away; only passwords count.
        let key_b64 = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
        let key = russh::keys::parse_public_key_base64(key_b64).unwrap();

        let mut h = handler();
        match h.auth_publickey("demo", &key).await.unwrap() {
            Auth::Reject {
                proceed_with_methods: Some(methods),
                ..
            } => assert!(methods.contains(&MethodKind::Password)),
            _ => panic!("expected public key auth to be rejected"),
        }
    }
}
