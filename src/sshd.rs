//! SSH command gateway.
//!
//! Accepts `session` channels and runs one `exec` command per channel under
//! the configured shell, wiring channel data to the child's stdin and the
//! child's stdout/stderr back to the channel. Once a command finishes, the
//! GitFS repository cache is purged so pushed changes become visible on the
//! mount. No shell access, no SendEnv.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use pagesfs::GitFs;
use russh::keys::{PrivateKey, ssh_key};
use russh::server::{self, Auth, Handle, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec};
use thiserror::Error;
use tokio::io::AsyncReadExt as _;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::{debug, error, info};

use crate::app_config::SshdConfig;

#[derive(Debug, Error)]
pub enum SshdError {
    #[error("failed to load host key: {0}")]
    HostKey(#[from] russh::keys::Error),
}

/// The SSH gateway server.
pub struct SshServer {
    config: SshdConfig,
    host_key: PrivateKey,
    gitfs: Arc<GitFs>,
    client_count: Arc<AtomicI32>,
}

impl SshServer {
    pub fn new(config: &SshdConfig, gitfs: Arc<GitFs>) -> Result<Self, SshdError> {
        let host_key = russh::keys::load_secret_key(&config.private_key, None)?;
        Ok(Self {
            config: config.clone(),
            host_key,
            gitfs,
            client_count: Arc::new(AtomicI32::new(0)),
        })
    }

    /// Listen and serve until the surrounding task is cancelled.
    pub async fn run(&mut self) -> Result<(), std::io::Error> {
        let server_config = server::Config {
            auth_rejection_time: std::time::Duration::from_secs(1),
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            keys: vec![self.host_key.clone()],
            ..Default::default()
        };

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let socket = TcpListener::bind(&addr).await?;
        info!(addr, "SSH gateway listening");

        self.run_on_socket(Arc::new(server_config), &socket)
            .await
            .map_err(std::io::Error::other)
    }
}

impl server::Server for SshServer {
    type Handler = ClientHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        let live = self.client_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(?peer_addr, live, max = self.config.max_clients, "accepted incoming connection");
        ClientHandler {
            shell: self.config.shell.clone(),
            gitfs: Arc::clone(&self.gitfs),
            channels: HashMap::new(),
            client_count: Arc::clone(&self.client_count),
            max_clients: self.config.max_clients,
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        error!(%error, "session error");
    }
}

/// Handler for a single SSH connection.
pub struct ClientHandler {
    shell: PathBuf,
    gitfs: Arc<GitFs>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    client_count: Arc<AtomicI32>,
    max_clients: i32,
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        let live = self.client_count.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(live, "connection closed");
    }
}

impl server::Handler for ClientHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Over-capacity clients are cut off before authentication
        // completes, never at channel time.
        let live = self.client_count.load(Ordering::SeqCst);
        if live > self.max_clients {
            error!(
                user,
                live,
                max = self.max_clients,
                "rejecting authentication, too many connections"
            );
            return Err(russh::Error::Disconnect);
        }
        debug!(user, "public key authentication");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = %channel.id(), "session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // russh has already stripped the 4-byte big-endian length prefix of
        // the exec request payload; `data` is the raw command.
        let command = String::from_utf8_lossy(data).into_owned();
        debug!(channel = %channel_id, command = %command, "exec request");

        let Some(channel) = self.channels.remove(&channel_id) else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };

        let mut shell_cmd = Command::new(&self.shell);
        shell_cmd
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = match shell_cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(shell = %self.shell.display(), error = %e, "failed to spawn shell command");
                let _ = session.channel_failure(channel_id);
                return Ok(());
            }
        };

        let _ = session.channel_success(channel_id);
        let handle = session.handle();
        let gitfs = Arc::clone(&self.gitfs);
        tokio::spawn(run_command(channel, channel_id, handle, child, gitfs));
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.data(
            channel,
            CryptoVec::from_slice(
                b"You've successfully authenticated, but pages does not provide shell access.\n",
            ),
        );
        let _ = session.channel_failure(channel);
        let _ = session.close(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.extended_data(
            channel,
            1,
            CryptoVec::from_slice(b"error: pages does not support SendEnv.\n"),
        );
        let _ = session.channel_failure(channel);
        Ok(())
    }
}

/// Drive one shell command to completion: pump the three stdio streams,
/// report the exit status, then purge the repository cache -- the command
/// may have rewritten a repository, so every cached view is suspect.
async fn run_command(
    channel: Channel<Msg>,
    channel_id: ChannelId,
    handle: Handle,
    mut child: Child,
    gitfs: Arc<GitFs>,
) {
    let mut stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stream = channel.into_stream();
    let (mut channel_read, mut channel_write) = tokio::io::split(stream);

    let stdin_task = tokio::spawn(async move {
        if let Some(stdin) = stdin.as_mut() {
            let _ = tokio::io::copy(&mut channel_read, stdin).await;
        }
    });
    let stdout_task = tokio::spawn(async move {
        if let Some(mut stdout) = stdout {
            let _ = tokio::io::copy(&mut stdout, &mut channel_write).await;
        }
    });
    let stderr_handle = handle.clone();
    let stderr_task = tokio::spawn(async move {
        let Some(mut stderr) = stderr else { return };
        let mut buf = [0u8; 8192];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stderr_handle
                        .extended_data(channel_id, 1, CryptoVec::from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    let status = child.wait().await;
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    // The client may never close its side; the child is gone, stop reading.
    stdin_task.abort();

    let exit_code = match status {
        Ok(status) => {
            let code = status.code().unwrap_or(0).max(0) as u32;
            debug!(channel = %channel_id, code, "shell command finished");
            code
        }
        Err(e) => {
            error!(channel = %channel_id, error = %e, "failed to wait for shell command");
            1
        }
    };
    let _ = handle.exit_status_request(channel_id, exit_code).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;

    gitfs.purge();
}
