// SPDX-License-Identifier: MIT OR Apache-2.0
//! The SSH command line: a single TCP connection to the device's SSH
//! server on port 7910, trusting the host key captured earlier over serial
//! (trust-on-first-contact per session) rather than consulting `~/.ssh/known_hosts`.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use russh::client::{self, Handle};
use russh::keys::key::PublicKey;
use russh::ChannelMsg;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, ErrorKind};

/// Outbound TCP port for the device's SSH server.
pub const DEFAULT_PORT: u16 = 7910;

pub const DEFAULT_USERNAME: &str = "root";

/// Holds the single public key captured over serial before this connection was made;
/// `check_server_key` compares against it byte-for-byte rather than trusting any CA
/// or persisted `known_hosts` file.
struct PinnedHostKey
{
    expected: PublicKey,
}

#[async_trait]
impl client::Handler for PinnedHostKey
{
    type Error = Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error>
    {
        Ok(server_public_key.public_key_bytes() == self.expected.public_key_bytes())
    }
}

/// One SSH connection, owned exclusively by the `DeviceLinux` context for its
/// lifetime. No concurrent commands per connection.
pub struct SshCommandLine
{
    session: AsyncMutex<Handle<PinnedHostKey>>,
}

impl SshCommandLine
{
    /// Connect to `host:port`, authenticate as `root`, and pin the connection to
    /// `host_key_line` (an OpenSSH-format public key line, e.g. the contents of
    /// `/etc/ssh/ssh_host_ed25519_key.pub`, as read over serial by the caller).
    pub async fn connect(host: &str, port: u16, host_key_line: &str, username: &str) -> Result<Self, Error>
    {
        let expected = russh::keys::parse_public_key_base64(
            host_key_line
                .split_whitespace()
                .nth(1)
                .ok_or_else(|| ErrorKind::Protocol(format!("malformed ssh host key line: {:?}", host_key_line)).error())?,
        )
        .map_err(|e| ErrorKind::Protocol(format!("could not parse pinned ssh host key: {}", e)).error())?;

        let config = Arc::new(client::Config::default());
        let handler = PinnedHostKey { expected };
        let mut session = client::connect(config, (host, port), handler)
            .await
            .map_err(|e| ErrorKind::Protocol(format!("ssh connection to {}:{} failed: {}", host, port, e)).error())?;

        // The device accepts an empty password for `root` over this management port;
        // the serial console performs the same trust-on-first-contact bring-up before
        // this connection is ever opened.
        let authenticated = session
            .authenticate_password(username, "")
            .await
            .map_err(|e| ErrorKind::Protocol(format!("ssh authentication failed: {}", e)).error())?;
        if !authenticated {
            return Err(ErrorKind::Protocol(String::from("ssh authentication rejected")).error());
        }

        debug!("ssh connected to {}:{} as {}", host, port, username);
        Ok(Self { session: AsyncMutex::new(session) })
    }

    /// Run `command` to completion, check-exit-code semantics: non-zero exit
    /// raises `CommandError`.
    pub async fn run(&self, command: &str) -> Result<String, Error>
    {
        let session = self.session.lock().await;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ErrorKind::Protocol(format!("ssh channel open failed: {}", e)).error())?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ErrorKind::Protocol(format!("ssh exec failed: {}", e)).error())?;

        let mut stdout = Vec::new();
        let mut exit_status: Option<u32> = None;
        loop {
            let Some(msg) = channel.wait().await else { break };
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, .. } => stdout.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {},
            }
        }

        let code = exit_status.ok_or_else(|| ErrorKind::Protocol(format!("ssh command {:?} never reported an exit status", command)).error())?;
        if code != 0 {
            return Err(ErrorKind::Command { code: code as i32 }.error());
        }

        String::from_utf8(stdout).map_err(|e| ErrorKind::Protocol(format!("ssh command output was not valid utf-8: {}", e)).error())
    }
}
