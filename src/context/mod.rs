// SPDX-License-Identifier: MIT OR Apache-2.0
//! The execution-context engine: a closed set of runtime environments a device can
//! present, each with its own entry/exit protocol, layered on top of-'s transports.

pub mod device_linux;
pub mod device_uboot;
pub mod live_linux;
pub mod live_uboot;

use crate::error::{Error, ErrorKind};
use crate::ocd::client::OcdClient;
use crate::ocd::server::OcdServer;
use crate::serial::line::SerialCommandLine;
use crate::ssh::SshCommandLine;
use crate::tftp::TftpServer;

/// A tag attached to the device recording which environment it currently presents.
/// Set on successful context entry; cleared on context exit or on any failure;
/// cleared on `hard_power_off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionContextKind
{
    LiveUboot,
    DeviceUboot,
    LiveLinux,
    DeviceLinux,
}

/// Resources an entered context may exclusively own for its lifetime.
/// Individual context variants populate only the fields their entry sequence acquires:
/// `LiveUboot` owns `ocd_client`/`ocd_server`/`tftp` in addition to `serial`; `DeviceUboot`
/// owns only `serial`; `DeviceLinux` owns `serial` and `ssh`.
#[derive(Default)]
pub struct ContextResources
{
    pub serial: Option<SerialCommandLine>,
    pub ssh: Option<SshCommandLine>,
    pub ocd_client: Option<OcdClient>,
    pub ocd_server: Option<OcdServer>,
    pub tftp: Option<TftpServer>,
}

impl ContextResources
{
    /// Releases owned resources in reverse-registration order:
    /// OCD client before OCD server, SSH before serial, TFTP last (it's keyed by the work
    /// directory rather than the transport handoff).
    pub async fn release(&mut self)
    {
        self.ssh.take();
        self.serial.take();
        if let Some(client) = self.ocd_client.take() {
            drop(client);
        }
        if let Some(mut server) = self.ocd_server.take() {
            server.terminate().await;
        }
        if let Some(mut tftp) = self.tftp.take() {
            tftp.shutdown().await;
        }
    }
}

/// Used by a context to guard against use after it has self-closed (`partition_mmc`,
/// `boot`, `bootm`) — "any further use of that instance fails `ContextExited`".
pub fn guard_not_exited(exited: bool) -> Result<(), Error>
{
    if exited {
        Err(ErrorKind::ContextExited.error())
    } else {
        Ok(())
    }
}
