// SPDX-License-Identifier: MIT OR Apache-2.0
//! `Client` speaks OpenOCD's line-oriented TCL RPC protocol: one `\x1a` byte frames
//! both the request and the response.
//!
//! See <http://openocd.org/doc/html/Tcl-Scripting-API.html>.

use log::warn;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, ErrorKind};

const SEPARATOR: u8 = 0x1a;

/// OpenOCD's default TCL RPC port.
pub const DEFAULT_TCL_PORT: u16 = 6666;

pub struct OcdClient
{
    stream: TcpStream,
}

impl OcdClient
{
    pub async fn connect(host: &str, port: u16) -> Result<Self, Error>
    {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ErrorKind::Protocol(format!("failed to connect to openocd tcl port {}:{}: {}", host, port, e)).error_from(e))?;
        Ok(Self { stream })
    }

    /// Send `cmd + \x1a` and receive until `\x1a`. Multiple framed responses arriving in
    /// one read are a warning; the first frame is used.
    pub async fn run(&mut self, cmd: &str) -> Result<String, Error>
    {
        let mut request = cmd.as_bytes().to_vec();
        request.push(SEPARATOR);
        self.stream.write_all(&request).await?;

        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.stream.read(&mut byte).await?;
            if n == 0 {
                return Err(ErrorKind::Protocol(String::from("openocd tcl connection closed before a response frame")).error());
            }
            if byte[0] == SEPARATOR {
                break;
            }
            buf.push(byte[0]);
        }

        // Best-effort check for a second frame already buffered in the kernel socket;
        // if the peer sent more than one `\x1a`-terminated response in this read, warn
        // and keep only the first.
        let mut peek = [0u8; 1];
        if let Ok(Ok(1)) = tokio::time::timeout(std::time::Duration::from_millis(5), self.stream.read(&mut peek)).await {
            warn!("openocd tcl client received more than one framed response; using the first");
        }

        String::from_utf8(buf).map_err(|e| ErrorKind::Protocol(format!("could not decode openocd tcl response: {}", e)).error())
    }
}
