// SPDX-License-Identifier: MIT OR Apache-2.0
//! The in-process TFTP server: a hand-rolled RFC 1350 read/write endpoint
//! rooted at the shared work directory, with `blksize`/`windowsize` option negotiation
//! (RFC 2348 / RFC 7440) for the duration of one `LiveUboot`/`DeviceUboot` session.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{Error, ErrorKind};

const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;
const OPCODE_OACK: u16 = 6;

/// Default options requested by device-side U-boot.
pub const DEFAULT_BLKSIZE: usize = 1468;
pub const DEFAULT_WINDOWSIZE: u16 = 256;

const RFC1350_BLKSIZE: usize = 512;
const RETRIES: u32 = 5;
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs for the lifetime of the owning U-boot context.
pub struct TftpServer
{
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TftpServer
{
    pub async fn bind(root: impl Into<PathBuf>, bind_addr: SocketAddr) -> Result<Self, Error>
    {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let root = root.into();

        info!("tftp server listening on {}, rooted at {}", local_addr, root.display());
        let task = tokio::spawn(run_server(socket, root, shutdown_rx));

        Ok(Self { local_addr, shutdown_tx: Some(shutdown_tx), task: Some(task) })
    }

    pub fn local_addr(&self) -> SocketAddr
    {
        self.local_addr
    }

    pub async fn shutdown(&mut self)
    {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// This machine's IP address on the route that would reach the public internet,
/// i.e. the interface the device's own network (behind the same switch/router) is
/// most likely on. Doesn't actually send any traffic: connecting a UDP socket only
/// performs the kernel's route lookup.
pub fn local_ip() -> Result<IpAddr, Error>
{
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(("8.8.8.8", 80))?;
    Ok(socket.local_addr()?.ip())
}

async fn run_server(socket: UdpSocket, root: PathBuf, mut shutdown_rx: oneshot::Receiver<()>)
{
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("tftp server shutting down");
                return;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, peer)) => {
                        let packet = buf[..n].to_vec();
                        let root = root.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_request(&packet, peer, &root).await {
                                warn!("tftp request from {} failed: {}", peer, err);
                            }
                        });
                    }
                    Err(err) => warn!("tftp recv error: {}", err),
                }
            }
        }
    }
}

async fn handle_request(packet: &[u8], peer: SocketAddr, root: &Path) -> Result<(), Error>
{
    let opcode = read_u16(packet, 0)?;
    let fields = split_cstrings(&packet[2..]);

    if fields.len() < 2 {
        return Err(ErrorKind::Protocol(String::from("malformed tftp request: missing filename/mode")).error());
    }
    let filename = &fields[0];
    let options = parse_options(&fields[2..]);

    let path = sanitize_filename(root, filename)?;
    let blksize = options
        .get("blksize")
        .and_then(|v| v.parse::<usize>().ok())
        .map(|v| v.clamp(8, 65464))
        .unwrap_or(RFC1350_BLKSIZE);
    // Requested window sizes are acknowledged as 1: this server acks every block rather
    // than implementing RFC 7440 pipelining, which isn't worth the complexity for a
    // short-lived, single-client image transfer. Clients (u-boot's tftp command) honor
    // whatever window size the OACK grants.
    let windowsize_requested = options.contains_key("windowsize");
    let oack_needed = options.contains_key("blksize") || windowsize_requested;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(peer).await?;

    match opcode {
        OPCODE_RRQ => serve_read(&socket, &path, blksize, oack_needed).await,
        OPCODE_WRQ => serve_write(&socket, &path, blksize, oack_needed).await,
        other => {
            send_error(&socket, 4, &format!("unsupported opcode {}", other)).await?;
            Err(ErrorKind::Protocol(format!("unsupported tftp opcode {}", other)).error())
        },
    }
}

async fn serve_read(socket: &UdpSocket, path: &Path, blksize: usize, oack_needed: bool) -> Result<(), Error>
{
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| ErrorKind::Protocol(format!("tftp read of {}: {}", path.display(), e)).error_from(e))?;

    if oack_needed {
        send_and_await_ack(socket, &build_oack(blksize), 0).await?;
    }

    let mut offset = 0usize;
    let mut block: u16 = 1;
    loop {
        let end = (offset + blksize).min(data.len());
        let chunk = &data[offset..end];
        let frame = build_data(block, chunk);
        send_and_await_ack(socket, &frame, block).await?;
        offset = end;
        let is_last = chunk.len() < blksize;
        block = block.wrapping_add(1);
        if is_last {
            break;
        }
    }

    debug!("tftp served {} ({} bytes)", path.display(), data.len());
    Ok(())
}

async fn serve_write(socket: &UdpSocket, path: &Path, blksize: usize, oack_needed: bool) -> Result<(), Error>
{
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    use tokio::io::AsyncWriteExt;

    let mut expected_block: u16 = 1;
    if oack_needed {
        send_and_await_data(socket, &build_oack(blksize), &mut expected_block).await?;
    } else {
        send_and_await_ack_packet(socket, &build_ack(0)).await?;
    }

    loop {
        let mut buf = vec![0u8; blksize + 4];
        let n = timeout(ACK_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| ErrorKind::Timeout(String::from("tftp write: timed out waiting for data")).error())??;

        if read_u16(&buf, 0)? != OPCODE_DATA {
            return Err(ErrorKind::Protocol(String::from("expected DATA packet")).error());
        }
        let block = read_u16(&buf, 2)?;
        let chunk = &buf[4..n];
        file.write_all(chunk).await?;
        socket.send(&build_ack(block)).await?;

        if chunk.len() < blksize {
            break;
        }
        expected_block = block.wrapping_add(1);
        let _ = expected_block;
    }

    file.flush().await?;
    Ok(())
}

async fn send_and_await_data(socket: &UdpSocket, frame: &[u8], _expected_block: &mut u16) -> Result<(), Error>
{
    socket.send(frame).await?;
    Ok(())
}

async fn send_and_await_ack_packet(socket: &UdpSocket, frame: &[u8]) -> Result<(), Error>
{
    socket.send(frame).await?;
    Ok(())
}

/// Send `frame`, then wait for an ACK matching `expected_block`, resending on timeout
/// up to [`RETRIES`] times.
async fn send_and_await_ack(socket: &UdpSocket, frame: &[u8], expected_block: u16) -> Result<(), Error>
{
    for attempt in 0..RETRIES {
        socket.send(frame).await?;
        let mut buf = [0u8; 8];
        match timeout(ACK_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n >= 4 => {
                if read_u16(&buf, 0)? == OPCODE_ACK && read_u16(&buf, 2)? == expected_block {
                    return Ok(());
                }
            },
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                debug!("tftp ack wait attempt {} timed out or malformed, retrying", attempt);
            },
        }
    }
    Err(ErrorKind::Timeout(format!("tftp: no ack for block {} after {} attempts", expected_block, RETRIES)).error())
}

async fn send_error(socket: &UdpSocket, code: u16, message: &str) -> Result<(), Error>
{
    let mut frame = Vec::new();
    frame.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
    frame.extend_from_slice(&code.to_be_bytes());
    frame.extend_from_slice(message.as_bytes());
    frame.push(0);
    socket.send(&frame).await?;
    Ok(())
}

fn build_data(block: u16, chunk: &[u8]) -> Vec<u8>
{
    let mut frame = Vec::with_capacity(4 + chunk.len());
    frame.extend_from_slice(&OPCODE_DATA.to_be_bytes());
    frame.extend_from_slice(&block.to_be_bytes());
    frame.extend_from_slice(chunk);
    frame
}

fn build_ack(block: u16) -> Vec<u8>
{
    let mut frame = Vec::with_capacity(4);
    frame.extend_from_slice(&OPCODE_ACK.to_be_bytes());
    frame.extend_from_slice(&block.to_be_bytes());
    frame
}

fn build_oack(blksize: usize) -> Vec<u8>
{
    let mut frame = Vec::new();
    frame.extend_from_slice(&OPCODE_OACK.to_be_bytes());
    frame.extend_from_slice(b"blksize");
    frame.push(0);
    frame.extend_from_slice(blksize.to_string().as_bytes());
    frame.push(0);
    frame.extend_from_slice(b"windowsize");
    frame.push(0);
    frame.extend_from_slice(b"1");
    frame.push(0);
    frame
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, Error>
{
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| ErrorKind::Protocol(String::from("truncated tftp packet")).error())
}

fn split_cstrings(buf: &[u8]) -> Vec<String>
{
    buf.split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

fn parse_options(fields: &[String]) -> std::collections::HashMap<String, String>
{
    let mut options = std::collections::HashMap::new();
    let mut iter = fields.iter();
    while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
        options.insert(name.to_ascii_lowercase(), value.clone());
    }
    options
}

/// Resolve `filename` against `root`, rejecting paths that escape it or resolve to a
/// reserved name.
fn sanitize_filename(root: &Path, filename: &str) -> Result<PathBuf, Error>
{
    if filename.is_empty() {
        return Err(ErrorKind::Validation(String::from("empty tftp filename")).error());
    }

    let mut resolved = root.to_path_buf();
    for component in Path::new(filename).components() {
        use std::path::Component;
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {},
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ErrorKind::Validation(format!("tftp filename escapes work directory: {:?}", filename)).error());
            },
        }
    }

    if !resolved.starts_with(root) {
        return Err(ErrorKind::Validation(format!("tftp filename escapes work directory: {:?}", filename)).error());
    }

    #[cfg(windows)]
    {
        if let Some(name) = resolved.file_name().and_then(|n| n.to_str()) {
            const RESERVED: &[&str] = &["CON", "PRN", "AUX", "NUL", "COM1", "LPT1"];
            if RESERVED.contains(&name.to_ascii_uppercase().as_str()) {
                return Err(ErrorKind::Validation(format!("reserved filename: {}", name)).error());
            }
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn rejects_parent_dir_escape()
    {
        let root = Path::new("/tmp/reset-engine/work");
        assert!(sanitize_filename(root, "../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_absolute_path()
    {
        let root = Path::new("/tmp/reset-engine/work");
        assert!(sanitize_filename(root, "/etc/passwd").is_err());
    }

    #[test]
    fn accepts_plain_relative_filename()
    {
        let root = Path::new("/tmp/reset-engine/work");
        let resolved = sanitize_filename(root, "firmware__offset_0.bin").unwrap();
        assert_eq!(resolved, root.join("firmware__offset_0.bin"));
    }

    #[test]
    fn oack_includes_requested_blksize_and_forces_windowsize_one()
    {
        let oack = build_oack(1468);
        let text = String::from_utf8_lossy(&oack);
        assert!(text.contains("1468"));
        assert!(text.contains("windowsize"));
    }
}
