// SPDX-License-Identifier: MIT OR Apache-2.0
//! The serial command line: a dedicated reader thread splits the UART byte
//! stream on a configurable prompt string; `run`/`force_prompt`/`wait_for_prompt` build
//! on top of the resulting response queue.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::timeout;

use crate::error::{Error, ErrorKind};

pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Per-attempt deadline for `force_prompt`'s `echo N` spam.
pub const FORCE_PROMPT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// UART console owned exclusively by one execution context for its lifetime. Cloning the prompt handle lets a context swap prompts in place
/// (`DeviceLinux` uses the login prompt, then the shell prompt, on the same line).
pub struct SerialCommandLine
{
    tty: PathBuf,
    prompt: Arc<StdMutex<String>>,
    write_file: AsyncMutex<File>,
    responses_rx: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    stop: Arc<AtomicBool>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl SerialCommandLine
{
    pub fn open(tty: &Path, prompt: impl Into<String>, baud_rate: u32) -> Result<Self, Error>
    {
        let read_file = File::options()
            .read(true)
            .write(true)
            .open(tty)
            .map_err(|e| ErrorKind::Protocol(format!("failed to open {}: {}", tty.display(), e)).error_from(e))?;
        let write_file = read_file.try_clone()?;
        configure_raw(&read_file, baud_rate)?;

        let prompt = Arc::new(StdMutex::new(prompt.into()));
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));

        let reader_prompt = prompt.clone();
        let reader_stop = stop.clone();
        let reader_tty = tty.to_path_buf();
        let reader = std::thread::Builder::new()
            .name(String::from("serial-reader"))
            .spawn(move || read_loop(read_file, reader_prompt, tx, reader_stop, reader_tty))
            .map_err(|e| ErrorKind::Protocol(format!("failed to spawn serial reader thread: {}", e)).error())?;

        info!("opened serial connection on {}", tty.display());

        Ok(Self {
            tty: tty.to_path_buf(),
            prompt,
            write_file: AsyncMutex::new(write_file),
            responses_rx: AsyncMutex::new(rx),
            stop,
            reader: Some(reader),
        })
    }

    pub fn tty(&self) -> &Path
    {
        &self.tty
    }

    /// Swap the prompt this line splits responses on.
    pub fn set_prompt(&self, prompt: impl Into<String>)
    {
        *self.prompt.lock().unwrap() = prompt.into();
    }

    pub fn prompt(&self) -> String
    {
        self.prompt.lock().unwrap().clone()
    }

    /// Send `s + "\n"` atomically under the serial write lock.
    pub async fn write_line(&self, text: &str) -> Result<(), Error>
    {
        let mut file = self.write_file.lock().await;
        let line = format!("{}\n", text);
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    async fn run_nowait(&self, command: &str) -> Result<(), Error>
    {
        if command.contains('\n') {
            return Err(ErrorKind::Validation(String::from("command can't contain end-line characters")).error());
        }
        self.write_line(command).await
    }

    /// Send `command` without awaiting a response.
    pub async fn run_no_wait(&self, command: &str) -> Result<(), Error>
    {
        self.run_nowait(command).await
    }

    /// Receive one response, then drain any further queued responses, returning the last.
    pub async fn wait_for_prompt(&self) -> Result<String, Error>
    {
        let mut rx = self.responses_rx.lock().await;
        let mut result = rx
            .recv()
            .await
            .ok_or_else(|| ErrorKind::Protocol(String::from("serial reader thread exited")).error())?;
        while let Ok(next) = rx.try_recv() {
            result = next;
        }
        Ok(result)
    }

    pub async fn run(&self, command: &str) -> Result<String, Error>
    {
        self.run_opts(command, true, true).await
    }

    /// `run(cmd, check_error_code, strip_trailing_ws)`.
    pub async fn run_opts(&self, command: &str, check_error_code: bool, strip_trailing_ws: bool) -> Result<String, Error>
    {
        self.run_nowait(command).await?;
        let resp = self.wait_for_prompt().await?;

        let echoed = format!("{}\r\n", command);
        let mut resp = resp
            .strip_prefix(echoed.as_str())
            .ok_or_else(|| ErrorKind::Protocol(format!("could not send command {:?}", command)).error())?
            .to_string();

        if strip_trailing_ws {
            let trimmed_len = resp.trim_end_matches(['\r', '\n']).len();
            resp.truncate(trimmed_len);
        }

        if !check_error_code {
            return Ok(resp);
        }

        let code = Box::pin(self.run_opts("echo $?", false, true)).await?;
        let code: i32 = code.trim().parse().unwrap_or(-1);
        if code != 0 {
            return Err(ErrorKind::Command { code }.error());
        }

        Ok(resp)
    }

    /// Interrupt a boot sequence by spamming `echo N` under a short per-attempt deadline
    /// until the response matches `N`.
    pub async fn force_prompt(&self, per_attempt_timeout: Duration) -> Result<(), Error>
    {
        for i in 0u64.. {
            let cmd = format!("echo {}", i);
            let attempt = timeout(per_attempt_timeout, self.run_opts(&cmd, false, true)).await;
            let resp = match attempt {
                Ok(Ok(resp)) => resp,
                _ => continue,
            };
            if resp == i.to_string() {
                return Ok(());
            }
            debug!("force_prompt: invalid response {:?} != {}", resp, i);
        }
        unreachable!("0u64.. never terminates")
    }

    /// `force_prompt` with the default per-attempt timeout.
    pub async fn force_prompt_default(&self) -> Result<(), Error>
    {
        self.force_prompt(FORCE_PROMPT_ATTEMPT_TIMEOUT).await
    }
}

impl Drop for SerialCommandLine
{
    fn drop(&mut self)
    {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

fn read_loop(mut file: File, prompt: Arc<StdMutex<String>>, tx: mpsc::UnboundedSender<String>, stop: Arc<AtomicBool>, tty: PathBuf)
{
    let mut buffer = String::new();
    let mut chunk = [0u8; 4096];

    while !stop.load(Ordering::Relaxed) {
        let n = match file.read(&mut chunk) {
            // VTIME elapsed with no data available; loop and check `stop` again.
            Ok(0) => continue,
            Ok(n) => n,
            Err(err) => {
                warn!("serial read error on {}: {}", tty.display(), err);
                break;
            },
        };

        match std::str::from_utf8(&chunk[..n]) {
            Ok(text) => buffer.push_str(text),
            Err(_) => {
                warn!("could not decode data from {}, skipping", tty.display());
                continue;
            },
        }

        let current_prompt = prompt.lock().unwrap().clone();
        if current_prompt.is_empty() {
            continue;
        }

        while let Some(pos) = buffer.find(&current_prompt) {
            let end = pos + current_prompt.len();
            let response: String = buffer.drain(..end).collect();
            let response = response[..response.len() - current_prompt.len()].to_string();
            if tx.send(response).is_err() {
                return;
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
fn configure_raw(file: &File, baud_rate: u32) -> Result<(), Error>
{
    #[cfg(any(target_os = "linux", target_os = "android"))]
    use termios::os::linux::CRTSCTS;
    #[cfg(target_os = "macos")]
    use termios::os::macos::CRTSCTS;
    use termios::*;

    let fd = file.as_raw_fd();
    let mut attrs = Termios::from_fd(fd)?;

    let speed = match baud_rate {
        9600 => B9600,
        19200 => B19200,
        38400 => B38400,
        57600 => B57600,
        115200 => B115200,
        other => return Err(ErrorKind::Validation(format!("unsupported baud rate {}", other)).error()),
    };
    cfsetspeed(&mut attrs, speed)?;

    attrs.c_cflag &= !(CSIZE | CSTOPB | CRTSCTS);
    attrs.c_cflag |= CS8 | CLOCAL | CREAD;
    attrs.c_iflag &= !(IGNBRK | IXON | IXOFF | IXANY);
    attrs.c_lflag = 0;
    attrs.c_oflag = 0;
    // Non-blocking reads with a 0.5 s timeout.
    attrs.c_cc[VMIN] = 0;
    attrs.c_cc[VTIME] = 5;

    tcsetattr(fd, TCSANOW, &attrs)?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
fn configure_raw(_file: &File, _baud_rate: u32) -> Result<(), Error>
{
    Err(ErrorKind::Validation(String::from("serial control is unavailable on this host")).error())
}

#[cfg(all(test, unix))]
mod tests
{
    use super::*;
    use std::ffi::CStr;
    use std::os::fd::FromRawFd;

    /// Allocates a PTY pair and returns (master, slave path). The master is kept
    /// alive by the caller for the test's duration so the slave isn't hung up from
    /// under `SerialCommandLine::open`.
    fn open_test_pty() -> (File, PathBuf)
    {
        unsafe {
            let master_fd = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
            assert!(master_fd >= 0, "posix_openpt failed");
            assert_eq!(libc::grantpt(master_fd), 0, "grantpt failed");
            assert_eq!(libc::unlockpt(master_fd), 0, "unlockpt failed");
            let name = libc::ptsname(master_fd);
            assert!(!name.is_null(), "ptsname failed");
            let slave_path = PathBuf::from(CStr::from_ptr(name).to_str().expect("ptsname is not valid UTF-8"));
            (File::from_raw_fd(master_fd), slave_path)
        }
    }

    #[tokio::test]
    async fn run_no_wait_rejects_embedded_newline()
    {
        let (_master, slave) = open_test_pty();
        let line = SerialCommandLine::open(&slave, "x> ", DEFAULT_BAUD_RATE).unwrap();

        let result = line.run_no_wait("echo one\necho two").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn set_prompt_swaps_without_recreating_the_line()
    {
        let (_master, slave) = open_test_pty();
        let line = SerialCommandLine::open(&slave, "a> ", DEFAULT_BAUD_RATE).unwrap();
        assert_eq!(line.prompt(), "a> ");

        line.set_prompt("b> ");
        assert_eq!(line.prompt(), "b> ");
    }
}
