// SPDX-License-Identifier: MIT OR Apache-2.0
//! Linux device operations: stop services that hold the data partition open,
//! format it, and query the device's installed versions/clock/process table. The
//! electronics self-test (BBP) lives here too, since it only runs under `DeviceLinux`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::info;
use serde::Deserialize;
use tokio::time::{sleep, Duration};

use crate::condition::DeviceCondition;
use crate::device::Device;
use crate::error::{Error, ErrorKind};
use crate::serial::line::SerialCommandLine;
use crate::ssh::SshCommandLine;

/// Either command-line transport a Linux context may run commands over.
pub enum LinuxTransport<'a>
{
    Serial(&'a SerialCommandLine),
    Ssh(&'a SshCommandLine),
}

impl LinuxTransport<'_>
{
    pub async fn run(&self, command: &str) -> Result<String, Error>
    {
        match self {
            LinuxTransport::Serial(serial) => serial.run(command).await,
            LinuxTransport::Ssh(ssh) => ssh.run(command).await,
        }
    }
}

/// `umount /media/data` (rc ignored) + `yes | mkfs.ext4 -L data /dev/mmcblk0p4`.
pub async fn format_data_partition(device: &Device, transport: &LinuxTransport<'_>) -> Result<(), Error>
{
    info!("format data partition of MMC memory");
    transport.run_opts("umount /media/data", false).await?;
    transport.run("yes | mkfs.ext4 -L data /dev/mmcblk0p4").await?;
    device.degrade_condition(DeviceCondition::Used);
    Ok(())
}

impl LinuxTransport<'_>
{
    /// Like [`LinuxTransport::run`], but lets the caller tolerate a non-zero exit
    /// code (`umount` on an absent/already-unmounted partition).
    async fn run_opts(&self, command: &str, check_error_code: bool) -> Result<String, Error>
    {
        match self {
            LinuxTransport::Serial(serial) => serial.run_opts(command, check_error_code, true).await,
            LinuxTransport::Ssh(ssh) => {
                // The SSH command line always checks the exit code; fold a
                // non-zero exit into success here exactly as `check_error_code=false`
                // would on serial.
                if check_error_code {
                    ssh.run(command).await
                } else {
                    match ssh.run(command).await {
                        Ok(out) => Ok(out),
                        Err(err) if matches!(err.kind, ErrorKind::Command { .. }) => Ok(String::new()),
                        Err(err) => Err(err),
                    }
                }
            },
        }
    }
}

/// Stop-services order for the installed `DeviceLinux` image.
const DEVICE_LINUX_STOP_SERVICES: &[&str] = &[
    "/etc/init.d/S99monit stop",
    "/etc/init.d/S97dash stop",
    "/etc/init.d/S96staten stop",
    "/etc/init.d/S95mester stop",
    "/etc/init.d/S94baxter stop",
    "/etc/init.d/S93maskin stop",
    "/etc/init.d/S92cellmate stop",
    "/etc/init.d/S91frog stop",
    "/etc/init.d/S82telegraf stop",
    "/etc/init.d/S81influxdb stop",
    "/etc/init.d/S70swupdate stop",
    "/etc/init.d/S60crond stop",
    "[ -f /etc/init.d/S50nginx ] && /etc/init.d/S50nginx stop",
    "/etc/init.d/S01rsyslogd stop",
];

/// Stop all processes/mounts that may use the data partition, for the stateless live
/// image: unlike the installed `DeviceLinux` image, the live image runs only `syslog`,
/// so there's nothing else to stop; the data partition is held open by two
/// overlayfs mounts instead of a long service list, and those are unmounted rather
/// than stopped. Failures are ignored throughout, since the service or mount may
/// simply not be present.
pub async fn unbock_data_partition_live(transport: &LinuxTransport<'_>) -> Result<(), Error>
{
    info!("stop all services that may use the data partition");
    transport.run_opts("/etc/init.d/syslog stop", false).await?;
    info!("unmount overlayfs mounts that link to the data partition");
    transport.run_opts("umount /var/lib", false).await?;
    transport.run_opts("umount /var/log", false).await?;
    Ok(())
}

/// Stop-services order for the fuller installed-image service set.
pub async fn stop_services_device(transport: &LinuxTransport<'_>) -> Result<(), Error>
{
    info!("stop all services that may use the data partition");
    for command in DEVICE_LINUX_STOP_SERVICES {
        stop_one_service(transport, command).await?;
    }
    Ok(())
}

/// Run one stop-service command; the conditional `S50nginx` line is "expected to
/// return exit 0 except where noted" — the `[ -f ... ] &&` guard
/// itself exits non-zero when the service isn't installed, which isn't a failure.
async fn stop_one_service(transport: &LinuxTransport<'_>, command: &str) -> Result<String, Error>
{
    let check_error_code = !command.starts_with("[ -f ");
    transport.run_opts(command, check_error_code).await
}

/// Parse `/etc/sw-versions` into `{component: version}`, skipping malformed lines.
pub async fn get_versions(device: &Device, transport: &LinuxTransport<'_>) -> Result<HashMap<String, String>, Error>
{
    let raw = transport.run("cat /etc/sw-versions").await?;
    device.degrade_condition(DeviceCondition::AsNew);

    let mut result = HashMap::new();
    for line in raw.split('\n') {
        let words: Vec<&str> = line.trim().split(' ').collect();
        if words.len() != 2 {
            continue;
        }
        result.insert(words[0].to_string(), words[1].to_string());
    }
    Ok(result)
}

/// `date +%s`, parsed as a UTC timestamp.
pub async fn get_date(device: &Device, transport: &LinuxTransport<'_>) -> Result<DateTime<Utc>, Error>
{
    let raw = transport.run("date +%s").await?;
    device.degrade_condition(DeviceCondition::AsNew);

    let secs: i64 = raw
        .trim()
        .parse()
        .map_err(|e| ErrorKind::Protocol(format!("could not parse `date +%s` output {:?}: {}", raw, e)).error())?;
    DateTime::from_timestamp(secs, 0).ok_or_else(|| ErrorKind::Protocol(format!("timestamp {} out of range", secs)).error())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Process
{
    pub name: String,
    pub cmdline: Vec<String>,
}

const PRINT_PROCESSES_PY: &str = r#"
import psutil
import json

processes = {
    p.pid: p.as_dict(attrs=["name", "cmdline"])
    for p in psutil.process_iter()
}

print(json.dumps(processes))
"#;

/// Run an inline Python snippet that serializes `{pid: {name, cmdline}}` via `psutil`
/// and JSON-prints it. Only valid over SSH (`DeviceLinux`).
pub async fn get_processes(device: &Device, ssh: &SshCommandLine) -> Result<HashMap<u32, Process>, Error>
{
    let raw = ssh.run(&format!("python3 -c \"{}\"", PRINT_PROCESSES_PY.replace('"', "\\\""))).await?;
    device.degrade_condition(DeviceCondition::AsNew);
    serde_json::from_str(raw.trim()).map_err(Error::from)
}

/// `BbpState`: the on-device BBP task runner's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BbpState
{
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Deserialize)]
struct PartialBbpStatus
{
    state: BbpState,
}

#[derive(Debug, Clone, Deserialize)]
struct ElecRefData
{
    version: String,
    checks: Vec<ElecRefCheck>,
}

#[derive(Debug, Clone, Deserialize)]
struct ElecRefCheck
{
    freq: f64,
    site0: f64,
    site1: f64,
}

/// `(freq, site0, site1)` triples from `/media/config/individual/etc/electrical_test_reference.json`
///: version `"1.0.0"`, all three vectors equal length.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencySweep
{
    pub version: String,
    pub frequencies: Vec<f64>,
    pub site0: Vec<f64>,
    pub site1: Vec<f64>,
}

impl FrequencySweep
{
    const SUPPORTED_VERSION: &'static str = "1.0.0";

    fn from_elec_ref_data(data: ElecRefData) -> Result<Self, Error>
    {
        if data.version != Self::SUPPORTED_VERSION {
            return Err(ErrorKind::Validation(format!("unsupported electronics reference data version {:?}", data.version)).error());
        }
        let frequencies = data.checks.iter().map(|c| c.freq).collect();
        let site0 = data.checks.iter().map(|c| c.site0).collect();
        let site1 = data.checks.iter().map(|c| c.site1).collect();
        Ok(Self { version: data.version, frequencies, site0, site1 })
    }
}

/// Poll interval for the BBP status machine.
const BBP_POLL_INTERVAL: Duration = Duration::from_secs(2);

const START_BBP_PY: &str = r#"
from urllib.request import Request, urlopen
from urllib.error import HTTPError

req = Request(url="http://localhost:8082/tasks/program", method="DELETE")
try:
    with urlopen(req):
        pass
except HTTPError as exc:
    if exc.code != 404:
        raise

req = Request(
    url="http://localhost:8082/tasks/program",
    data="{program_name}".encode("utf-8"),
    method="PUT",
)
with urlopen(req):
    pass
"#;

const GET_BBP_STATUS_PY: &str = r#"
from urllib.request import Request, urlopen

req = Request(url="http://localhost:8082/tasks/program", method="GET")
with urlopen(req) as io:
    data = io.read()

print(data.decode("utf-8"))
"#;

/// POSTs (via an on-device Python snippet run over SSH, since the BBP task runner
/// binds `localhost:8082` on the device itself) a `DELETE` then `PUT` to start the
/// named program.
async fn start_bbp(ssh: &SshCommandLine, program_name: &str) -> Result<(), Error>
{
    let script = START_BBP_PY.replace("{program_name}", program_name).replace('"', "\\\"");
    ssh.run(&format!("python3 -c \"{}\"", script)).await?;
    Ok(())
}

async fn poll_bbp_status(ssh: &SshCommandLine) -> Result<BbpState, Error>
{
    let raw = ssh.run(&format!("python3 -c \"{}\"", GET_BBP_STATUS_PY.replace('"', "\\\""))).await?;
    let status: PartialBbpStatus = serde_json::from_str(raw.trim())?;
    Ok(status.state)
}

/// Run the BBP protocol end to end: start `electronics_reference.bbp`, poll every
/// 2 s until it's done, then read and parse the resulting reference data.
pub async fn set_electronics_reference(device: &Device, ssh: &SshCommandLine) -> Result<FrequencySweep, Error>
{
    start_bbp(ssh, "electronics_reference.bbp").await?;

    loop {
        match poll_bbp_status(ssh).await? {
            BbpState::Completed => break,
            BbpState::Failed => return Err(ErrorKind::ProgramFailed(String::from("failed")).error()),
            BbpState::Cancelled => return Err(ErrorKind::ProgramFailed(String::from("cancelled")).error()),
            BbpState::Idle | BbpState::Running => sleep(BBP_POLL_INTERVAL).await,
        }
    }

    let raw = ssh.run("cat /media/config/individual/etc/electrical_test_reference.json").await?;
    let data: ElecRefData = serde_json::from_str(raw.trim())?;
    device.degrade_condition(DeviceCondition::AsNew);
    FrequencySweep::from_elec_ref_data(data)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn sw_versions_skips_malformed_lines()
    {
        let raw = "firmware 3.2.0\nmalformed-line-with-no-space\nsoftware 1.0.0\n";
        let mut result = HashMap::new();
        for line in raw.split('\n') {
            let words: Vec<&str> = line.trim().split(' ').collect();
            if words.len() != 2 {
                continue;
            }
            result.insert(words[0].to_string(), words[1].to_string());
        }
        assert_eq!(result.get("firmware"), Some(&String::from("3.2.0")));
        assert_eq!(result.get("software"), Some(&String::from("1.0.0")));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn frequency_sweep_rejects_unsupported_version()
    {
        let data = ElecRefData {
            version: String::from("2.0.0"),
            checks: vec![ElecRefCheck { freq: 1.0, site0: 2.0, site1: 3.0 }],
        };
        assert!(FrequencySweep::from_elec_ref_data(data).is_err());
    }

    #[test]
    fn frequency_sweep_vectors_are_equal_length()
    {
        let data = ElecRefData {
            version: String::from("1.0.0"),
            checks: vec![
                ElecRefCheck { freq: 1.0, site0: 2.0, site1: 3.0 },
                ElecRefCheck { freq: 1.5, site0: 2.5, site1: 3.5 },
            ],
        };
        let sweep = FrequencySweep::from_elec_ref_data(data).unwrap();
        assert_eq!(sweep.frequencies.len(), sweep.site0.len());
        assert_eq!(sweep.site0.len(), sweep.site1.len());
    }

    #[test]
    fn bbp_state_deserializes_from_lowercase_json()
    {
        let status: PartialBbpStatus = serde_json::from_str(r#"{"state": "running", "extra": 1}"#).unwrap();
        assert_eq!(status.state, BbpState::Running);
    }
}
