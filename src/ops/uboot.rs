// SPDX-License-Identifier: MIT OR Apache-2.0
//! U-boot device operations, shared by the `LiveUboot` and `DeviceUboot`
//! execution contexts: flash erase/write, MMC partition/write, and the
//! network bring-up that backs both over TFTP.

use std::cell::Cell;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use log::info;

use crate::condition::DeviceCondition;
use crate::device::Device;
use crate::error::{Error, ErrorKind};
use crate::mmc::{self, Partition};
use crate::serial::line::SerialCommandLine;
use crate::work_dir::WorkDir;

/// Default scratch memory address.
pub const DEFAULT_MEMORY_ADDRESS: u64 = 0x6000000;

/// TFTP block/window size env vars U-boot is told to use; matches the values [`crate::tftp::DEFAULT_BLKSIZE`]/[`crate::tftp::DEFAULT_WINDOWSIZE`]
/// negotiate on the wire.
const TFTP_BLOCKSIZE: usize = crate::tftp::DEFAULT_BLKSIZE;
const TFTP_WINDOWSIZE: u16 = crate::tftp::DEFAULT_WINDOWSIZE;

/// Chunk size used to find sparse (all-zero) runs in firmware images.
const SPLIT_CHUNK_SIZE: usize = 1024 * 1024;

/// 16 MiB, the size of the `sf erase` region.
const FLASH_ERASE_SIZE: u64 = 16 * 1024 * 1024;

/// Either a literal address or the name of a U-boot environment variable holding one.
#[derive(Debug, Clone)]
pub enum MemoryAddress
{
    Literal(u64),
    Env(&'static str),
}

impl From<u64> for MemoryAddress
{
    fn from(value: u64) -> Self
    {
        MemoryAddress::Literal(value)
    }
}

/// One non-zero run split out of a sparse firmware image, staged under the work
/// directory so the TFTP server can serve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPart
{
    pub path: PathBuf,
    pub offset: u64,
}

/// Shared U-boot primitives layered over a [`SerialCommandLine`]. Both
/// `LiveUboot` and `DeviceUboot` embed one of these rather than duplicating the
/// network/flash bring-up logic.
pub struct UbootOps<'a>
{
    serial: &'a SerialCommandLine,
    work_dir: &'a WorkDir,
    tftp_host: IpAddr,
    tftp_port: u16,
    probed_flash: Cell<bool>,
    initialized_usb: Cell<bool>,
    initialized_network: Cell<bool>,
}

impl<'a> UbootOps<'a>
{
    pub fn new(serial: &'a SerialCommandLine, work_dir: &'a WorkDir, tftp_host: IpAddr, tftp_port: u16) -> Self
    {
        Self {
            serial,
            work_dir,
            tftp_host,
            tftp_port,
            probed_flash: Cell::new(false),
            initialized_usb: Cell::new(false),
            initialized_network: Cell::new(false),
        }
    }

    /// `sf probe` (cached): only probes on the first call.
    async fn probe_flash(&self) -> Result<(), Error>
    {
        if self.probed_flash.get() {
            return Ok(());
        }
        info!("probe FLASH memory");
        self.serial.run("sf probe").await?;
        self.probed_flash.set(true);
        Ok(())
    }

    /// `sf probe` + `sf erase 0 0x1000000`.
    pub async fn erase_flash(&self, device: &Device) -> Result<(), Error>
    {
        self.probe_flash().await?;
        info!("erase FLASH memory");
        self.serial.run(&format!("sf erase 0 {:#x}", FLASH_ERASE_SIZE)).await?;
        device.degrade_condition(DeviceCondition::Used);
        Ok(())
    }

    async fn write_memory_to_flash(&self, device: &Device, offset: u64, length: u64, address: &MemoryAddress) -> Result<(), Error>
    {
        let address_hex = self.resolve_memory_address_to_hex(address).await?;
        self.probe_flash().await?;
        info!("write memory at {} to FLASH (offset:{:#x} length:{:#x})", address_hex, offset, length);
        self.serial.run(&format!("sf write {} {:#x} {:#x}", address_hex, offset, length)).await?;
        device.degrade_condition(DeviceCondition::Used);
        Ok(())
    }

    /// Split `file` into non-null-byte runs, transfer each over TFTP to the scratch
    /// address, and flash it at its original offset.
    pub async fn write_image_to_flash(&self, device: &Device, file: &Path) -> Result<(), Error>
    {
        let parts = split_file(file, self.work_dir)?;
        for part in &parts {
            self.copy_to_memory(device, &part.path, None).await?;
            let length = std::fs::metadata(&part.path)?.len();
            self.write_memory_to_flash(device, part.offset, length, &MemoryAddress::Literal(DEFAULT_MEMORY_ADDRESS)).await?;
        }
        Ok(())
    }

    async fn write_memory_to_mmc(&self, device: &Device, partition: Partition, address: &MemoryAddress) -> Result<(), Error>
    {
        let address_hex = self.resolve_memory_address_to_hex(address).await?;
        let length = partition.length_sectors.ok_or_else(|| {
            ErrorKind::Validation(format!("partition {} has no fixed length to write", partition.name)).error()
        })?;
        info!("write memory at {} to \"{}\"", address_hex, partition.name);
        self.serial
            .run(&format!("mmc write {} {:#x} {:#x}", address_hex, partition.offset_sectors, length))
            .await?;
        device.degrade_condition(DeviceCondition::Used);
        Ok(())
    }

    /// Copy `file` once, then write it to each of `partitions`.
    pub async fn write_image_to_mmc(&self, device: &Device, file: &Path, partitions: &[Partition]) -> Result<(), Error>
    {
        self.copy_to_memory(device, file, None).await?;
        for &partition in partitions {
            self.write_memory_to_mmc(device, partition, &MemoryAddress::Literal(DEFAULT_MEMORY_ADDRESS)).await?;
        }
        Ok(())
    }

    /// `gpt write mmc 0 "..."`. The caller (the owning
    /// `DeviceUboot` context) is responsible for self-closing immediately after
    /// this returns, since U-boot won't recognize the new partitioning without a
    /// restart.
    pub async fn partition_mmc(&self, device: &Device) -> Result<(), Error>
    {
        info!("partition MMC memory");
        self.serial.run(&format!("gpt write mmc 0 \"{}\"", mmc::gpt_table())).await?;
        device.degrade_condition(DeviceCondition::Used);
        Ok(())
    }

    /// `setenv bootargs k1=v1 k2=v2 ...`.
    pub async fn set_boot_args(&self, device: &Device, args: &[(&str, &str)]) -> Result<(), Error>
    {
        let raw = args.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(" ");
        self.serial.run(&format!("setenv bootargs {}", raw)).await?;
        device.degrade_condition(DeviceCondition::AsNew);
        Ok(())
    }

    /// `run dualcopy_mmcboot` without waiting for a prompt;
    /// caller self-closes this context immediately after.
    pub async fn boot_to_device_os(&self, device: &Device) -> Result<(), Error>
    {
        self.serial.run_no_wait("run dualcopy_mmcboot").await?;
        device.degrade_condition(DeviceCondition::AsNew);
        Ok(())
    }

    /// Copy the bundled kernel and rootfs to their U-boot-reserved addresses, set
    /// `loglevel=0`, and `bootm` without waiting;
    /// caller self-closes this context immediately after.
    pub async fn boot_to_live_linux(&self, device: &Device, kernel_image: &Path, rootfs_image: &Path) -> Result<(), Error>
    {
        self.copy_to_memory(device, kernel_image, Some(MemoryAddress::Env("kernel_addr_r"))).await?;
        self.copy_to_memory(device, rootfs_image, Some(MemoryAddress::Env("ramdisk_addr_r"))).await?;
        self.set_boot_args(device, &[("loglevel", "0")]).await?;
        self.serial.run_no_wait("bootm ${kernel_addr_r} ${ramdisk_addr_r} ${fdtcontroladdr}").await?;
        device.degrade_condition(DeviceCondition::AsNew);
        Ok(())
    }

    /// Copy `file` to device memory over TFTP. `file` must be
    /// rooted in the shared work directory so the TFTP server can serve it.
    pub async fn copy_to_memory(&self, device: &Device, file: &Path, address: Option<MemoryAddress>) -> Result<(), Error>
    {
        if !self.work_dir.contains(file) {
            return Err(ErrorKind::Validation(format!("{} is not within the work directory", file.display())).error());
        }
        let address = address.unwrap_or(MemoryAddress::Literal(DEFAULT_MEMORY_ADDRESS));
        let address_hex = self.resolve_memory_address_to_hex(&address).await?;
        self.initialize_network().await?;
        info!("copy {} to device memory at {}", file.display(), address_hex);
        self.serial.run(&format!("tftpboot {} {}", address_hex, file.display())).await?;
        device.degrade_condition(DeviceCondition::AsNew);
        Ok(())
    }

    async fn resolve_memory_address_to_hex(&self, address: &MemoryAddress) -> Result<String, Error>
    {
        Ok(format!("{:#x}", self.resolve_memory_address(address).await?))
    }

    async fn resolve_memory_address(&self, address: &MemoryAddress) -> Result<u64, Error>
    {
        match address {
            MemoryAddress::Literal(value) => Ok(*value),
            MemoryAddress::Env(name) => {
                let hex = self.get_env(name).await?;
                u64::from_str_radix(hex.trim_start_matches("0x"), 16)
                    .map_err(|e| ErrorKind::Protocol(format!("could not parse env var {:?} as hex: {}", name, e)).error())
            },
        }
    }

    /// `printenv <name>`, stripping the `<name>=` prefix.
    pub async fn get_env(&self, name: &str) -> Result<String, Error>
    {
        let result = self.serial.run(&format!("printenv {}", name)).await?;
        let prefix = format!("{}=", name);
        result
            .strip_prefix(&prefix)
            .map(str::to_string)
            .ok_or_else(|| ErrorKind::Protocol(format!("printenv {} did not echo the expected prefix", name)).error())
    }

    /// `usb start` once, `dhcp` (rc ignored), then the `serverip`/`tftpdstp`/
    /// `tftpblocksize`/`tftpwindowsize`/`autostart` env vars.
    /// Only initializes on the first call.
    async fn initialize_network(&self) -> Result<(), Error>
    {
        if self.initialized_network.get() {
            return Ok(());
        }
        self.initialize_usb().await?;
        info!("initialize network on device");
        self.serial.run_opts("dhcp", false, true).await?;
        self.serial.run(&format!("setenv serverip {}", self.tftp_host)).await?;
        self.serial.run(&format!("setenv tftpdstp {}", self.tftp_port)).await?;
        self.serial.run(&format!("setenv tftpblocksize {}", TFTP_BLOCKSIZE)).await?;
        self.serial.run(&format!("setenv tftpwindowsize {}", TFTP_WINDOWSIZE)).await?;
        self.serial.run("setenv autostart no").await?;
        self.initialized_network.set(true);
        Ok(())
    }

    async fn initialize_usb(&self) -> Result<(), Error>
    {
        if self.initialized_usb.get() {
            return Ok(());
        }
        self.serial.run("usb start").await?;
        self.initialized_usb.set(true);
        Ok(())
    }
}

/// Split `file` into non-zero runs at 1 MiB chunk granularity. Each run is written to `<orig>__offset_<byte_offset>.bin`
/// under `work_dir`.
pub fn split_file(file: &Path, work_dir: &WorkDir) -> Result<Vec<FlashPart>, Error>
{
    let data = std::fs::read(file)?;
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ErrorKind::Validation(format!("{} has no usable file name", file.display())).error())?;

    let mut parts = Vec::new();
    let mut current: Option<(u64, Vec<u8>)> = None;

    for (index, chunk) in data.chunks(SPLIT_CHUNK_SIZE).enumerate() {
        let offset = (index * SPLIT_CHUNK_SIZE) as u64;
        if chunk.iter().all(|&b| b == 0) {
            if let Some((start, bytes)) = current.take() {
                parts.push(flush_part(work_dir, file_name, start, bytes)?);
            }
            continue;
        }

        match &mut current {
            Some((_, bytes)) => bytes.extend_from_slice(chunk),
            None => current = Some((offset, chunk.to_vec())),
        }
    }
    if let Some((start, bytes)) = current.take() {
        parts.push(flush_part(work_dir, file_name, start, bytes)?);
    }

    Ok(parts)
}

fn flush_part(work_dir: &WorkDir, file_name: &str, offset: u64, bytes: Vec<u8>) -> Result<FlashPart, Error>
{
    let name = format!("{}__offset_{}.bin", file_name, offset);
    let path = work_dir.join(&name);
    std::fs::write(&path, &bytes)?;
    Ok(FlashPart { path, offset })
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn split_file_of_all_zeros_produces_no_parts()
    {
        let dir = tempdir();
        let work_dir = WorkDir::new(dir.clone());
        let file = work_dir.join("all_zero.bin");
        std::fs::write(&file, vec![0u8; SPLIT_CHUNK_SIZE * 3]).unwrap();

        let parts = split_file(&file, &work_dir).unwrap();
        assert!(parts.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn split_file_concatenates_consecutive_nonzero_chunks()
    {
        let dir = tempdir();
        let work_dir = WorkDir::new(dir.clone());
        let file = work_dir.join("sparse.bin");

        let mut data = vec![0u8; SPLIT_CHUNK_SIZE]; // chunk 0: zero (separator)
        data.extend(vec![0xAAu8; SPLIT_CHUNK_SIZE]); // chunk 1: non-zero
        data.extend(vec![0xBBu8; SPLIT_CHUNK_SIZE]); // chunk 2: non-zero, contiguous with chunk 1
        data.extend(vec![0u8; SPLIT_CHUNK_SIZE]); // chunk 3: zero (separator)
        std::fs::write(&file, &data).unwrap();

        let parts = split_file(&file, &work_dir).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].offset, SPLIT_CHUNK_SIZE as u64);
        let written = std::fs::read(&parts[0].path).unwrap();
        assert_eq!(written.len(), SPLIT_CHUNK_SIZE * 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> std::path::PathBuf
    {
        let dir = std::env::temp_dir().join(format!("reset-engine-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
