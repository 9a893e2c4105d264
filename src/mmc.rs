// SPDX-License-Identifier: MIT OR Apache-2.0
//! The fixed MMC partition layout.

/// MMC sector size, in bytes.
pub const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition
{
    pub name: &'static str,
    /// Offset, in sectors, from the start of the device.
    pub offset_sectors: u64,
    /// Length, in sectors. `None` means "fills the remainder" (the `data` partition).
    pub length_sectors: Option<u64>,
}

impl Partition
{
    pub const SYSTEM0: Partition = Partition {
        name: "system0",
        offset_sectors: 0x22,
        length_sectors: Some(0x4B000),
    };

    pub const SYSTEM1: Partition = Partition {
        name: "system1",
        offset_sectors: 0x4B022,
        length_sectors: Some(0x4B000),
    };

    pub const CONFIG: Partition = Partition {
        name: "config",
        offset_sectors: 0x96022,
        length_sectors: Some(0x32000),
    };

    pub const DATA: Partition = Partition {
        name: "data",
        offset_sectors: 0x96022 + 0x32000,
        length_sectors: None,
    };

    pub fn offset_bytes(&self) -> u64
    {
        self.offset_sectors * SECTOR_SIZE
    }

    pub fn length_bytes(&self) -> Option<u64>
    {
        self.length_sectors.map(|sectors| sectors * SECTOR_SIZE)
    }

    /// The `gpt write mmc 0 "..."` partition table string literal for this partition,
    /// sized in MiB as U-boot's `gpt write` expects.
    fn gpt_entry(&self) -> String
    {
        let size_mib = self.length_sectors.map(|sectors| sectors * SECTOR_SIZE / (1024 * 1024));
        match size_mib {
            Some(mib) => format!("name={},size={}MiB", self.name, mib),
            None => format!("name={},size=0", self.name),
        }
    }
}

/// All four partitions, in on-disk order.
pub const ALL: [Partition; 4] = [Partition::SYSTEM0, Partition::SYSTEM1, Partition::CONFIG, Partition::DATA];

/// Build the `gpt write mmc 0 "..."` argument U-boot expects, e.g.
/// `name=system0,size=150MiB;name=system1,size=150MiB;name=config,size=100MiB;name=data,size=0`.
pub fn gpt_table() -> String
{
    ALL.iter().map(Partition::gpt_entry).collect::<Vec<_>>().join(";")
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn gpt_table_matches_spec_sizes()
    {
        let table = gpt_table();
        assert_eq!(
            table,
            "name=system0,size=150MiB;name=system1,size=150MiB;name=config,size=100MiB;name=data,size=0"
        );
    }

    #[test]
    fn data_partition_starts_after_config()
    {
        assert_eq!(Partition::DATA.offset_sectors, Partition::CONFIG.offset_sectors + Partition::CONFIG.length_sectors.unwrap());
        assert_eq!(Partition::DATA.length_sectors, None);
    }
}
