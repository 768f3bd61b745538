//! Block device registry
//!
//! A fixed-capacity table of named block devices. Disks register a
//! sector-read capability; partitions clone their parent's capability
//! and record their extents, and reads on a partition are offset by its
//! start LBA before reaching the controller.
//!
//! Partition names append the 1-based index to the parent name
//! (`sda` -> `sda1`).

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Sector size assumed by the registry.
pub const SECTOR_SIZE: usize = 512;

/// Capacity of the block table.
const MAX_BLOCKS: usize = 8;

/// Raw sector reads from one disk-like device.
pub trait SectorRead: Send + Sync {
    fn read_sectors(&self, lba: u64, count: u16, out: &mut [u8]) -> KernelResult<()>;
}

struct BlockEntry {
    name: String,
    target: Arc<dyn SectorRead>,
    start_lba: u64,
    sectors: u64,
    is_partition: bool,
}

/// An opened block device: the resolved capability plus the partition
/// base that every read is offset by.
#[derive(Clone)]
pub struct BlockDev {
    target: Arc<dyn SectorRead>,
    start_lba: u64,
}

impl BlockDev {
    /// Read `count` sectors at partition-relative `lba`.
    pub fn read_sectors(&self, lba: u64, count: u16, out: &mut [u8]) -> KernelResult<()> {
        self.target.read_sectors(self.start_lba + lba, count, out)
    }
}

/// The registry proper; global instance below, local instances in tests.
pub struct BlockRegistry {
    entries: Vec<BlockEntry>,
}

impl BlockRegistry {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn find(&self, name: &str) -> Option<&BlockEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Register a whole disk.
    pub fn register_disk(&mut self, name: &str, target: Arc<dyn SectorRead>) -> KernelResult<()> {
        if self.entries.len() >= MAX_BLOCKS {
            return Err(KernelError::ResourceExhausted {
                resource: "block device",
            });
        }
        self.entries.push(BlockEntry {
            name: String::from(name),
            target,
            start_lba: 0,
            sectors: 0,
            is_partition: false,
        });
        log::info!("[BLOCK] registered disk {}", name);
        Ok(())
    }

    /// Register partition `index` (1-based) of `disk_name`, copying the
    /// parent's controller capability.
    pub fn register_partition(
        &mut self,
        disk_name: &str,
        index: usize,
        start_lba: u64,
        sectors: u64,
    ) -> KernelResult<()> {
        if self.entries.len() >= MAX_BLOCKS {
            return Err(KernelError::ResourceExhausted {
                resource: "block device",
            });
        }
        let parent = self.find(disk_name).ok_or(KernelError::NotFound {
            resource: "parent disk",
        })?;
        let target = parent.target.clone();

        let mut name = String::from(disk_name);
        name.push((b'0' + index as u8) as char);
        log::info!(
            "[BLOCK] registered partition {} start={} count={}",
            name,
            start_lba,
            sectors
        );
        self.entries.push(BlockEntry {
            name,
            target,
            start_lba,
            sectors,
            is_partition: true,
        });
        Ok(())
    }

    /// Resolve a device by name into a read handle.
    pub fn open(&self, name: &str) -> Option<BlockDev> {
        self.find(name).map(|e| BlockDev {
            target: e.target.clone(),
            start_lba: e.start_lba,
        })
    }

    /// Read sectors from a named device, partition-relative.
    pub fn read(&self, name: &str, lba: u64, count: u16, out: &mut [u8]) -> KernelResult<()> {
        let dev = self.open(name).ok_or(KernelError::NotFound {
            resource: "block device",
        })?;
        dev.read_sectors(lba, count, out)
    }

    /// Partition extents; errors for whole disks and unknown names.
    pub fn get_partition(&self, name: &str) -> KernelResult<(u64, u64)> {
        let entry = self.find(name).ok_or(KernelError::NotFound {
            resource: "block device",
        })?;
        if !entry.is_partition {
            return Err(KernelError::NotFound {
                resource: "partition",
            });
        }
        Ok((entry.start_lba, entry.sectors))
    }
}

static BLOCKS: Mutex<BlockRegistry> = Mutex::new(BlockRegistry::new());

pub fn register_disk(name: &str, target: Arc<dyn SectorRead>) -> KernelResult<()> {
    BLOCKS.lock().register_disk(name, target)
}

pub fn register_partition(
    disk_name: &str,
    index: usize,
    start_lba: u64,
    sectors: u64,
) -> KernelResult<()> {
    BLOCKS
        .lock()
        .register_partition(disk_name, index, start_lba, sectors)
}

pub fn open(name: &str) -> Option<BlockDev> {
    BLOCKS.lock().open(name)
}

pub fn read(name: &str, lba: u64, count: u16, out: &mut [u8]) -> KernelResult<()> {
    let dev = BLOCKS.lock().open(name);
    match dev {
        Some(dev) => dev.read_sectors(lba, count, out),
        None => {
            log::warn!("[BLOCK] read on missing device {}", name);
            Err(KernelError::NotFound {
                resource: "block device",
            })
        }
    }
}

pub fn get_partition(name: &str) -> KernelResult<(u64, u64)> {
    BLOCKS.lock().get_partition(name)
}

/// RAM-backed sector device for tests and ramdisks.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn from_sectors(sectors: usize) -> Self {
        Self::new(alloc::vec![0u8; sectors * SECTOR_SIZE])
    }

    /// Write bytes at an absolute byte offset (test image construction).
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl SectorRead for RamDisk {
    fn read_sectors(&self, lba: u64, count: u16, out: &mut [u8]) -> KernelResult<()> {
        let data = self.data.lock();
        let start = lba as usize * SECTOR_SIZE;
        let len = count as usize * SECTOR_SIZE;
        if out.len() < len || start + len > data.len() {
            return Err(KernelError::InvalidArgument { name: "lba" });
        }
        out[..len].copy_from_slice(&data[start..start + len]);
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// Records every LBA requested, for asserting the partition offset.
    struct RecordingTarget {
        requests: Mutex<Vec<u64>>,
    }

    impl SectorRead for RecordingTarget {
        fn read_sectors(&self, lba: u64, _count: u16, out: &mut [u8]) -> KernelResult<()> {
            self.requests.lock().push(lba);
            out.fill(0);
            Ok(())
        }
    }

    #[test]
    fn partition_reads_are_offset_by_start_lba() {
        let mut registry = BlockRegistry::new();
        let target = Arc::new(RecordingTarget {
            requests: Mutex::new(Vec::new()),
        });
        registry.register_disk("sda", target.clone()).unwrap();
        registry.register_partition("sda", 1, 2048, 200_000).unwrap();

        let mut buf = [0u8; SECTOR_SIZE];
        registry.read("sda1", 10, 1, &mut buf).unwrap();
        registry.read("sda", 10, 1, &mut buf).unwrap();

        let requests = target.requests.lock();
        assert_eq!(&*requests, &[2058, 10]);
    }

    #[test]
    fn partition_names_append_the_index() {
        let mut registry = BlockRegistry::new();
        let target = Arc::new(RamDisk::from_sectors(16));
        registry.register_disk("sdb", target).unwrap();
        registry.register_partition("sdb", 3, 4, 8).unwrap();

        assert_eq!(registry.get_partition("sdb3").unwrap(), (4, 8));
        assert!(registry.get_partition("sdb").is_err());
        assert!(registry.get_partition("sdb1").is_err());
    }

    #[test]
    fn missing_parent_disk_is_an_error() {
        let mut registry = BlockRegistry::new();
        assert!(matches!(
            registry.register_partition("nvme0", 1, 0, 1),
            Err(KernelError::NotFound { .. })
        ));
    }

    #[test]
    fn table_capacity_is_bounded() {
        let mut registry = BlockRegistry::new();
        let target = Arc::new(RamDisk::from_sectors(1));
        for i in 0..super::MAX_BLOCKS {
            let mut name = String::from("d");
            name.push((b'a' + i as u8) as char);
            registry.register_disk(&name, target.clone()).unwrap();
        }
        assert!(matches!(
            registry.register_disk("overflow", target),
            Err(KernelError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn ramdisk_round_trips_sector_data() {
        let disk = RamDisk::from_sectors(4);
        disk.write_at(SECTOR_SIZE, b"hello");
        let mut out = [0u8; SECTOR_SIZE];
        disk.read_sectors(1, 1, &mut out).unwrap();
        assert_eq!(&out[..5], b"hello");
    }
}
