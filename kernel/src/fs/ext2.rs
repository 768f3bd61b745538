//! ext2 read-only filesystem
//!
//! A deliberately small reader: superblock at byte offset 1024, first
//! block-group descriptor only, path resolution by walking directory
//! records in the direct blocks of inode 2, file reads assembled from
//! direct blocks only (no indirection). Block size is capped at 4 KiB.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;

use super::blockdev::{self, BlockDev};
use super::{FileHandle, FileOps, Filesystem};
use crate::error::{KernelError, KernelResult};

/// ext2 superblock magic.
const EXT2_MAGIC: u16 = 0xEF53;

/// Root directory inode number.
const ROOT_INODE: u32 = 2;

/// Direct block pointers per inode.
const DIRECT_BLOCKS: usize = 12;

/// Largest supported filesystem block.
const MAX_BLOCK_SIZE: usize = 4096;

fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// The inode fields this reader needs.
#[derive(Debug, Clone, Copy)]
struct Inode {
    size: u32,
    blocks: [u32; 15],
}

impl Inode {
    fn parse(raw: &[u8]) -> Self {
        let mut blocks = [0u32; 15];
        for (i, block) in blocks.iter_mut().enumerate() {
            *block = le32(raw, 40 + i * 4);
        }
        Self {
            size: le32(raw, 4),
            blocks,
        }
    }
}

/// A mounted ext2 filesystem over one block device.
pub struct Ext2Fs {
    devname: String,
    dev: BlockDev,
    block_size: u32,
    inode_size: u32,
    inode_table_block: u32,
}

impl Ext2Fs {
    /// Mount from the named device in the global block registry.
    pub fn mount(devname: &str) -> KernelResult<Self> {
        let dev = blockdev::open(devname).ok_or(KernelError::NotFound {
            resource: "block device",
        })?;
        Self::mount_dev(devname, dev)
    }

    /// Mount over an already-resolved block device.
    pub fn mount_dev(devname: &str, dev: BlockDev) -> KernelResult<Self> {
        // Superblock lives at byte 1024: sectors 2..4.
        let mut sb = [0u8; 1024];
        dev.read_sectors(2, 2, &mut sb)?;

        if le16(&sb, 56) != EXT2_MAGIC {
            log::warn!("[EXT2] bad magic {:#06x} on {}", le16(&sb, 56), devname);
            return Err(KernelError::HeaderInvalid {
                what: "ext2 superblock",
            });
        }

        let block_size = 1024u32 << le32(&sb, 24);
        if block_size as usize > MAX_BLOCK_SIZE {
            return Err(KernelError::HeaderInvalid {
                what: "ext2 block size",
            });
        }
        let first_data_block = le32(&sb, 20);
        let rev_level = le32(&sb, 76);
        let inode_size = if rev_level >= 1 && le16(&sb, 88) != 0 {
            le16(&sb, 88) as u32
        } else {
            128
        };

        let mut fs = Self {
            devname: String::from(devname),
            dev,
            block_size,
            inode_size,
            inode_table_block: 0,
        };

        // The first group descriptor follows the superblock.
        let gd_block = first_data_block + 1;
        let mut gd = vec![0u8; block_size as usize];
        fs.read_block(gd_block, &mut gd)?;
        fs.inode_table_block = le32(&gd, 8);

        log::info!(
            "[EXT2] mounted {} block_size={} inode_size={} inode_table={}",
            devname,
            block_size,
            inode_size,
            fs.inode_table_block
        );
        Ok(fs)
    }

    fn read_block(&self, block: u32, buf: &mut [u8]) -> KernelResult<()> {
        let sectors_per_block = (self.block_size / 512) as u16;
        let lba = block as u64 * sectors_per_block as u64;
        self.dev
            .read_sectors(lba, sectors_per_block, buf)
            .inspect_err(|err| {
                log::warn!(
                    "[EXT2] block read failed dev={} block={} ({})",
                    self.devname,
                    block,
                    err
                );
            })
    }

    /// Read inode `ino` (1-based) from the inode table.
    fn read_inode(&self, ino: u32) -> KernelResult<Inode> {
        let index = ino - 1;
        let inodes_per_block = self.block_size / self.inode_size;
        let block = self.inode_table_block + index / inodes_per_block;
        let offset = ((index % inodes_per_block) * self.inode_size) as usize;

        let mut buf = vec![0u8; self.block_size as usize];
        self.read_block(block, &mut buf)?;
        Ok(Inode::parse(&buf[offset..offset + self.inode_size as usize]))
    }

    /// Scan a directory inode's direct blocks for `name`.
    fn find_in_dir(&self, dir: &Inode, name: &str) -> Option<u32> {
        let mut buf = vec![0u8; self.block_size as usize];
        for &block in dir.blocks.iter().take(DIRECT_BLOCKS) {
            if block == 0 {
                continue;
            }
            if self.read_block(block, &mut buf).is_err() {
                continue;
            }
            let mut off = 0usize;
            while off + 8 <= self.block_size as usize {
                let ino = le32(&buf, off);
                let rec_len = le16(&buf, off + 4) as usize;
                let name_len = buf[off + 6] as usize;
                if ino == 0 || rec_len < 8 {
                    break;
                }
                if off + 8 + name_len <= buf.len() {
                    let entry = &buf[off + 8..off + 8 + name_len];
                    if entry == name.as_bytes() {
                        return Some(ino);
                    }
                }
                off += rec_len;
            }
        }
        None
    }

    /// Walk `path` components from the root inode.
    fn resolve(&self, path: &str) -> Option<Inode> {
        let mut inode = self.read_inode(ROOT_INODE).ok()?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let ino = self.find_in_dir(&inode, component)?;
            inode = self.read_inode(ino).ok()?;
        }
        Some(inode)
    }
}

/// An open ext2 file: the inode snapshot plus what reads need.
struct Ext2File {
    dev: BlockDev,
    devname: String,
    block_size: u32,
    inode: Inode,
}

impl FileOps for Ext2File {
    fn read(&self, buf: &mut [u8], offset: usize) -> KernelResult<usize> {
        let total = self.inode.size as usize;
        if offset >= total {
            return Ok(0);
        }
        let len = buf.len().min(total - offset);
        let block_size = self.block_size as usize;
        let mut block_buf = vec![0u8; block_size];

        let mut copied = 0;
        while copied < len {
            let block_index = (offset + copied) / block_size;
            let block_off = (offset + copied) % block_size;
            if block_index >= DIRECT_BLOCKS {
                break;
            }
            let block = self.inode.blocks[block_index];
            if block == 0 {
                break;
            }
            let sectors_per_block = (self.block_size / 512) as u16;
            let lba = block as u64 * sectors_per_block as u64;
            if self.dev.read_sectors(lba, sectors_per_block, &mut block_buf).is_err() {
                log::warn!("[EXT2] read failed dev={} block={}", self.devname, block);
                break;
            }
            let chunk = (block_size - block_off).min(len - copied);
            buf[copied..copied + chunk].copy_from_slice(&block_buf[block_off..block_off + chunk]);
            copied += chunk;
        }
        Ok(copied)
    }
}

impl Filesystem for Ext2Fs {
    fn open(&self, path: &str) -> Option<FileHandle> {
        let inode = self.resolve(path)?;
        Some(FileHandle::new(
            Box::new(Ext2File {
                dev: self.dev.clone(),
                devname: self.devname.clone(),
                block_size: self.block_size,
                inode,
            }),
            inode.size as usize,
        ))
    }

    fn fs_name(&self) -> &'static str {
        "ext2"
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::blockdev::{BlockRegistry, RamDisk, SECTOR_SIZE};
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    const PART_START: usize = 2048; // sectors
    const BLOCK: usize = 1024;

    struct ImageBuilder {
        disk: RamDisk,
    }

    impl ImageBuilder {
        fn new() -> Self {
            // Partition offset plus 64 filesystem blocks.
            let bytes = PART_START * SECTOR_SIZE + 64 * BLOCK;
            Self {
                disk: RamDisk::new(vec![0u8; bytes]),
            }
        }

        fn write(&self, fs_byte_off: usize, bytes: &[u8]) {
            self.disk
                .write_at(PART_START * SECTOR_SIZE + fs_byte_off, bytes);
        }

        fn superblock(&self) {
            let mut sb = vec![0u8; 1024];
            sb[20..24].copy_from_slice(&1u32.to_le_bytes()); // first_data_block
            sb[24..28].copy_from_slice(&0u32.to_le_bytes()); // log_block_size
            sb[56..58].copy_from_slice(&EXT2_MAGIC.to_le_bytes());
            sb[76..80].copy_from_slice(&1u32.to_le_bytes()); // rev_level
            sb[88..90].copy_from_slice(&128u16.to_le_bytes()); // inode_size
            self.write(1024, &sb);
        }

        fn group_descriptor(&self, inode_table_block: u32) {
            let mut gd = vec![0u8; 32];
            gd[8..12].copy_from_slice(&inode_table_block.to_le_bytes());
            self.write(2 * BLOCK, &gd);
        }

        fn inode(&self, ino: u32, size: u32, blocks: &[u32]) {
            let mut raw = vec![0u8; 128];
            raw[4..8].copy_from_slice(&size.to_le_bytes());
            for (i, &block) in blocks.iter().enumerate() {
                raw[40 + i * 4..44 + i * 4].copy_from_slice(&block.to_le_bytes());
            }
            self.write(5 * BLOCK + (ino as usize - 1) * 128, &raw);
        }

        fn dir_block(&self, block: u32, entries: &[(u32, &str)]) {
            let mut blob = Vec::new();
            for (i, (ino, name)) in entries.iter().enumerate() {
                let rec_len = if i == entries.len() - 1 {
                    BLOCK - blob.len()
                } else {
                    (8 + name.len() + 3) & !3
                };
                blob.extend_from_slice(&ino.to_le_bytes());
                blob.extend_from_slice(&(rec_len as u16).to_le_bytes());
                blob.push(name.len() as u8);
                blob.push(1);
                blob.extend_from_slice(name.as_bytes());
                while blob.len() % 4 != 0 {
                    blob.push(0);
                }
            }
            self.write(block as usize * BLOCK, &blob);
        }

        fn data_block(&self, block: u32, content: &[u8]) {
            self.write(block as usize * BLOCK, content);
        }
    }

    fn sample_fs() -> Ext2Fs {
        let image = ImageBuilder::new();
        image.superblock();
        image.group_descriptor(5);

        // Root directory: inode 2, one block of entries.
        image.inode(2, BLOCK as u32, &[10]);
        image.dir_block(10, &[(2, "."), (2, ".."), (12, "test.txt"), (13, "etc")]);

        // /test.txt
        image.inode(12, 14, &[20]);
        image.data_block(20, b"Hello, World!\n");

        // /etc with fstab and a two-block file.
        image.inode(13, BLOCK as u32, &[11]);
        image.dir_block(11, &[(13, "."), (2, ".."), (14, "fstab"), (15, "big")]);
        image.inode(14, 25, &[21]);
        image.data_block(21, b"/dev/sda1 /mnt/data ext2\n");

        let big: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        image.inode(15, 1500, &[22, 23]);
        image.data_block(22, &big[..BLOCK]);
        image.data_block(23, &big[BLOCK..]);

        let mut registry = BlockRegistry::new();
        registry
            .register_disk("tsta", Arc::new(image.disk))
            .unwrap();
        registry
            .register_partition("tsta", 1, PART_START as u64, 64 * 2)
            .unwrap();
        let dev = registry.open("tsta1").unwrap();
        Ext2Fs::mount_dev("tsta1", dev).unwrap()
    }

    #[test]
    fn mounts_and_reads_a_root_file() {
        let fs = sample_fs();
        let handle = fs.open("test.txt").unwrap();
        assert_eq!(handle.size(), 14);
        let mut buf = [0u8; 512];
        let n = handle.read(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"Hello, World!\n");
    }

    #[test]
    fn resolves_nested_paths() {
        let fs = sample_fs();
        let handle = fs.open("etc/fstab").unwrap();
        let mut buf = [0u8; 64];
        let n = handle.read(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"/dev/sda1 /mnt/data ext2\n");
    }

    #[test]
    fn missing_paths_return_none() {
        let fs = sample_fs();
        assert!(fs.open("nope.txt").is_none());
        assert!(fs.open("etc/nope").is_none());
        assert!(fs.open("test.txt/impossible").is_none());
    }

    #[test]
    fn reads_span_direct_blocks() {
        let fs = sample_fs();
        let handle = fs.open("etc/big").unwrap();
        assert_eq!(handle.size(), 1500);
        let mut buf = vec![0u8; 1500];
        assert_eq!(handle.read(&mut buf, 0).unwrap(), 1500);
        let expected: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(buf, expected);
        // Offset read across the block boundary.
        let mut tail = vec![0u8; 600];
        assert_eq!(handle.read(&mut tail, 1000).unwrap(), 500);
        assert_eq!(&tail[..500], &expected[1000..]);
    }

    #[test]
    fn rejects_bad_magic() {
        let image = ImageBuilder::new();
        // Superblock left zeroed: magic is wrong.
        let mut registry = BlockRegistry::new();
        registry
            .register_disk("tstb", Arc::new(image.disk))
            .unwrap();
        registry
            .register_partition("tstb", 1, PART_START as u64, 64 * 2)
            .unwrap();
        let dev = registry.open("tstb1").unwrap();
        assert!(matches!(
            Ext2Fs::mount_dev("tstb1", dev),
            Err(KernelError::HeaderInvalid { .. })
        ));
    }
}
