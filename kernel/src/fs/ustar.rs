//! USTAR archive filesystem
//!
//! A read-only filesystem over a tar archive held in memory (the boot
//! module). Mount scans the 512-byte headers once and records file
//! entries; `open` does a literal name match. Directories are not
//! special -- only regular files (typeflag '0' or NUL) become entries.
//! Entry names are normalized by stripping a leading `/` or `./`.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use super::{FileHandle, FileOps, Filesystem};
use crate::error::KernelResult;

/// Tar block granularity; headers and data both round to it.
const BLOCK_SIZE: usize = 512;

// Header field offsets (ustar layout).
const NAME_OFF: usize = 0;
const NAME_LEN: usize = 100;
const SIZE_OFF: usize = 124;
const SIZE_LEN: usize = 12;
const TYPE_OFF: usize = 156;

struct UstarEntry {
    name: String,
    /// Byte offset of the file data inside the archive.
    offset: usize,
    size: usize,
}

/// The mounted archive.
pub struct UstarFs {
    data: &'static [u8],
    entries: Vec<UstarEntry>,
}

/// Parse an octal ASCII size field.
fn parse_octal(field: &[u8]) -> usize {
    let mut value = 0usize;
    for &byte in field {
        if !byte.is_ascii_digit() || byte > b'7' {
            break;
        }
        value = (value << 3) | (byte - b'0') as usize;
    }
    value
}

fn field_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).unwrap_or("")
}

/// Strip a leading `/` or `./` from an archive member name.
fn normalize(name: &str) -> &str {
    name.strip_prefix("./")
        .or_else(|| name.strip_prefix('/'))
        .unwrap_or(name)
}

impl UstarFs {
    /// Scan `data` as a tar archive. An empty name field ends the scan.
    pub fn mount(data: &'static [u8]) -> KernelResult<Self> {
        let mut entries = Vec::new();
        let mut offset = 0;

        while offset + BLOCK_SIZE <= data.len() {
            let header = &data[offset..offset + BLOCK_SIZE];
            if header[NAME_OFF] == 0 {
                break;
            }
            let size = parse_octal(&header[SIZE_OFF..SIZE_OFF + SIZE_LEN]);
            let typeflag = header[TYPE_OFF];

            if typeflag == b'0' || typeflag == 0 {
                let name = String::from(normalize(field_str(
                    &header[NAME_OFF..NAME_OFF + NAME_LEN],
                )));
                log::debug!("[USTAR] found {} size={}", name, size);
                entries.push(UstarEntry {
                    name,
                    offset: offset + BLOCK_SIZE,
                    size,
                });
            }

            let blocks = size.div_ceil(BLOCK_SIZE);
            offset += BLOCK_SIZE + blocks * BLOCK_SIZE;
        }

        Ok(Self { data, entries })
    }
}

struct UstarFile {
    data: &'static [u8],
}

impl FileOps for UstarFile {
    fn read(&self, buf: &mut [u8], offset: usize) -> KernelResult<usize> {
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

impl Filesystem for UstarFs {
    fn open(&self, path: &str) -> Option<FileHandle> {
        let wanted = normalize(path);
        let entry = self.entries.iter().find(|e| e.name == wanted)?;
        let end = (entry.offset + entry.size).min(self.data.len());
        Some(FileHandle::new(
            Box::new(UstarFile {
                data: &self.data[entry.offset..end],
            }),
            entry.size,
        ))
    }

    fn fs_name(&self) -> &'static str {
        "ustar"
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn push_file(archive: &mut Vec<u8>, name: &str, content: &[u8], typeflag: u8) {
        let mut header = vec![0u8; BLOCK_SIZE];
        header[..name.len()].copy_from_slice(name.as_bytes());
        let size_field = format!("{:011o}\0", content.len());
        header[SIZE_OFF..SIZE_OFF + 12].copy_from_slice(size_field.as_bytes());
        header[TYPE_OFF] = typeflag;
        header[257..263].copy_from_slice(b"ustar\0");
        header[263..265].copy_from_slice(b"00");
        archive.extend_from_slice(&header);
        archive.extend_from_slice(content);
        while archive.len() % BLOCK_SIZE != 0 {
            archive.push(0);
        }
    }

    fn build_archive(files: &[(&str, &[u8], u8)]) -> &'static [u8] {
        let mut archive = Vec::new();
        for (name, content, flag) in files {
            push_file(&mut archive, name, content, *flag);
        }
        archive.extend_from_slice(&[0u8; 2 * BLOCK_SIZE]);
        Box::leak(archive.into_boxed_slice())
    }

    #[test]
    fn mounts_and_reads_files() {
        let fs = UstarFs::mount(build_archive(&[
            ("test.txt", b"init\n", b'0'),
            ("etc/fstab", b"/dev/sda1 /mnt ext2\n", b'0'),
        ]))
        .unwrap();

        let handle = fs.open("test.txt").unwrap();
        assert_eq!(handle.size(), 5);
        let mut buf = [0u8; 32];
        let n = handle.read(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"init\n");

        assert!(fs.open("etc/fstab").is_some());
        assert!(fs.open("missing").is_none());
    }

    #[test]
    fn names_are_normalized() {
        let fs = UstarFs::mount(build_archive(&[("./boot/config", b"x=1", b'0')])).unwrap();
        // The leading "./" is stripped at mount; opens with or without a
        // leading slash both resolve.
        assert!(fs.open("boot/config").is_some());
        assert!(fs.open("/boot/config").is_some());
    }

    #[test]
    fn directories_are_not_entries() {
        let fs = UstarFs::mount(build_archive(&[
            ("etc/", b"", b'5'),
            ("etc/hosts", b"localhost", b'0'),
        ]))
        .unwrap();
        assert!(fs.open("etc").is_none());
        assert!(fs.open("etc/hosts").is_some());
    }

    #[test]
    fn offset_reads_clamp_to_file_size() {
        let fs = UstarFs::mount(build_archive(&[("a", b"abcdef", b'0')])).unwrap();
        let handle = fs.open("a").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(handle.read(&mut buf, 4).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(handle.read(&mut buf, 6).unwrap(), 0);
    }

    #[test]
    fn data_spanning_multiple_blocks() {
        let content: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let archive = build_archive(&[("big.bin", &content, b'0'), ("after", b"ok", b'0')]);
        let fs = UstarFs::mount(archive).unwrap();

        let handle = fs.open("big.bin").unwrap();
        assert_eq!(handle.size(), 1500);
        let mut buf = vec![0u8; 1500];
        assert_eq!(handle.read(&mut buf, 0).unwrap(), 1500);
        assert_eq!(buf, content);
        // The entry after a multi-block file is still found.
        assert!(fs.open("after").is_some());
    }
}
