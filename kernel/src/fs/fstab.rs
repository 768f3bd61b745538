//! /etc/fstab parsing
//!
//! After the root filesystem is mounted, additional mounts come from
//! `/etc/fstab`: lines of `<device> <mountpoint> <fstype>`, `#` comments
//! and blank lines skipped. Only `/dev/<name>` devices with type `ext2`
//! are actionable; anything else is logged and skipped.

use alloc::boxed::Box;

use crate::error::KernelResult;

/// One parsed fstab line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FstabEntry<'a> {
    pub device: &'a str,
    pub mount_point: &'a str,
    pub fs_type: &'a str,
}

/// Parse a single line; `None` for blanks, comments, and short lines.
pub fn parse_line(line: &str) -> Option<FstabEntry<'_>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.split_whitespace();
    Some(FstabEntry {
        device: fields.next()?,
        mount_point: fields.next()?,
        fs_type: fields.next()?,
    })
}

/// Read `path` through the VFS and mount every usable entry.
pub fn parse_and_mount(path: &str) -> KernelResult<()> {
    let mut buf = [0u8; 4096];
    let len = super::read_all(path, &mut buf).inspect_err(|_| {
        log::info!("[FSTAB] no {} found (skipping)", path);
    })?;
    let text = core::str::from_utf8(&buf[..len]).unwrap_or("");

    for entry in text.lines().filter_map(parse_line) {
        log::info!(
            "[FSTAB] entry device={} mount={} fstype={}",
            entry.device,
            entry.mount_point,
            entry.fs_type
        );
        let Some(devname) = entry.device.strip_prefix("/dev/") else {
            log::info!("[FSTAB] unsupported device {} (skipping)", entry.device);
            continue;
        };
        if entry.fs_type != "ext2" {
            log::info!("[FSTAB] unsupported fstype {} (skipping)", entry.fs_type);
            continue;
        }
        match super::ext2::Ext2Fs::mount(devname) {
            Ok(fs) => {
                if let Err(err) = super::mount(entry.mount_point, Box::new(fs)) {
                    log::warn!("[FSTAB] mount {} failed: {}", entry.mount_point, err);
                }
            }
            Err(err) => {
                log::warn!(
                    "[FSTAB] failed to mount {} on {}: {}",
                    entry.device,
                    entry.mount_point,
                    err
                );
            }
        }
    }
    Ok(())
}
