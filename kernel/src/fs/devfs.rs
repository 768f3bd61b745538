//! Device-node registry
//!
//! Maps `/dev/<name>` strings to typed records so the initrd buffer and
//! block partition nodes are exposed uniformly. Fixed capacity, names
//! unique, entries immutable after registration.

use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Capacity of the device table.
const MAX_DEVICES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevType {
    Block,
    Char,
    Special,
}

/// One registered device node.
#[derive(Clone)]
pub struct DevEntry {
    pub name: String,
    pub dev_type: DevType,
    /// Backing memory for memory devices (the initrd); `None` for block
    /// nodes, whose data lives behind the block registry.
    pub data: Option<&'static [u8]>,
    pub size: usize,
}

pub struct DevRegistry {
    entries: Vec<DevEntry>,
}

impl DevRegistry {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        dev_type: DevType,
        data: Option<&'static [u8]>,
        size: usize,
    ) -> KernelResult<()> {
        if self.entries.len() >= MAX_DEVICES {
            return Err(KernelError::ResourceExhausted {
                resource: "device node",
            });
        }
        if self.entries.iter().any(|e| e.name == name) {
            return Err(KernelError::AlreadyExists {
                resource: "device node",
            });
        }
        let size = data.map_or(size, |d| d.len());
        log::info!("[DEV] registered {} type={:?} size={}", name, dev_type, size);
        self.entries.push(DevEntry {
            name: String::from(name),
            dev_type,
            data,
            size,
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<DevEntry> {
        self.entries.iter().find(|e| e.name == name).cloned()
    }
}

static DEVICES: Mutex<DevRegistry> = Mutex::new(DevRegistry::new());

/// Register a device node in the global table.
pub fn register(
    name: &str,
    dev_type: DevType,
    data: Option<&'static [u8]>,
    size: usize,
) -> KernelResult<()> {
    DEVICES.lock().register(name, dev_type, data, size)
}

/// Look up a device node by full name (e.g. `/dev/sda1`).
pub fn get(name: &str) -> Option<DevEntry> {
    DEVICES.lock().get(name)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::boxed::Box;

    use super::*;

    #[test]
    fn registers_and_resolves_nodes() {
        let mut registry = DevRegistry::new();
        let payload: &'static [u8] = Box::leak(vec![7u8; 1024].into_boxed_slice());
        registry
            .register("/dev/initrd", DevType::Special, Some(payload), 0)
            .unwrap();
        registry
            .register("/dev/sda1", DevType::Block, None, 0)
            .unwrap();

        let initrd = registry.get("/dev/initrd").unwrap();
        assert_eq!(initrd.size, 1024);
        assert_eq!(initrd.dev_type, DevType::Special);
        assert!(registry.get("/dev/sda2").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = DevRegistry::new();
        registry
            .register("/dev/sda1", DevType::Block, None, 0)
            .unwrap();
        assert!(registry
            .register("/dev/sda1", DevType::Block, None, 0)
            .is_err());
    }
}
