//! Kernel-wide error types
//!
//! Every fallible subsystem returns [`KernelError`] through the
//! [`KernelResult`] alias. Fatal conditions (null RSDP, malformed MADT)
//! are not represented here; they panic, and the panic handler disables
//! interrupts and halts.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frame pool or heap exhausted
    OutOfMemory,

    /// A page mapping could not be installed (intermediate table
    /// allocation failed, or a level was absent on unmap)
    MappingFailed {
        virt: u64,
    },

    /// A bounded hardware wait expired
    DeviceTimeout {
        device: &'static str,
    },

    /// AHCI task-file error (PxIS bit 30) that survived the COMRESET retry
    TaskFileError {
        port: u32,
    },

    /// Caller-supplied argument rejected before any side effect
    InvalidArgument {
        name: &'static str,
    },

    /// Lookup miss in a registry (block, device, mount, FD)
    NotFound {
        resource: &'static str,
    },

    /// On-disk or in-memory structure failed validation (ext2 magic,
    /// MBR signature)
    HeaderInvalid {
        what: &'static str,
    },

    /// A fixed-capacity table is full
    ResourceExhausted {
        resource: &'static str,
    },

    /// Operation attempted before the owning subsystem was initialized
    NotInitialized {
        subsystem: &'static str,
    },

    /// Mount point string already present in the mount table
    AlreadyMounted,

    /// Name already present in a registry
    AlreadyExists {
        resource: &'static str,
    },

    /// No device present on the probed port/slot
    NoDevice,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::MappingFailed { virt } => {
                write!(f, "failed to map virtual address {:#x}", virt)
            }
            Self::DeviceTimeout { device } => write!(f, "timeout waiting on {}", device),
            Self::TaskFileError { port } => {
                write!(f, "task file error on AHCI port {}", port)
            }
            Self::InvalidArgument { name } => write!(f, "invalid argument '{}'", name),
            Self::NotFound { resource } => write!(f, "{} not found", resource),
            Self::HeaderInvalid { what } => write!(f, "invalid {} header", what),
            Self::ResourceExhausted { resource } => {
                write!(f, "{} table full", resource)
            }
            Self::NotInitialized { subsystem } => {
                write!(f, "{} not initialized", subsystem)
            }
            Self::AlreadyMounted => write!(f, "mount point already in use"),
            Self::AlreadyExists { resource } => write!(f, "{} already registered", resource),
            Self::NoDevice => write!(f, "no device present"),
        }
    }
}
