//! Kernel command-line parsing
//!
//! The command line is whitespace-separated `key=value` tokens, e.g.
//! `root=/dev/sda1 loglevel=1`. Keys this kernel acts on: `root` and
//! `loglevel`.

/// Look up `key=value` in a command line and return the value.
///
/// A bare token without `=` never matches; the first occurrence wins.
pub fn get<'a>(cmdline: &'a str, key: &str) -> Option<&'a str> {
    cmdline
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Look up a key in the boot command line.
#[cfg(target_os = "none")]
pub fn boot_get(key: &str) -> Option<&'static str> {
    get(crate::arch::x86_64::multiboot::boot_info().cmdline(), key)
}
