//! Platform probes: find boards presenting as a runtime USB-serial device or as a
//! bootloader mass-storage volume.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// USB vendor ID for the controller's runtime serial interface.
pub const VENDOR_ID: u16 = 0x2e8a;
/// USB product ID for the controller's runtime serial interface.
pub const PRODUCT_ID: u16 = 0x0005;

/// Bootloader volumes always carry this marker file at their root.
const BOOTLOADER_MARKER: &str = "INFO_UF2.TXT";

/// List serial ports whose USB descriptor matches the board's (vendor, product) pair.
///
/// Unsupported platforms (or a missing serial backend) yield an empty set rather than an
/// error, since discovery happens in busy-wait loops where a hard failure would be fatal to
/// the whole run.
pub fn runtime_ports() -> HashSet<String> {
    let Ok(ports) = serialport::available_ports() else {
        return HashSet::new();
    };

    ports
        .into_iter()
        .filter(|p| match &p.port_type {
            serialport::SerialPortType::UsbPort(info) => {
                info.vid == VENDOR_ID && info.pid == PRODUCT_ID
            }
            _ => false,
        })
        .map(|p| p.port_name)
        .collect()
}

/// List filesystem roots that are currently presenting the bootloader's mass-storage volume.
pub fn bootloader_volumes() -> HashSet<PathBuf> {
    if cfg!(target_os = "windows") {
        windows_drives()
    } else {
        unix_mounts()
    }
}

fn has_marker(root: &Path) -> bool {
    root.join(BOOTLOADER_MARKER).is_file()
}

fn windows_drives() -> HashSet<PathBuf> {
    (b'A'..=b'Z')
        .map(|letter| PathBuf::from(format!("{}:\\", letter as char)))
        .filter(|root| has_marker(root))
        .collect()
}

fn unix_mounts() -> HashSet<PathBuf> {
    const MOUNT_PARENTS: &[&str] = &["/Volumes", "/media"];

    let mut found = HashSet::new();

    for parent in MOUNT_PARENTS {
        let Ok(entries) = std::fs::read_dir(parent) else {
            continue;
        };

        for entry in entries.flatten() {
            let root = entry.path();
            if has_marker(&root) {
                found.insert(root);
                continue;
            }

            // `/media/<user>/<volume>` on some Linux distributions.
            let Ok(subentries) = std::fs::read_dir(&root) else {
                continue;
            };
            for sub in subentries.flatten() {
                let subroot = sub.path();
                if has_marker(&subroot) {
                    found.insert(subroot);
                }
            }
        }
    }

    found
}

/// A snapshot of the fleet's visible identities at one instant. Snapshots are never assumed
/// stable between calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetSnapshot {
    pub runtime: HashSet<String>,
    pub bootloader: HashSet<PathBuf>,
}

impl FleetSnapshot {
    pub fn take() -> Self {
        Self {
            runtime: runtime_ports(),
            bootloader: bootloader_volumes(),
        }
    }

    /// Total number of distinct devices visible, regardless of identity.
    pub fn device_count(&self) -> usize {
        self.runtime.len() + self.bootloader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtime.is_empty() && self.bootloader.is_empty()
    }
}
