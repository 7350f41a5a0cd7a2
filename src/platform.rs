//! Host identity helpers
//!
//! [`HardwareId`] supplies a stable per-host identifier used as the device
//! name when none is configured: the MAC address of the interface carrying
//! the default route, or a generated locally administered unicast MAC when
//! that cannot be read. The generated value is produced once per
//! `HardwareId` and reused until [`HardwareId::reset`].

use once_cell::sync::Lazy;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

static PROCESS_HARDWARE_ID: Lazy<HardwareId> = Lazy::new(HardwareId::new);

#[derive(Debug)]
pub struct HardwareId {
    sysfs_root: Option<PathBuf>,
    cached: Mutex<Option<String>>,
}

impl Default for HardwareId {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareId {
    /// Detect from `/proc` and `/sys`, falling back to a generated MAC
    pub fn new() -> Self {
        Self {
            sysfs_root: Some(PathBuf::from("/")),
            cached: Mutex::new(None),
        }
    }

    /// Never query the host; always use a generated MAC
    pub fn generated() -> Self {
        Self {
            sysfs_root: None,
            cached: Mutex::new(None),
        }
    }

    /// Probe an alternate root containing `proc/net/route` and `sys/class/net`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: Some(root.into()),
            cached: Mutex::new(None),
        }
    }

    /// Shared instance for the whole process
    pub fn process() -> &'static HardwareId {
        &PROCESS_HARDWARE_ID
    }

    /// Resolve once; later calls return the same value
    pub fn get(&self) -> String {
        let mut cached = match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(id) = cached.as_ref() {
            return id.clone();
        }

        let id = self
            .sysfs_root
            .as_deref()
            .and_then(default_route_mac)
            .unwrap_or_else(|| {
                let generated = generate_local_mac();
                debug!(target: "iotlink::platform", mac = %generated, "using generated hardware id");
                generated
            });
        *cached = Some(id.clone());
        id
    }

    /// Forget the resolved value so the next [`get`](Self::get) resolves again
    pub fn reset(&self) {
        match self.cached.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

/// MAC of the interface holding the default route
fn default_route_mac(root: &Path) -> Option<String> {
    let routes = std::fs::read_to_string(root.join("proc/net/route")).ok()?;
    let interface = default_interface(&routes)?;
    let raw = std::fs::read_to_string(root.join("sys/class/net").join(&interface).join("address"))
        .map_err(|e| warn!(target: "iotlink::platform", interface = %interface, error = %e, "cannot read interface address"))
        .ok()?;
    let mac = raw.trim().to_ascii_lowercase();
    if mac.is_empty() || mac == "00:00:00:00:00:00" {
        return None;
    }
    Some(mac)
}

/// First interface whose destination is 0.0.0.0 in `/proc/net/route` format
fn default_interface(routes: &str) -> Option<String> {
    routes.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let name = fields.next()?;
        let destination = u64::from_str_radix(fields.next()?, 16).ok()?;
        (destination == 0).then(|| name.to_string())
    })
}

/// Random MAC with the locally administered bit set and the multicast bit clear
pub fn generate_local_mac() -> String {
    let mut bytes: [u8; 6] = rand::thread_rng().gen();
    bytes[0] = (bytes[0] & 0xFE) | 0x02;
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
