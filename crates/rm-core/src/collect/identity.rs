//! Device identity.
//!
//! The device id is the configured `DeviceId` when set. Otherwise it is a
//! UUIDv5 of the hardware serial under a fixed namespace, so the same
//! machine yields the same id on every run without persisted state.

use std::path::Path;

use rm_common::ConfigurationSnapshot;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::query::QueryEngine;

/// Namespace for serial-derived device ids. Never change: ids would move.
pub const DEVICE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x7c, 0x1e, 0x3b, 0x52, 0x9a, 0x4d, 0x5f, 0x08, 0xb1, 0x6e, 0x2d, 0x94, 0xc3, 0x0a, 0x71, 0xe5,
]);

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Serials some vendors report when the real one is missing.
const PLACEHOLDER_SERIALS: [&str; 6] = [
    "0",
    "none",
    "unknown",
    "not specified",
    "default string",
    "to be filled by o.e.m.",
];

/// Identity block for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub serial_number: String,
}

/// Deterministic id for a serial.
pub fn device_id_for_serial(serial: &str) -> String {
    Uuid::new_v5(&DEVICE_NAMESPACE, serial.trim().as_bytes()).to_string()
}

/// Human name of the running platform, as reported in payload metadata.
pub fn platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macOS",
        "linux" => "Linux",
        "windows" => "Windows",
        other => other,
    }
}

fn usable_serial(candidate: &str) -> Option<String> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() || PLACEHOLDER_SERIALS.contains(&trimmed.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// First usable serial from the query result, the machine-id file, or the
/// hostname, in that order.
pub fn select_serial(
    queried: Option<&str>,
    machine_id_path: &Path,
    hostname: Option<String>,
) -> Option<String> {
    if let Some(serial) = queried.and_then(usable_serial) {
        return Some(serial);
    }
    match std::fs::read_to_string(machine_id_path) {
        Ok(contents) => {
            if let Some(id) = usable_serial(&contents) {
                debug!(path = %machine_id_path.display(), "using machine id as serial");
                return Some(id);
            }
        }
        Err(e) => debug!(path = %machine_id_path.display(), error = %e, "machine id unavailable"),
    }
    hostname.as_deref().and_then(usable_serial)
}

/// The host name via `gethostname(2)`.
pub fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes and gethostname writes at
    // most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    (!name.is_empty()).then_some(name)
}

/// Resolve the identity for this run.
pub fn resolve_identity(snapshot: &ConfigurationSnapshot, engine: &mut QueryEngine) -> DeviceIdentity {
    let queried = if engine.is_available() {
        match engine.execute("SELECT hardware_serial FROM system_info;") {
            Ok(rows) => rows
                .iter()
                .filter_map(|r| r.get("hardware_serial").and_then(|v| v.as_str()))
                .map(str::to_string)
                .next(),
            Err(e) => {
                warn!(error = %e, "hardware serial query failed");
                None
            }
        }
    } else {
        None
    };

    let serial = select_serial(queried.as_deref(), Path::new(MACHINE_ID_PATH), hostname())
        .unwrap_or_default();
    identity_from(snapshot, serial)
}

/// Combine the configured id (if any) with a serial.
pub fn identity_from(snapshot: &ConfigurationSnapshot, serial: String) -> DeviceIdentity {
    let device_id = if !snapshot.device_id.is_empty() {
        snapshot.device_id.clone()
    } else if !serial.is_empty() {
        device_id_for_serial(&serial)
    } else {
        warn!("no hardware serial available; using the nil device id");
        Uuid::nil().to_string()
    };
    DeviceIdentity {
        device_id,
        serial_number: serial,
    }
}
