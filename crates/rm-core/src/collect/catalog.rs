//! Catalog-driven module processors.
//!
//! Each built-in module is a short list of keyed osquery statements. A query
//! can require a table registered by the macadmins extension, in which case
//! it is skipped when that table is not available, and it can name a shell
//! command whose trimmed output stands in when the query comes back empty.

use rm_common::ConfigurationSnapshot;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{ModuleError, ModuleProcessor};
use crate::query::QueryEngine;

/// A command run when its query returns no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackCommand {
    pub program: &'static str,
    pub args: &'static [&'static str],
}

/// One keyed statement in a module catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogQuery {
    pub key: &'static str,
    pub sql: &'static str,
    pub requires_table: Option<&'static str>,
    pub fallback: Option<FallbackCommand>,
}

impl CatalogQuery {
    pub const fn new(key: &'static str, sql: &'static str) -> Self {
        CatalogQuery {
            key,
            sql,
            requires_table: None,
            fallback: None,
        }
    }

    pub const fn requires(mut self, table: &'static str) -> Self {
        self.requires_table = Some(table);
        self
    }

    pub const fn or_run(mut self, program: &'static str, args: &'static [&'static str]) -> Self {
        self.fallback = Some(FallbackCommand { program, args });
        self
    }
}

/// A [`ModuleProcessor`] backed by a fixed query catalog.
#[derive(Debug, Clone)]
pub struct CatalogModule {
    id: &'static str,
    queries: Vec<CatalogQuery>,
}

impl CatalogModule {
    pub fn new(id: &'static str, queries: Vec<CatalogQuery>) -> Self {
        CatalogModule { id, queries }
    }

    pub fn queries(&self) -> &[CatalogQuery] {
        &self.queries
    }

    fn run_fallback(engine: &QueryEngine, fallback: &FallbackCommand) -> Option<Value> {
        match engine.run_command(fallback.program, fallback.args) {
            Ok(output) if output.success() => {
                let text = output.stdout_str().trim().to_string();
                if text.is_empty() {
                    None
                } else {
                    Some(json!({
                        "command": fallback.program,
                        "output": text,
                    }))
                }
            }
            Ok(output) => {
                debug!(
                    command = fallback.program,
                    exit_code = ?output.exit_code,
                    "fallback command failed"
                );
                None
            }
            Err(e) => {
                debug!(command = fallback.program, error = %e, "fallback command unavailable");
                None
            }
        }
    }
}

impl ModuleProcessor for CatalogModule {
    fn id(&self) -> &str {
        self.id
    }

    fn collect(
        &self,
        _snapshot: &ConfigurationSnapshot,
        engine: &mut QueryEngine,
    ) -> Result<Value, ModuleError> {
        let mut eligible = Vec::with_capacity(self.queries.len());
        for query in &self.queries {
            match query.requires_table {
                Some(table) if !engine.is_table_available(table) => {
                    debug!(module = self.id, query = query.key, table, "extension table unavailable; skipping");
                }
                _ => eligible.push(query),
            }
        }

        let batch: Vec<(&str, &str)> = eligible.iter().map(|q| (q.key, q.sql)).collect();
        let results = engine.execute_batch(&batch);

        let mut data = Map::new();
        let mut collected = 0usize;
        for (query, result) in eligible.iter().zip(results) {
            if !result.is_empty() {
                collected += 1;
                data.insert(
                    query.key.to_string(),
                    Value::Array(result.rows.into_iter().map(Value::Object).collect()),
                );
                continue;
            }
            match query.fallback.as_ref().and_then(|f| Self::run_fallback(engine, f)) {
                Some(value) => {
                    collected += 1;
                    data.insert(query.key.to_string(), value);
                }
                None => {
                    data.insert(query.key.to_string(), Value::Array(Vec::new()));
                }
            }
        }

        if collected == 0 {
            warn!(module = self.id, queries = eligible.len(), "no query produced data");
            return Err(ModuleError::NoData {
                module: self.id.to_string(),
            });
        }
        debug!(module = self.id, collected, "module collected");
        Ok(Value::Object(data))
    }
}

/// Catalogs for the eight default module ids.
pub fn builtin_modules() -> Vec<CatalogModule> {
    vec![
        CatalogModule::new(
            "hardware",
            vec![
                CatalogQuery::new(
                    "system_info",
                    "SELECT hostname, hardware_vendor, hardware_model, hardware_serial, \
                     cpu_brand, cpu_physical_cores, cpu_logical_cores, physical_memory \
                     FROM system_info;",
                )
                .or_run("system_profiler", &["SPHardwareDataType"]),
                CatalogQuery::new(
                    "disks",
                    "SELECT name, type, disk_size, vendor, hardware_model FROM disk_info;",
                ),
                CatalogQuery::new(
                    "battery",
                    "SELECT health, condition, cycle_count, percent_remaining FROM battery;",
                ),
            ],
        ),
        CatalogModule::new(
            "system",
            vec![
                CatalogQuery::new(
                    "os_version",
                    "SELECT name, version, build, platform, arch FROM os_version;",
                )
                .or_run("uname", &["-a"]),
                CatalogQuery::new("uptime", "SELECT total_seconds FROM uptime;"),
                CatalogQuery::new(
                    "kernel",
                    "SELECT version, arguments FROM kernel_info;",
                ),
                CatalogQuery::new(
                    "pending_updates",
                    "SELECT product_key, display_name, display_version FROM pending_apple_updates;",
                )
                .requires("pending_apple_updates"),
            ],
        ),
        CatalogModule::new(
            "network",
            vec![
                CatalogQuery::new(
                    "interfaces",
                    "SELECT interface, address, mask, type FROM interface_addresses;",
                )
                .or_run("ifconfig", &[]),
                CatalogQuery::new(
                    "interface_details",
                    "SELECT interface, mac, type, mtu, link_speed FROM interface_details;",
                ),
                CatalogQuery::new(
                    "routes",
                    "SELECT destination, gateway, interface FROM routes WHERE destination = '0.0.0.0';",
                ),
                CatalogQuery::new(
                    "wifi",
                    "SELECT ssid, security_type, channel FROM wifi_network;",
                )
                .requires("wifi_network"),
            ],
        ),
        CatalogModule::new(
            "security",
            vec![
                CatalogQuery::new(
                    "disk_encryption",
                    "SELECT name, encrypted, type FROM disk_encryption;",
                ),
                CatalogQuery::new(
                    "sip",
                    "SELECT config_flag, enabled FROM sip_config;",
                )
                .or_run("csrutil", &["status"]),
                CatalogQuery::new(
                    "gatekeeper",
                    "SELECT assessments_enabled, dev_id_enabled FROM gatekeeper;",
                ),
                CatalogQuery::new(
                    "firewall",
                    "SELECT global_state, stealth_enabled FROM alf;",
                ),
                CatalogQuery::new(
                    "filevault_users",
                    "SELECT username, uuid FROM filevault_users;",
                )
                .requires("filevault_users"),
            ],
        ),
        CatalogModule::new(
            "applications",
            vec![
                CatalogQuery::new(
                    "apps",
                    "SELECT name, bundle_identifier, bundle_short_version, path FROM apps;",
                ),
                CatalogQuery::new(
                    "packages",
                    "SELECT name, version, source FROM deb_packages \
                     UNION ALL SELECT name, version, source FROM rpm_packages;",
                ),
            ],
        ),
        CatalogModule::new(
            "management",
            vec![
                CatalogQuery::new(
                    "mdm",
                    "SELECT enrolled, server_url, dep_capable FROM mdm;",
                )
                .requires("mdm")
                .or_run("profiles", &["status", "-type", "enrollment"]),
                CatalogQuery::new(
                    "profiles",
                    "SELECT identifier, display_name, install_date FROM macos_profiles;",
                )
                .requires("macos_profiles"),
                CatalogQuery::new(
                    "munki",
                    "SELECT version, success, end_time, manifest_name FROM munki_info;",
                )
                .requires("munki_info"),
            ],
        ),
        CatalogModule::new(
            "inventory",
            vec![
                CatalogQuery::new(
                    "device",
                    "SELECT computer_name, hostname, hardware_serial, uuid FROM system_info;",
                )
                .or_run("hostname", &[]),
                CatalogQuery::new(
                    "users",
                    "SELECT uid, username, description, directory FROM users WHERE uid >= 500;",
                ),
            ],
        ),
        CatalogModule::new(
            "peripherals",
            vec![
                CatalogQuery::new(
                    "usb_devices",
                    "SELECT vendor, model, serial, removable FROM usb_devices;",
                ),
                CatalogQuery::new(
                    "displays",
                    "SELECT name, display_id, resolution FROM connected_displays;",
                ),
                CatalogQuery::new(
                    "printers",
                    "SELECT name, status FROM cups_destinations;",
                ),
            ],
        ),
    ]
}
