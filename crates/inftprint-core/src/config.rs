// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Server and proxy configuration, loaded from a TOML file and overridable
// from the command line.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A statically configured printer, materialized into the object store
/// at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfig {
    pub name: String,
    pub resource_path: String,
    /// `print` for a 2D printer, `print3d` for a 3D printer.
    pub service_type: String,
    /// External command the Job Processor spawns per job, in lieu of a
    /// proxy hand-off or simulated run. Ignored when `proxy_mode` is set.
    #[serde(default)]
    pub local_command: Option<String>,
    /// When set, the Job Processor always hands jobs off to a registered
    /// output device instead of running `local_command` directly.
    #[serde(default)]
    pub proxy_mode: bool,
}

/// Settings for the `infrprintd` server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP/1.1 listener binds to, e.g. `0.0.0.0:631`.
    pub listen_address: String,
    /// Root directory under which `<spool>/<printer>/<job-id>-<name>.<ext>`
    /// files are written.
    pub spool_directory: PathBuf,
    pub printers: Vec<PrinterConfig>,
    /// Group name whose members may perform admin operations (e.g.
    /// `Create-Printer`, `Delete-Printer`, `Shutdown-All-Printers`).
    pub admin_group: String,
    /// Group name whose members may perform operator-level operations
    /// (e.g. `Pause-Printer`, `Hold-Job` on jobs they don't own).
    pub operator_group: String,
    /// Attribute names redacted from responses to unauthorized readers.
    pub private_attributes: Vec<String>,
    /// Default subscription lease duration, seconds. `0` means never
    /// expires.
    pub default_lease_seconds: i64,
    /// Maximum events retained per subscription before head-trimming.
    pub subscription_queue_capacity: usize,
    /// Maximum active jobs per printer before `too-many-jobs`.
    pub max_active_jobs_per_printer: usize,
    /// Maximum entries retained in a printer's completed-jobs index before
    /// the oldest are dropped (and removed from the all-time `jobs` index).
    #[serde(default = "default_max_completed_jobs_per_printer")]
    pub max_completed_jobs_per_printer: usize,
    /// Retain spool files after job deletion instead of removing them.
    pub keep_files: bool,
    pub log_level: String,
    /// Path to a log file; when unset, logs go to stderr with ISO-8601
    /// timestamps instead of an RFC 5424 syslog prefix.
    pub log_file: Option<PathBuf>,
    /// When set, envelope validation only requires the target URI
    /// attribute to appear somewhere in the operation-attributes group
    /// rather than exactly third, after `attributes-charset` and
    /// `attributes-natural-language`. Off by default, matching the
    /// strict ordering RFC 8011 §4.1.4.1 specifies.
    #[serde(default)]
    pub relaxed_envelope_validation: bool,
}

fn default_max_completed_jobs_per_printer() -> usize {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:631".to_string(),
            spool_directory: PathBuf::from("/var/spool/inftprint"),
            printers: Vec::new(),
            admin_group: "lpadmin".to_string(),
            operator_group: "lpoperator".to_string(),
            private_attributes: vec![
                "job-originating-user-name".to_string(),
                "job-originating-host-name".to_string(),
            ],
            default_lease_seconds: 86400,
            subscription_queue_capacity: 1024,
            max_active_jobs_per_printer: 500,
            max_completed_jobs_per_printer: default_max_completed_jobs_per_printer(),
            keep_files: false,
            log_level: "info".to_string(),
            log_file: None,
            relaxed_envelope_validation: false,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> crate::error::Result<Self> {
        toml::from_str(s).map_err(|e| crate::error::InftError::Config(e.to_string()))
    }
}

/// Settings for the `ippproxy` agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// URI of the Infrastructure Printer this proxy registers against.
    pub infrastructure_printer_uri: String,
    /// Local command to run for each fetched job, in lieu of a real
    /// output device.
    pub local_command: Option<String>,
    /// URI identifying the local output device (e.g. `usb://...`,
    /// `socket://...`); also the seed for the device UUID.
    pub device_uri: String,
    pub username: Option<String>,
    /// Password; typically supplied via `IPPPROXY_PASSWORD` instead.
    pub password: Option<String>,
    pub log_level: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            infrastructure_printer_uri: String::new(),
            local_command: None,
            device_uri: String::new(),
            username: None,
            password: None,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default_binds_631() {
        let cfg = ServerConfig::default();
        assert!(cfg.listen_address.ends_with(":631"));
        assert_eq!(cfg.subscription_queue_capacity, 1024);
    }

    #[test]
    fn server_config_parses_printers_from_toml() {
        let toml = r#"
            listen_address = "127.0.0.1:8631"
            spool_directory = "/tmp/spool"
            admin_group = "lpadmin"
            operator_group = "lpoperator"
            private_attributes = []
            default_lease_seconds = 3600
            subscription_queue_capacity = 256
            max_active_jobs_per_printer = 10
            keep_files = true
            log_level = "debug"

            [[printers]]
            name = "p1"
            resource_path = "/ipp/print/p1"
            service_type = "print"
        "#;
        let cfg = ServerConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.printers.len(), 1);
        assert_eq!(cfg.printers[0].name, "p1");
        assert!(cfg.keep_files);
    }

    #[test]
    fn proxy_config_default_has_no_uri() {
        let cfg = ProxyConfig::default();
        assert!(cfg.infrastructure_printer_uri.is_empty());
    }
}
