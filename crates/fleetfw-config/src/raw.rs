use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// On-disk orchestrator config, before defaults and env overrides.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub worker_count: Option<usize>,
    pub max_attempts: Option<u32>,
    pub catalog_url: Option<String>,
    pub catalog_cache_minutes: Option<u64>,
    #[serde(default)]
    pub tls: RawTls,
    #[serde(default)]
    pub timeouts: RawTimeouts,
    /// Credentials backend refs, e.g. `env:IDRAC` or `vault:https://…`.
    pub management_secrets: Option<String>,
    pub hypervisor_secrets: Option<String>,
    pub racadm_path: Option<PathBuf>,
    pub ipmitool_path: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTls {
    pub reject_unauthorized: Option<bool>,
    pub ca_bundle_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTimeouts {
    pub http_secs: Option<u64>,
    pub task_minutes: Option<u64>,
    pub maintenance_minutes: Option<u64>,
    pub catalog_fetch_secs: Option<u64>,
    pub detect_secs: Option<u64>,
}

/// On-disk plan file. Update mode and install_upon are validated against
/// the closed option sets during conversion.
#[derive(Debug, Deserialize)]
pub struct RawPlan {
    pub id: String,
    pub name: Option<String>,
    pub policy: RawPolicy,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<RawArtifact>,
}

#[derive(Debug, Deserialize)]
pub struct RawPolicy {
    pub update_mode: String,
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    pub install_upon: Option<String>,
    pub maintenance_timeout_minutes: Option<u64>,
    pub max_attempts: Option<u32>,
    pub custom_repository_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct RawArtifact {
    pub component: String,
    pub image_uri: String,
    pub version: Option<String>,
    pub checksum: Option<String>,
    pub sequence: Option<u32>,
}

/// On-disk host inventory file: a map of host id → host attributes.
#[derive(Debug, Deserialize)]
pub struct RawHosts {
    pub hosts: HashMap<String, RawHost>,
}

#[derive(Debug, Deserialize)]
pub struct RawHost {
    pub management_endpoint: String,
    pub model: Option<String>,
    pub service_tag: Option<String>,
    pub hypervisor_ref: Option<String>,
    pub host_ref: Option<String>,
}
