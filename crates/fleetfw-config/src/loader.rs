use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetfw_domain::{
    Host, HostId, InstallUpon, Plan, PlanId, PlanPolicy, PlanUpdateMode, UpdateArtifact,
};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawConfig, RawHost, RawHosts, RawPlan};

/// Dell's published catalog location, used when no override is configured.
pub const DEFAULT_CATALOG_URL: &str = "https://downloads.dell.com/catalog/Catalog.xml.gz";

// ── Orchestrator config ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Parallel host-runs.
    pub worker_count: usize,
    /// Transient-retry budget, shared default for manager and queue levels.
    pub max_attempts: u32,
    pub catalog_url: String,
    pub catalog_cache_ttl: Duration,
    pub tls: TlsConfig,
    pub timeouts: TimeoutConfig,
    pub management_secrets: String,
    pub hypervisor_secrets: String,
    pub racadm_path: PathBuf,
    pub ipmitool_path: PathBuf,
    /// redb database file; None selects the in-memory store.
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub reject_unauthorized: bool,
    pub ca_bundle_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub http: Duration,
    /// Overall Redfish task deadline (`IDRAC_UPDATE_TIMEOUT_MIN`).
    pub task: Duration,
    pub maintenance: Duration,
    pub catalog_fetch: Duration,
    /// Per-client capability detection deadline.
    pub detect: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            worker_count: 5,
            max_attempts: 3,
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            catalog_cache_ttl: Duration::from_secs(30 * 60),
            tls: TlsConfig {
                reject_unauthorized: true,
                ca_bundle_path: None,
            },
            timeouts: TimeoutConfig {
                http: Duration::from_secs(30),
                task: Duration::from_secs(90 * 60),
                maintenance: Duration::from_secs(30 * 60),
                catalog_fetch: Duration::from_secs(5 * 60),
                detect: Duration::from_secs(10),
            },
            management_secrets: "env:IDRAC".to_string(),
            hypervisor_secrets: "env:HYPERVISOR".to_string(),
            racadm_path: PathBuf::from("racadm"),
            ipmitool_path: PathBuf::from("ipmitool"),
            store_path: None,
        }
    }
}

/// Load the orchestrator config from `path` (defaults when absent), then
/// apply environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|e| ConfigError::Io {
                path: p.display().to_string(),
                source: e,
            })?;
            let raw: RawConfig =
                serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
                    path: p.display().to_string(),
                    source: e,
                })?;
            debug!("loaded config from {}", p.display());
            merge_raw(raw)
        }
        None => OrchestratorConfig::default(),
    };

    apply_env_overrides(&mut config);

    if config.worker_count == 0 {
        return Err(ConfigError::Invalid {
            path: path.map(|p| p.display().to_string()).unwrap_or_default(),
            message: "worker_count must be at least 1".to_string(),
        });
    }
    Ok(config)
}

fn merge_raw(raw: RawConfig) -> OrchestratorConfig {
    let d = OrchestratorConfig::default();
    OrchestratorConfig {
        worker_count: raw.worker_count.unwrap_or(d.worker_count),
        max_attempts: raw.max_attempts.unwrap_or(d.max_attempts),
        catalog_url: raw.catalog_url.unwrap_or(d.catalog_url),
        catalog_cache_ttl: raw
            .catalog_cache_minutes
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(d.catalog_cache_ttl),
        tls: TlsConfig {
            reject_unauthorized: raw
                .tls
                .reject_unauthorized
                .unwrap_or(d.tls.reject_unauthorized),
            ca_bundle_path: raw.tls.ca_bundle_path,
        },
        timeouts: TimeoutConfig {
            http: raw
                .timeouts
                .http_secs
                .map(Duration::from_secs)
                .unwrap_or(d.timeouts.http),
            task: raw
                .timeouts
                .task_minutes
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(d.timeouts.task),
            maintenance: raw
                .timeouts
                .maintenance_minutes
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(d.timeouts.maintenance),
            catalog_fetch: raw
                .timeouts
                .catalog_fetch_secs
                .map(Duration::from_secs)
                .unwrap_or(d.timeouts.catalog_fetch),
            detect: raw
                .timeouts
                .detect_secs
                .map(Duration::from_secs)
                .unwrap_or(d.timeouts.detect),
        },
        management_secrets: raw.management_secrets.unwrap_or(d.management_secrets),
        hypervisor_secrets: raw.hypervisor_secrets.unwrap_or(d.hypervisor_secrets),
        racadm_path: raw.racadm_path.unwrap_or(d.racadm_path),
        ipmitool_path: raw.ipmitool_path.unwrap_or(d.ipmitool_path),
        store_path: raw.store_path,
    }
}

fn apply_env_overrides(config: &mut OrchestratorConfig) {
    if let Ok(v) = std::env::var("IDRAC_UPDATE_TIMEOUT_MIN") {
        if let Ok(minutes) = v.parse::<u64>() {
            config.timeouts.task = Duration::from_secs(minutes * 60);
        }
    }
    if let Ok(v) = std::env::var("FLEETFW_WORKER_COUNT") {
        if let Ok(n) = v.parse::<usize>() {
            config.worker_count = n;
        }
    }
    if let Ok(v) = std::env::var("FLEETFW_CATALOG_URL") {
        if !v.is_empty() {
            config.catalog_url = v;
        }
    }
}

// ── Plan files ────────────────────────────────────────────────────────────────

/// Load and validate a plan file. Unknown update modes and apply times are
/// validation errors, not silently coerced.
pub fn load_plan(path: &Path) -> Result<Plan, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawPlan = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;
    convert_plan(raw, path)
}

fn convert_plan(raw: RawPlan, path: &Path) -> Result<Plan, ConfigError> {
    if raw.id.is_empty() {
        return Err(invalid(path, "plan id must not be empty"));
    }
    let update_mode = parse_update_mode(&raw.policy.update_mode, path)?;
    let install_upon = raw
        .policy
        .install_upon
        .as_deref()
        .map(|s| parse_install_upon(s, path))
        .transpose()?;

    if update_mode == PlanUpdateMode::SpecificUrl && raw.artifacts.is_empty() {
        return Err(invalid(path, "SPECIFIC_URL plans require at least one artifact"));
    }

    let artifacts = raw
        .artifacts
        .into_iter()
        .map(|a| {
            if a.image_uri.is_empty() {
                return Err(invalid(path, format!("artifact '{}' has an empty image_uri", a.component)));
            }
            Ok(UpdateArtifact {
                component: a.component,
                image_uri: a.image_uri,
                version: a.version,
                checksum: a.checksum,
                sequence: a.sequence,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Plan {
        id: PlanId::new(&raw.id),
        name: raw.name.unwrap_or(raw.id),
        policy: PlanPolicy {
            update_mode,
            catalog_url: raw.policy.catalog_url,
            targets: raw.policy.targets,
            install_upon,
            maintenance_timeout_minutes: raw.policy.maintenance_timeout_minutes,
            max_attempts: raw.policy.max_attempts,
            custom_repository_path: raw.policy.custom_repository_path,
        },
        targets: raw.targets.into_iter().map(HostId::new).collect(),
        artifacts,
    })
}

fn parse_update_mode(s: &str, path: &Path) -> Result<PlanUpdateMode, ConfigError> {
    match s {
        "LATEST_FROM_CATALOG" => Ok(PlanUpdateMode::LatestFromCatalog),
        "SPECIFIC_URL" => Ok(PlanUpdateMode::SpecificUrl),
        "MULTIPART_FILE" => Ok(PlanUpdateMode::MultipartFile),
        other => Err(invalid(
            path,
            format!(
                "unknown update_mode '{}' (expected LATEST_FROM_CATALOG, SPECIFIC_URL or MULTIPART_FILE)",
                other
            ),
        )),
    }
}

fn parse_install_upon(s: &str, path: &Path) -> Result<InstallUpon, ConfigError> {
    match s {
        "Immediate" => Ok(InstallUpon::Immediate),
        "OnReset" => Ok(InstallUpon::OnReset),
        "NextReboot" => Ok(InstallUpon::NextReboot),
        other => Err(invalid(
            path,
            format!("unknown install_upon '{}' (expected Immediate, OnReset or NextReboot)", other),
        )),
    }
}

// ── Host inventory files ──────────────────────────────────────────────────────

/// Load a host inventory file into `Host` records. Generation is left unset;
/// it is derived from probes, never from files.
pub fn load_hosts(path: &Path) -> Result<Vec<Host>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawHosts = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut hosts: Vec<Host> = raw
        .hosts
        .into_iter()
        .map(|(id, h)| convert_host(id, h))
        .collect::<Result<_, _>>()
        .map_err(|message| invalid(path, message))?;
    hosts.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
    Ok(hosts)
}

fn convert_host(id: String, raw: RawHost) -> Result<Host, String> {
    if raw.management_endpoint.is_empty() {
        return Err(format!("host '{}' has an empty management_endpoint", id));
    }
    Ok(Host {
        id: HostId::new(id),
        management_endpoint: raw.management_endpoint,
        model: raw.model,
        service_tag: raw.service_tag,
        generation: None,
        hypervisor_ref: raw.hypervisor_ref,
        host_ref: raw.host_ref,
    })
}

fn invalid(path: &Path, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        path: path.display().to_string(),
        message: message.into(),
    }
}
