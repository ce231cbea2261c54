use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostId(pub String);

impl HostId {
    pub fn new(s: impl Into<String>) -> Self {
        HostId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new(s: impl Into<String>) -> Self {
        PlanId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Hardware generation ───────────────────────────────────────────────────────

/// PowerEdge hardware generation, derived from iDRAC probes rather than
/// user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Generation {
    #[serde(rename = "11G")]
    G11,
    #[serde(rename = "12G")]
    G12,
    #[serde(rename = "13G")]
    G13,
    #[serde(rename = "14G")]
    G14,
    #[serde(rename = "15G")]
    G15,
    #[serde(rename = "16G")]
    G16,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl Generation {
    /// Derive the generation from the iDRAC product line and its firmware
    /// version string. iDRAC6 through iDRAC8 map one-to-one; iDRAC9 spans
    /// 14G-16G and is split on the firmware major.
    pub fn from_idrac(idrac_major: u8, firmware: &str) -> Generation {
        match idrac_major {
            6 => Generation::G11,
            7 => Generation::G12,
            8 => Generation::G13,
            9 => {
                let fw_major = firmware
                    .split('.')
                    .next()
                    .and_then(|s| s.parse::<u32>().ok())
                    .unwrap_or(0);
                match fw_major {
                    0..=5 => Generation::G14,
                    6 => Generation::G15,
                    _ => Generation::G16,
                }
            }
            _ => Generation::Unknown,
        }
    }

    /// Scan a free-form model string (e.g. a Redfish Manager `Model` of
    /// `"14G Monolithic"` or `"iDRAC9"`) for a generation marker.
    pub fn from_model_string(model: &str) -> Generation {
        for (needle, gen) in [
            ("11G", Generation::G11),
            ("12G", Generation::G12),
            ("13G", Generation::G13),
            ("14G", Generation::G14),
            ("15G", Generation::G15),
            ("16G", Generation::G16),
        ] {
            if model.contains(needle) {
                return gen;
            }
        }
        Generation::Unknown
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Generation::G11 => "11G",
            Generation::G12 => "12G",
            Generation::G13 => "13G",
            Generation::G14 => "14G",
            Generation::G15 => "15G",
            Generation::G16 => "16G",
            Generation::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

// ── Management protocols ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagementProtocol {
    Redfish,
    Wsman,
    Racadm,
    Ipmi,
    Ssh,
}

impl ManagementProtocol {
    /// Static ranking used by the protocol manager. Higher is tried first.
    pub fn priority(&self) -> u8 {
        match self {
            ManagementProtocol::Redfish => 50,
            ManagementProtocol::Wsman => 40,
            ManagementProtocol::Racadm => 30,
            ManagementProtocol::Ipmi => 20,
            ManagementProtocol::Ssh => 10,
        }
    }
}

impl std::fmt::Display for ManagementProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagementProtocol::Redfish => write!(f, "redfish"),
            ManagementProtocol::Wsman => write!(f, "wsman"),
            ManagementProtocol::Racadm => write!(f, "racadm"),
            ManagementProtocol::Ipmi => write!(f, "ipmi"),
            ManagementProtocol::Ssh => write!(f, "ssh"),
        }
    }
}

// ── Update modes ──────────────────────────────────────────────────────────────

/// Protocol-level update mechanism a client can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateMode {
    SimpleUpdate,
    MultipartUpdate,
    InstallFromRepository,
}

impl std::fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateMode::SimpleUpdate => write!(f, "SIMPLE_UPDATE"),
            UpdateMode::MultipartUpdate => write!(f, "MULTIPART_UPDATE"),
            UpdateMode::InstallFromRepository => write!(f, "INSTALL_FROM_REPOSITORY"),
        }
    }
}

/// Plan-level update strategy selected by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanUpdateMode {
    LatestFromCatalog,
    SpecificUrl,
    MultipartFile,
}

impl std::fmt::Display for PlanUpdateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanUpdateMode::LatestFromCatalog => write!(f, "LATEST_FROM_CATALOG"),
            PlanUpdateMode::SpecificUrl => write!(f, "SPECIFIC_URL"),
            PlanUpdateMode::MultipartFile => write!(f, "MULTIPART_FILE"),
        }
    }
}

/// When the iDRAC should apply a staged image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InstallUpon {
    #[default]
    Immediate,
    OnReset,
    NextReboot,
}

impl InstallUpon {
    /// Per-component default: BIOS images stage until the next reset, iDRAC
    /// and everything else apply immediately.
    pub fn default_for(component: &str) -> InstallUpon {
        if component.eq_ignore_ascii_case("BIOS") {
            InstallUpon::OnReset
        } else {
            InstallUpon::Immediate
        }
    }

    /// The Redfish `@Redfish.OperationApplyTime` value for this setting.
    pub fn redfish_apply_time(&self) -> &'static str {
        match self {
            InstallUpon::Immediate => "Immediate",
            InstallUpon::OnReset => "OnReset",
            InstallUpon::NextReboot => "OnStartUpdateRequest",
        }
    }
}

// ── Hosts ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    /// iDRAC address (hostname or IP, optional `:port`). Immutable per id.
    pub management_endpoint: String,
    pub model: Option<String>,
    pub service_tag: Option<String>,
    /// Derived from probes, never user input.
    pub generation: Option<Generation>,
    /// Opaque hypervisor identifier; absence means no maintenance phase.
    pub hypervisor_ref: Option<String>,
    /// Opaque host identifier inside the hypervisor API.
    pub host_ref: Option<String>,
}

// ── Credentials ───────────────────────────────────────────────────────────────

/// A password that never appears in logs or persisted records.
///
/// `Debug` and `Serialize` emit a fixed redaction marker; the backing
/// memory is wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Secret(s.into())
    }

    /// Read the raw value. Callers must not log or persist it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"***\"")
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(Secret(String::deserialize(d)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: Secret::new(password),
        }
    }
}

/// Hypervisor login material: where to talk and as whom.
#[derive(Debug, Clone)]
pub struct HypervisorCredentials {
    pub endpoint: String,
    pub credentials: Credentials,
}

// ── Plans ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPolicy {
    pub update_mode: PlanUpdateMode,
    /// Override for the Dell default catalog URL.
    pub catalog_url: Option<String>,
    /// Redfish target identifiers passed through `SimpleUpdate`.
    #[serde(default)]
    pub targets: Vec<String>,
    pub install_upon: Option<InstallUpon>,
    pub maintenance_timeout_minutes: Option<u64>,
    /// Transient-retry budget; None means the configured default.
    pub max_attempts: Option<u32>,
    /// Local mirror directory checked before remote catalog URLs.
    pub custom_repository_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateArtifact {
    pub component: String,
    pub image_uri: String,
    pub version: Option<String>,
    /// SHA-256 hex digest, verified for locally readable images.
    pub checksum: Option<String>,
    /// Explicit ordering for plans that repeat a component.
    pub sequence: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub policy: PlanPolicy,
    pub targets: Vec<HostId>,
    #[serde(default)]
    pub artifacts: Vec<UpdateArtifact>,
}

// ── Protocol capability and health ───────────────────────────────────────────

/// What a single probe learned about one protocol on one host. Cacheable
/// for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolCapability {
    pub protocol: ManagementProtocol,
    pub supported: bool,
    pub generation: Option<Generation>,
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub update_modes: Vec<UpdateMode>,
    /// Raw probe response, kept opaquely for debugging.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl ProtocolCapability {
    /// The capability of an unreachable or unsupported protocol.
    pub fn unsupported(protocol: ManagementProtocol) -> Self {
        ProtocolCapability {
            protocol,
            supported: false,
            generation: None,
            firmware_version: None,
            update_modes: Vec::new(),
            raw: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolHealth {
    pub protocol: ManagementProtocol,
    pub status: HealthState,
    pub latency_ms: u64,
    pub details: Option<String>,
}

// ── Firmware update requests ──────────────────────────────────────────────────

/// Where a firmware image body comes from for streamed uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSource {
    /// Fetched over HTTP and streamed through without buffering.
    Url(String),
    /// Read from a local path (also reached via `file://` URIs).
    File(PathBuf),
}

impl ImageSource {
    /// Parse an artifact URI into a source. `file://` and bare paths map to
    /// local files, anything `http(s)` stays remote.
    pub fn parse(uri: &str) -> ImageSource {
        if let Some(path) = uri.strip_prefix("file://") {
            ImageSource::File(PathBuf::from(path))
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            ImageSource::Url(uri.to_string())
        } else {
            ImageSource::File(PathBuf::from(uri))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareUpdateRequest {
    pub host: Host,
    pub mode: UpdateMode,
    /// Component types this request covers (informational for most modes).
    #[serde(default)]
    pub components: Vec<String>,
    /// Image location for SIMPLE_UPDATE / MULTIPART_UPDATE.
    pub image: Option<ImageSource>,
    /// Catalog/repository URL for INSTALL_FROM_REPOSITORY.
    pub repository_url: Option<String>,
    #[serde(default)]
    pub install_upon: InstallUpon,
    /// Redfish target identifiers forwarded verbatim.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Protocol-specific pass-through parameters.
    #[serde(default)]
    pub additional_params: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    Queued,
    Failed,
}

/// What a client reports after submitting an update to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStart {
    pub status: UpdateStatus,
    pub job_id: Option<String>,
    /// Redfish task URI to poll, when the protocol exposes one.
    pub task_location: Option<String>,
    #[serde(default)]
    pub messages: Vec<String>,
}

// ── Task observation ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCompletion {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Progress,
    Info,
    Warning,
    Error,
}

/// A structured log event surfaced to run observers while a task executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn now(kind: ProgressKind, message: impl Into<String>) -> Self {
        ProgressEvent {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One firmware component as reported by the management controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub id: String,
    pub name: String,
    pub version: String,
}

pub type Inventory = Vec<InventoryRecord>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionChange {
    pub id: String,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDiff {
    pub added: Vec<InventoryRecord>,
    pub removed: Vec<InventoryRecord>,
    pub version_changed: Vec<VersionChange>,
}

impl InventoryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.version_changed.is_empty()
    }
}

/// Everything the task poller learned about one Redfish task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskObservation {
    pub task_location: String,
    pub state: TaskCompletion,
    pub percent: Option<u8>,
    pub messages: Vec<String>,
    pub inventory: Option<InventoryObservation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryObservation {
    pub before: Inventory,
    pub after: Inventory,
    pub changes: InventoryDiff,
}

// ── Catalog entries ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub component_type: String,
    pub version: String,
    /// Absolute download URL, resolved against the catalog base.
    pub url: String,
    #[serde(default)]
    pub supported_models: Vec<String>,
    pub release_date: Option<DateTime<Utc>>,
}
