pub mod error;
pub mod run;
pub mod types;


pub use error::{ErrorClass, ErrorKind, UpdateError};
pub use run::{
    job_key, ComponentResult, HostRun, MaintenanceCtx, RunCtx, RunState, TaskSummary,
};
pub use types::{
    CatalogEntry, Credentials, FirmwareUpdateRequest, Generation, HealthState, Host, HostId,
    HypervisorCredentials, ImageSource, InstallUpon, Inventory, InventoryDiff,
    InventoryObservation, InventoryRecord, ManagementProtocol, Plan, PlanId, PlanPolicy,
    PlanUpdateMode, ProgressEvent, ProgressKind, ProtocolCapability, ProtocolHealth, Secret,
    TaskCompletion, TaskObservation, UpdateArtifact, UpdateMode, UpdateStart, UpdateStatus,
    VersionChange,
};
