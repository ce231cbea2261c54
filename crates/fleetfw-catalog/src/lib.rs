pub mod catalog;
pub mod compat;
pub mod error;
pub mod planner;

pub use catalog::{
    compare_versions, fetch_catalog, find_latest, parse_catalog_bytes, parse_catalog_xml,
    CatalogCache,
};
pub use compat::{sort_update_order, validate_compatibility, Compatibility};
pub use error::CatalogError;
pub use planner::{
    check_artifact_sequence, FirmwarePlan, FirmwarePlanner, Incompatibility, PlanRequest,
    PlannedArtifact,
};
