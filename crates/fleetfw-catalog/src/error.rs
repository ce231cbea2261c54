use fleetfw_domain::{ErrorClass, UpdateError};
use thiserror::Error;

use crate::planner::Incompatibility;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// Download failure. Transient: the catalog host may come back.
    #[error("catalog fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("catalog parse error: {0}")]
    Parse(String),

    #[error("component '{0}' appears more than once without a sequence")]
    DuplicateComponent(String),

    /// The planner produced an empty artifact list; every requested
    /// component was incompatible or absent from the catalog.
    #[error("no compatible firmware for the requested components")]
    NoCompatibleFirmware { incompatibilities: Vec<Incompatibility> },
}

impl From<CatalogError> for UpdateError {
    fn from(e: CatalogError) -> Self {
        match &e {
            CatalogError::Fetch { .. } => {
                UpdateError::network(e.to_string()).with_class(ErrorClass::Transient)
            }
            CatalogError::Parse(_) | CatalogError::DuplicateComponent(_) => {
                UpdateError::validation(e.to_string())
            }
            CatalogError::NoCompatibleFirmware { incompatibilities } => {
                let detail: Vec<String> = incompatibilities
                    .iter()
                    .map(|i| format!("{}: {}", i.component, i.reasons.join("; ")))
                    .collect();
                UpdateError::validation(format!(
                    "no compatible firmware ({})",
                    detail.join(" | ")
                ))
            }
        }
    }
}
