use fleetfw_domain::UpdateError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("host-run not found: {0}")]
    RunNotFound(Uuid),

    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("illegal transition for run {run_id}: {from} -> {to}")]
    IllegalTransition {
        run_id: Uuid,
        from: String,
        to: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}

// The queue and run records are required dependencies of a live run.
impl From<StoreError> for UpdateError {
    fn from(e: StoreError) -> Self {
        UpdateError::dependency(e.to_string())
    }
}
