use fleetfw_domain::UpdateError;
use thiserror::Error;

/// Credential resolution failures. All of them are critical for a live run:
/// without credentials the run cannot proceed meaningfully.
#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("unknown secrets backend ref '{0}' (expected env:, file: or vault: prefix)")]
    UnknownBackend(String),

    #[error("no credentials found for {scope}: {detail}")]
    NotFound { scope: String, detail: String },

    #[error("secrets file error at {path}: {message}")]
    File { path: String, message: String },

    #[error("vault request failed: {0}")]
    Vault(String),

    #[error("malformed secrets backend ref '{reference}': {message}")]
    MalformedRef { reference: String, message: String },
}

impl From<SecretsError> for UpdateError {
    fn from(e: SecretsError) -> Self {
        UpdateError::dependency(e.to_string())
    }
}
