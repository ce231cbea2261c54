pub mod error;
mod env;
mod file;
mod vault;

use std::sync::Arc;

use async_trait::async_trait;
use fleetfw_domain::{Credentials, HostId, HypervisorCredentials};

pub use env::EnvProvider;
pub use error::SecretsError;
pub use file::FileProvider;
pub use vault::VaultProvider;

/// Resolves iDRAC and hypervisor credentials for a host id, hiding which
/// backend holds them. Implementations must be safe for concurrent reads.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Out-of-band management (iDRAC) credentials for a host.
    async fn management_credentials(&self, host: &HostId) -> Result<Credentials, SecretsError>;

    /// Hypervisor endpoint and login for the cluster managing a host.
    async fn hypervisor_credentials(
        &self,
        host: &HostId,
        hypervisor_ref: &str,
    ) -> Result<HypervisorCredentials, SecretsError>;
}

/// Build a provider from a backend ref. The prefix selects the backend:
///
/// - `env:IDRAC`: process environment, `IDRAC_*` keys
/// - `file:/etc/fleetfw/secrets.yml`: YAML map, local/dev use
/// - `vault:https://vault:8200/secret/fleetfw`: Vault KV v2 over HTTP
pub fn provider_from_ref(reference: &str) -> Result<Arc<dyn CredentialsProvider>, SecretsError> {
    if let Some(prefix) = reference.strip_prefix("env:") {
        if prefix.is_empty() {
            return Err(SecretsError::MalformedRef {
                reference: reference.to_string(),
                message: "env: requires a variable prefix".to_string(),
            });
        }
        return Ok(Arc::new(EnvProvider::new(prefix)));
    }
    if let Some(path) = reference.strip_prefix("file:") {
        return Ok(Arc::new(FileProvider::open(path.as_ref())?));
    }
    if let Some(url) = reference.strip_prefix("vault:") {
        return Ok(Arc::new(VaultProvider::from_url(url)?));
    }
    Err(SecretsError::UnknownBackend(reference.to_string()))
}

/// Routes management and hypervisor lookups to two independently
/// configured backends (`management_secrets` / `hypervisor_secrets` may
/// name different stores).
pub struct SplitProvider {
    management: Arc<dyn CredentialsProvider>,
    hypervisor: Arc<dyn CredentialsProvider>,
}

impl SplitProvider {
    pub fn new(
        management: Arc<dyn CredentialsProvider>,
        hypervisor: Arc<dyn CredentialsProvider>,
    ) -> Self {
        SplitProvider {
            management,
            hypervisor,
        }
    }
}

#[async_trait]
impl CredentialsProvider for SplitProvider {
    async fn management_credentials(&self, host: &HostId) -> Result<Credentials, SecretsError> {
        self.management.management_credentials(host).await
    }

    async fn hypervisor_credentials(
        &self,
        host: &HostId,
        hypervisor_ref: &str,
    ) -> Result<HypervisorCredentials, SecretsError> {
        self.hypervisor.hypervisor_credentials(host, hypervisor_ref).await
    }
}

/// Uppercase a host id or hypervisor ref into an environment-safe key
/// segment: `10.0.0.10` → `10_0_0_10`.
pub(crate) fn env_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_prefix_is_rejected() {
        assert!(matches!(
            provider_from_ref("db:whatever"),
            Err(SecretsError::UnknownBackend(_))
        ));
    }

    #[test]
    fn empty_env_prefix_is_rejected() {
        assert!(matches!(
            provider_from_ref("env:"),
            Err(SecretsError::MalformedRef { .. })
        ));
    }

    #[test]
    fn env_segment_sanitizes() {
        assert_eq!(env_segment("10.0.0.10"), "10_0_0_10");
        assert_eq!(env_segment("vc-01"), "VC_01");
    }
}
