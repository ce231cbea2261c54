use async_trait::async_trait;
use fleetfw_domain::{Credentials, HostId, HypervisorCredentials};
use tracing::debug;

use crate::error::SecretsError;
use crate::{env_segment, CredentialsProvider};

/// Environment-backed credentials.
///
/// Per-host keys take precedence over fleet-wide ones:
/// `{PREFIX}_{HOST}_USERNAME` / `{PREFIX}_{HOST}_PASSWORD`, falling back to
/// `{PREFIX}_USERNAME` / `{PREFIX}_PASSWORD`. Hypervisor lookups work the
/// same way keyed by the hypervisor ref, plus an `_ENDPOINT` key.
#[derive(Debug, Clone)]
pub struct EnvProvider {
    prefix: String,
}

impl EnvProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        EnvProvider { prefix: prefix.into() }
    }

    fn lookup(&self, segment: Option<&str>, key: &str) -> Option<String> {
        let name = match segment {
            Some(seg) => format!("{}_{}_{}", self.prefix, seg, key),
            None => format!("{}_{}", self.prefix, key),
        };
        std::env::var(&name).ok().filter(|v| !v.is_empty())
    }

    fn scoped(&self, scope: &str, key: &str) -> Option<String> {
        let seg = env_segment(scope);
        self.lookup(Some(&seg), key).or_else(|| self.lookup(None, key))
    }
}

#[async_trait]
impl CredentialsProvider for EnvProvider {
    async fn management_credentials(&self, host: &HostId) -> Result<Credentials, SecretsError> {
        let username = self.scoped(host.as_str(), "USERNAME");
        let password = self.scoped(host.as_str(), "PASSWORD");
        match (username, password) {
            (Some(u), Some(p)) => {
                debug!(host_id = %host, "resolved management credentials from environment");
                Ok(Credentials::new(u, p))
            }
            _ => Err(SecretsError::NotFound {
                scope: format!("host {}", host),
                detail: format!(
                    "set {0}_USERNAME/{0}_PASSWORD or a per-host override",
                    self.prefix
                ),
            }),
        }
    }

    async fn hypervisor_credentials(
        &self,
        _host: &HostId,
        hypervisor_ref: &str,
    ) -> Result<HypervisorCredentials, SecretsError> {
        let endpoint = self.scoped(hypervisor_ref, "ENDPOINT");
        let username = self.scoped(hypervisor_ref, "USERNAME");
        let password = self.scoped(hypervisor_ref, "PASSWORD");
        match (endpoint, username, password) {
            (Some(e), Some(u), Some(p)) => Ok(HypervisorCredentials {
                endpoint: e,
                credentials: Credentials::new(u, p),
            }),
            _ => Err(SecretsError::NotFound {
                scope: format!("hypervisor {}", hypervisor_ref),
                detail: format!(
                    "set {0}_{1}_ENDPOINT/_USERNAME/_PASSWORD",
                    self.prefix,
                    env_segment(hypervisor_ref)
                ),
            }),
        }
    }
}
