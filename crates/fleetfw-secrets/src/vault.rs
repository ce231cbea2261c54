use async_trait::async_trait;
use fleetfw_domain::{Credentials, HostId, HypervisorCredentials};
use serde_json::Value;
use tracing::debug;

use crate::error::SecretsError;
use crate::CredentialsProvider;

/// Vault KV v2 backend.
///
/// Ref format: `vault:https://vault:8200/<mount>/<base-path>`. Host
/// credentials live at `<base-path>/hosts/<host-id>`, hypervisor entries at
/// `<base-path>/hypervisors/<ref>` with an extra `endpoint` field. The
/// token comes from `VAULT_TOKEN`.
pub struct VaultProvider {
    client: reqwest::Client,
    addr: String,
    mount: String,
    base_path: String,
    token: String,
}

impl VaultProvider {
    pub fn from_url(url: &str) -> Result<Self, SecretsError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| SecretsError::MalformedRef {
            reference: format!("vault:{}", url),
            message: e.to_string(),
        })?;
        let addr = format!(
            "{}://{}",
            parsed.scheme(),
            parsed.host_str().map(|h| match parsed.port() {
                Some(p) => format!("{}:{}", h, p),
                None => h.to_string(),
            }).ok_or_else(|| SecretsError::MalformedRef {
                reference: format!("vault:{}", url),
                message: "missing host".to_string(),
            })?
        );
        let mut segments = parsed
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect::<Vec<_>>())
            .unwrap_or_default();
        if segments.is_empty() {
            return Err(SecretsError::MalformedRef {
                reference: format!("vault:{}", url),
                message: "expected /<mount>/<base-path>".to_string(),
            });
        }
        let mount = segments.remove(0).to_string();
        let base_path = segments.join("/");
        let token = std::env::var("VAULT_TOKEN").map_err(|_| SecretsError::Vault(
            "VAULT_TOKEN is not set".to_string(),
        ))?;

        Ok(VaultProvider {
            client: reqwest::Client::new(),
            addr,
            mount,
            base_path,
            token,
        })
    }

    #[cfg(test)]
    fn with_static_token(addr: &str, mount: &str, base_path: &str, token: &str) -> Self {
        VaultProvider {
            client: reqwest::Client::new(),
            addr: addr.to_string(),
            mount: mount.to_string(),
            base_path: base_path.to_string(),
            token: token.to_string(),
        }
    }

    /// Read the `data.data` object of a KV v2 secret.
    async fn read(&self, sub_path: &str) -> Result<Value, SecretsError> {
        let url = if self.base_path.is_empty() {
            format!("{}/v1/{}/data/{}", self.addr, self.mount, sub_path)
        } else {
            format!("{}/v1/{}/data/{}/{}", self.addr, self.mount, self.base_path, sub_path)
        };
        debug!(%url, "vault read");
        let resp = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| SecretsError::Vault(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretsError::NotFound {
                scope: sub_path.to_string(),
                detail: "vault returned 404".to_string(),
            });
        }
        if !status.is_success() {
            return Err(SecretsError::Vault(format!("{} returned {}", url, status)));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| SecretsError::Vault(e.to_string()))?;
        Ok(body["data"]["data"].clone())
    }

    fn field(data: &Value, key: &str, scope: &str) -> Result<String, SecretsError> {
        data[key]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SecretsError::NotFound {
                scope: scope.to_string(),
                detail: format!("secret has no '{}' field", key),
            })
    }
}

#[async_trait]
impl CredentialsProvider for VaultProvider {
    async fn management_credentials(&self, host: &HostId) -> Result<Credentials, SecretsError> {
        let scope = format!("host {}", host);
        let data = self.read(&format!("hosts/{}", host)).await?;
        Ok(Credentials::new(
            Self::field(&data, "username", &scope)?,
            Self::field(&data, "password", &scope)?,
        ))
    }

    async fn hypervisor_credentials(
        &self,
        _host: &HostId,
        hypervisor_ref: &str,
    ) -> Result<HypervisorCredentials, SecretsError> {
        let scope = format!("hypervisor {}", hypervisor_ref);
        let data = self.read(&format!("hypervisors/{}", hypervisor_ref)).await?;
        Ok(HypervisorCredentials {
            endpoint: Self::field(&data, "endpoint", &scope)?,
            credentials: Credentials::new(
                Self::field(&data, "username", &scope)?,
                Self::field(&data, "password", &scope)?,
            ),
        })
    }
}
