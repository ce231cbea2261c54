use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use fleetfw_domain::{Credentials, HostId, HypervisorCredentials};
use serde::Deserialize;

use crate::error::SecretsError;
use crate::CredentialsProvider;

#[derive(Debug, Deserialize)]
struct RawSecretsFile {
    #[serde(default)]
    management: RawManagement,
    #[serde(default)]
    hypervisors: HashMap<String, RawHypervisor>,
}

#[derive(Debug, Default, Deserialize)]
struct RawManagement {
    default: Option<RawLogin>,
    #[serde(default)]
    hosts: HashMap<String, RawLogin>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawLogin {
    username: String,
    password: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawHypervisor {
    endpoint: String,
    username: String,
    password: String,
}

/// YAML-file-backed credentials. The local/dev stand-in for an encrypted
/// database backend; the file is read once at construction.
pub struct FileProvider {
    management_default: Option<RawLogin>,
    management_hosts: HashMap<String, RawLogin>,
    hypervisors: HashMap<String, RawHypervisor>,
}

impl FileProvider {
    pub fn open(path: &Path) -> Result<Self, SecretsError> {
        let content = std::fs::read_to_string(path).map_err(|e| SecretsError::File {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let raw: RawSecretsFile =
            serde_yaml::from_str(&content).map_err(|e| SecretsError::File {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(FileProvider {
            management_default: raw.management.default,
            management_hosts: raw.management.hosts,
            hypervisors: raw.hypervisors,
        })
    }
}

#[async_trait]
impl CredentialsProvider for FileProvider {
    async fn management_credentials(&self, host: &HostId) -> Result<Credentials, SecretsError> {
        let login = self
            .management_hosts
            .get(host.as_str())
            .or(self.management_default.as_ref())
            .ok_or_else(|| SecretsError::NotFound {
                scope: format!("host {}", host),
                detail: "no per-host entry and no management.default".to_string(),
            })?;
        Ok(Credentials::new(&login.username, &login.password))
    }

    async fn hypervisor_credentials(
        &self,
        _host: &HostId,
        hypervisor_ref: &str,
    ) -> Result<HypervisorCredentials, SecretsError> {
        let hv = self
            .hypervisors
            .get(hypervisor_ref)
            .ok_or_else(|| SecretsError::NotFound {
                scope: format!("hypervisor {}", hypervisor_ref),
                detail: "no hypervisors entry with this ref".to_string(),
            })?;
        Ok(HypervisorCredentials {
            endpoint: hv.endpoint.clone(),
            credentials: Credentials::new(&hv.username, &hv.password),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn provider(content: &str) -> FileProvider {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        FileProvider::open(f.path()).unwrap()
    }

    #[tokio::test]
    async fn per_host_beats_default() {
        let p = provider(
            r#"
management:
  default:
    username: root
    password: calvin
  hosts:
    10.0.0.11:
      username: svc-fw
      password: other
hypervisors:
  vc-01:
    endpoint: https://vcenter.example
    username: automation
    password: pw
"#,
        );
        let a = p.management_credentials(&HostId::new("10.0.0.10")).await.unwrap();
        assert_eq!(a.username, "root");
        let b = p.management_credentials(&HostId::new("10.0.0.11")).await.unwrap();
        assert_eq!(b.username, "svc-fw");

        let hv = p.hypervisor_credentials(&HostId::new("x"), "vc-01").await.unwrap();
        assert_eq!(hv.endpoint, "https://vcenter.example");
        assert!(p.hypervisor_credentials(&HostId::new("x"), "vc-02").await.is_err());
    }
}
