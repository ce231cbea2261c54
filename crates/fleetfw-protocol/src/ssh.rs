use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleetfw_domain::{
    Credentials, FirmwareUpdateRequest, HealthState, Host, ManagementProtocol, ProtocolCapability,
    ProtocolHealth, UpdateError, UpdateMode, UpdateStart,
};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::client::ProtocolClient;
use crate::http::endpoint_host;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Last-resort transport: a TCP banner probe of the iDRAC's SSH service.
/// Detection only; no commands are executed.
#[derive(Debug, Default)]
pub struct SshClient {
    port: u16,
}

impl SshClient {
    pub fn new() -> Self {
        SshClient { port: 22 }
    }

    #[cfg(test)]
    pub fn with_port(port: u16) -> Self {
        SshClient { port }
    }

    async fn read_banner(&self, host: &Host) -> Result<String, UpdateError> {
        let addr = format!("{}:{}", endpoint_host(&host.management_endpoint), self.port);
        let connect = TcpStream::connect(&addr);
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| UpdateError::timeout(format!("ssh connect to {} timed out", addr)))?
            .map_err(|e| UpdateError::network(format!("ssh connect to {} failed: {}", addr, e)))?;

        let mut buf = [0u8; 128];
        let read = tokio::time::timeout(CONNECT_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| UpdateError::timeout("ssh banner read timed out"))?
            .map_err(|e| UpdateError::network(format!("ssh banner read failed: {}", e)))?;
        let banner = String::from_utf8_lossy(&buf[..read]).trim().to_string();
        if banner.starts_with("SSH-") {
            Ok(banner)
        } else {
            Err(UpdateError::protocol(format!("unexpected banner: {}", banner)))
        }
    }
}

#[async_trait]
impl ProtocolClient for SshClient {
    fn protocol(&self) -> ManagementProtocol {
        ManagementProtocol::Ssh
    }

    fn supported_modes(&self) -> &'static [UpdateMode] {
        &[]
    }

    async fn detect_capability(&self, host: &Host, _creds: &Credentials) -> ProtocolCapability {
        match self.read_banner(host).await {
            Ok(banner) => ProtocolCapability {
                protocol: ManagementProtocol::Ssh,
                supported: true,
                generation: None,
                firmware_version: None,
                update_modes: Vec::new(),
                raw: json!({ "banner": banner }),
            },
            Err(e) => {
                debug!(host_id = %host.id, error = %e, "ssh detection failed");
                ProtocolCapability::unsupported(ManagementProtocol::Ssh)
            }
        }
    }

    async fn health_check(&self, host: &Host, _creds: &Credentials) -> ProtocolHealth {
        let started = Instant::now();
        let result = self.read_banner(host).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => ProtocolHealth {
                protocol: ManagementProtocol::Ssh,
                status: HealthState::Healthy,
                latency_ms,
                details: None,
            },
            Err(e) => ProtocolHealth {
                protocol: ManagementProtocol::Ssh,
                status: HealthState::Unreachable,
                latency_ms,
                details: Some(e.to_string()),
            },
        }
    }

    async fn perform_update(
        &self,
        request: &FirmwareUpdateRequest,
        _creds: &Credentials,
    ) -> Result<UpdateStart, UpdateError> {
        Err(UpdateError::validation("SSH cannot apply firmware updates")
            .with_host(&request.host.id)
            .with_protocol(ManagementProtocol::Ssh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetfw_domain::HostId;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn host(endpoint: &str) -> Host {
        Host {
            id: HostId::new("h1"),
            management_endpoint: endpoint.to_string(),
            model: None,
            service_tag: None,
            generation: None,
            hypervisor_ref: None,
            host_ref: None,
        }
    }

    #[tokio::test]
    async fn detects_ssh_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"SSH-2.0-OpenSSH_7.4\r\n").await.unwrap();
        });

        let client = SshClient::with_port(port);
        let cap = client
            .detect_capability(&host("127.0.0.1"), &Credentials::new("root", "calvin"))
            .await;
        assert!(cap.supported);
        assert_eq!(cap.raw["banner"].as_str().unwrap(), "SSH-2.0-OpenSSH_7.4");
    }

    #[tokio::test]
    async fn refused_connection_is_unsupported() {
        let client = SshClient::with_port(1);
        let cap = client
            .detect_capability(&host("127.0.0.1"), &Credentials::new("root", "calvin"))
            .await;
        assert!(!cap.supported);
    }
}
