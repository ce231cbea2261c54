use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleetfw_domain::{
    Credentials, FirmwareUpdateRequest, HealthState, Host, ManagementProtocol, ProtocolCapability,
    ProtocolHealth, UpdateError, UpdateMode, UpdateStart,
};
use serde_json::json;
use tracing::debug;

use crate::client::ProtocolClient;
use crate::http::endpoint_host;
use crate::process::run_streamed;

const DETECT_TIMEOUT: Duration = Duration::from_secs(15);

/// IPMI transport via out-of-process `ipmitool`. Detection only: firmware
/// never flows over IPMI in this system.
pub struct IpmiClient {
    binary: PathBuf,
}

impl IpmiClient {
    pub fn new(binary: PathBuf) -> Self {
        IpmiClient { binary }
    }

    async fn mc_info(
        &self,
        host: &Host,
        creds: &Credentials,
    ) -> Result<Option<String>, UpdateError> {
        let args = vec![
            "-I".to_string(),
            "lanplus".to_string(),
            "-H".to_string(),
            endpoint_host(&host.management_endpoint),
            "-U".to_string(),
            creds.username.clone(),
            "-P".to_string(),
            creds.password.expose().to_string(),
            "mc".to_string(),
            "info".to_string(),
        ];
        let output = run_streamed(&self.binary, &args, DETECT_TIMEOUT).await?;
        if output.exit_code != 0 {
            return Err(UpdateError::network(format!(
                "ipmitool mc info exited with code {}: {}",
                output.exit_code,
                output.last_line()
            )));
        }
        Ok(parse_firmware_revision(&output.lines))
    }
}

/// `Firmware Revision  : 7.10` → `7.10`
fn parse_firmware_revision(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .find(|l| l.contains("Firmware Revision"))
        .and_then(|l| l.split(':').nth(1))
        .map(|v| v.trim().to_string())
}

#[async_trait]
impl ProtocolClient for IpmiClient {
    fn protocol(&self) -> ManagementProtocol {
        ManagementProtocol::Ipmi
    }

    fn supported_modes(&self) -> &'static [UpdateMode] {
        &[]
    }

    async fn detect_capability(&self, host: &Host, creds: &Credentials) -> ProtocolCapability {
        match self.mc_info(host, creds).await {
            Ok(firmware_version) => ProtocolCapability {
                protocol: ManagementProtocol::Ipmi,
                supported: true,
                generation: None,
                firmware_version,
                update_modes: Vec::new(),
                raw: json!({ "transport": "ipmi" }),
            },
            Err(e) => {
                debug!(host_id = %host.id, error = %e, "ipmi detection failed");
                ProtocolCapability::unsupported(ManagementProtocol::Ipmi)
            }
        }
    }

    async fn health_check(&self, host: &Host, creds: &Credentials) -> ProtocolHealth {
        let started = Instant::now();
        let result = self.mc_info(host, creds).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => ProtocolHealth {
                protocol: ManagementProtocol::Ipmi,
                status: HealthState::Healthy,
                latency_ms,
                details: None,
            },
            Err(e) => ProtocolHealth {
                protocol: ManagementProtocol::Ipmi,
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
        Err(UpdateError::validation("IPMI cannot apply firmware updates")
            .with_host(&request.host.id)
            .with_protocol(ManagementProtocol::Ipmi))
    }
}
