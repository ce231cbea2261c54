use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleetfw_domain::{
    Credentials, FirmwareUpdateRequest, Generation, HealthState, Host, ManagementProtocol,
    ProtocolCapability, ProtocolHealth, UpdateError, UpdateMode, UpdateStart, UpdateStatus,
};
use regex::Regex;
use serde_json::json;
use tracing::{debug, info};

use crate::client::ProtocolClient;
use crate::http::endpoint_host;
use crate::process::run_streamed;

const SUPPORTED_MODES: &[UpdateMode] = &[UpdateMode::InstallFromRepository];

const DETECT_TIMEOUT: Duration = Duration::from_secs(20);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Out-of-process `racadm` transport. Used as the repository-update
/// fallback when Redfish reports the install action missing.
pub struct RacadmClient {
    binary: PathBuf,
}

impl RacadmClient {
    pub fn new(binary: PathBuf) -> Self {
        RacadmClient { binary }
    }

    fn base_args(&self, host: &Host, creds: &Credentials) -> Vec<String> {
        vec![
            "-r".to_string(),
            endpoint_host(&host.management_endpoint),
            "-u".to_string(),
            creds.username.clone(),
            "-p".to_string(),
            creds.password.expose().to_string(),
            "--nocertwarn".to_string(),
        ]
    }

    async fn getversion(
        &self,
        host: &Host,
        creds: &Credentials,
    ) -> Result<Option<String>, UpdateError> {
        let mut args = self.base_args(host, creds);
        args.push("getversion".to_string());
        let output = run_streamed(&self.binary, &args, DETECT_TIMEOUT).await?;
        if output.exit_code != 0 {
            return Err(UpdateError::network(format!(
                "racadm getversion exited with code {}: {}",
                output.exit_code,
                output.last_line()
            )));
        }
        Ok(parse_idrac_version(&output.lines))
    }
}

/// `iDRAC Version = 5.10.50.00` → `5.10.50.00`
fn parse_idrac_version(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .find(|l| l.contains("iDRAC Version"))
        .and_then(|l| l.split('=').nth(1))
        .map(|v| v.trim().to_string())
}

fn extract_job_id(lines: &[String]) -> Option<String> {
    let re = Regex::new(r"JID_\d+").ok()?;
    lines.iter().find_map(|l| re.find(l).map(|m| m.as_str().to_string()))
}

/// Split a repository URL into the racadm `-e <address/share>` and
/// `-f <catalog file>` arguments.
fn repo_args(repository_url: &str) -> (String, String) {
    let stripped = repository_url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    match stripped.rsplit_once('/') {
        Some((share, file)) if file.to_ascii_lowercase().contains(".xml") => {
            (share.to_string(), file.to_string())
        }
        _ => (stripped.trim_end_matches('/').to_string(), "Catalog.xml.gz".to_string()),
    }
}

#[async_trait]
impl ProtocolClient for RacadmClient {
    fn protocol(&self) -> ManagementProtocol {
        ManagementProtocol::Racadm
    }

    fn supported_modes(&self) -> &'static [UpdateMode] {
        SUPPORTED_MODES
    }

    async fn detect_capability(&self, host: &Host, creds: &Credentials) -> ProtocolCapability {
        match self.getversion(host, creds).await {
            Ok(firmware_version) => ProtocolCapability {
                protocol: ManagementProtocol::Racadm,
                supported: true,
                generation: firmware_version
                    .as_deref()
                    .map(|fw| Generation::from_idrac(9, fw))
                    .filter(|g| *g != Generation::Unknown),
                firmware_version,
                update_modes: SUPPORTED_MODES.to_vec(),
                raw: json!({ "transport": "racadm" }),
            },
            Err(e) => {
                debug!(host_id = %host.id, error = %e, "racadm detection failed");
                ProtocolCapability::unsupported(ManagementProtocol::Racadm)
            }
        }
    }

    async fn health_check(&self, host: &Host, creds: &Credentials) -> ProtocolHealth {
        let started = Instant::now();
        let result = self.getversion(host, creds).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => ProtocolHealth {
                protocol: ManagementProtocol::Racadm,
                status: HealthState::Healthy,
                latency_ms,
                details: None,
            },
            Err(e) => ProtocolHealth {
                protocol: ManagementProtocol::Racadm,
                status: HealthState::Unreachable,
                latency_ms,
                details: Some(e.to_string()),
            },
        }
    }

    async fn perform_update(
        &self,
        request: &FirmwareUpdateRequest,
        creds: &Credentials,
    ) -> Result<UpdateStart, UpdateError> {
        let repository_url = request.repository_url.as_deref().ok_or_else(|| {
            UpdateError::validation("racadm update requires a repository URL")
                .with_host(&request.host.id)
        })?;
        let (share, catalog_file) = repo_args(repository_url);

        let mut args = self.base_args(&request.host, creds);
        args.extend(
            [
                "update", "-f", &catalog_file, "-e", &share, "-a", "TRUE", "-t", "HTTP",
            ]
            .iter()
            .map(|s| s.to_string()),
        );

        info!(host_id = %request.host.id, %share, "racadm repository update");
        let output = run_streamed(&self.binary, &args, UPDATE_TIMEOUT)
            .await
            .map_err(|e| e.with_host(&request.host.id).with_protocol(ManagementProtocol::Racadm))?;

        if output.exit_code != 0 {
            return Err(UpdateError::protocol(format!(
                "racadm update exited with code {}: {}",
                output.exit_code,
                output.last_line()
            ))
            .with_host(&request.host.id)
            .with_protocol(ManagementProtocol::Racadm));
        }

        Ok(UpdateStart {
            status: UpdateStatus::Queued,
            job_id: extract_job_id(&output.lines),
            task_location: None,
            messages: output.lines,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_line_parses() {
        let lines = vec![
            "Safer Remote Access Controller Admin".to_string(),
            "iDRAC Version = 5.10.50.00".to_string(),
            "Bios Version = 2.20.0".to_string(),
        ];
        assert_eq!(parse_idrac_version(&lines).as_deref(), Some("5.10.50.00"));
        assert_eq!(parse_idrac_version(&[]), None);
    }

    #[test]
    fn job_id_extraction_from_update_output() {
        let lines = vec![
            "Initiating repository update...".to_string(),
            "Job JID_271338583761 scheduled".to_string(),
        ];
        assert_eq!(extract_job_id(&lines).as_deref(), Some("JID_271338583761"));
    }

    #[test]
    fn repository_url_splits_into_share_and_catalog() {
        assert_eq!(
            repo_args("https://downloads.dell.com/catalog/Catalog.xml.gz"),
            ("downloads.dell.com/catalog".to_string(), "Catalog.xml.gz".to_string())
        );
        assert_eq!(
            repo_args("https://mirror.internal/repo"),
            ("mirror.internal/repo".to_string(), "Catalog.xml.gz".to_string())
        );
    }
}
