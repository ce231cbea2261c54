use std::time::Instant;

use async_trait::async_trait;
use fleetfw_domain::{
    Credentials, FirmwareUpdateRequest, Generation, HealthState, Host, ImageSource,
    ManagementProtocol, ProtocolCapability, ProtocolHealth, UpdateError, UpdateMode, UpdateStart,
    UpdateStatus,
};
use regex::Regex;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, StatusCode};
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::client::ProtocolClient;
use crate::http::{classify_transport, normalize_base_url, HttpSettings};

const SERVICE_ROOT: &str = "/redfish/v1/";
const UPDATE_SERVICE: &str = "/redfish/v1/UpdateService";
const MANAGER: &str = "/redfish/v1/Managers/iDRAC.Embedded.1";
const FIRMWARE_INVENTORY: &str = "/redfish/v1/UpdateService/FirmwareInventory";
const SYSTEM_RESET: &str = "/redfish/v1/Systems/System.Embedded.1/Actions/ComputerSystem.Reset";
const REPO_INSTALL: &str = "/redfish/v1/Dell/Systems/System.Embedded.1/DellSoftwareInstallationService/Actions/DellSoftwareInstallationService.InstallFromRepository";

const SUPPORTED_MODES: &[UpdateMode] = &[
    UpdateMode::SimpleUpdate,
    UpdateMode::MultipartUpdate,
    UpdateMode::InstallFromRepository,
];

/// Update actions discovered from `/redfish/v1/UpdateService`. Dell's
/// repository install is not advertised here; it lives on a fixed OEM path
/// and 404s when absent.
#[derive(Debug, Clone, Default)]
pub struct UpdateActions {
    pub simple_update: Option<String>,
    pub multipart_push_uri: Option<String>,
}

/// DMTF Redfish client against a Dell iDRAC.
pub struct RedfishClient {
    http: reqwest::Client,
    /// Test hook: replaces the `https://<host>` base computed per host.
    base_override: Option<String>,
}

impl RedfishClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, UpdateError> {
        Ok(RedfishClient {
            http: settings.build_client()?,
            base_override: None,
        })
    }

    /// Pin every request to a fixed base URL instead of deriving it from
    /// the host endpoint. For tests and mock BMCs.
    pub fn with_base(settings: &HttpSettings, base: impl Into<String>) -> Self {
        RedfishClient {
            http: settings.build_client().expect("client build"),
            base_override: Some(base.into()),
        }
    }

    fn base_for(&self, host: &Host) -> Result<String, UpdateError> {
        match &self.base_override {
            Some(base) => Ok(base.clone()),
            None => normalize_base_url(&host.management_endpoint),
        }
    }

    /// Authenticated GET returning parsed JSON.
    pub async fn get_json(
        &self,
        host: &Host,
        creds: &Credentials,
        path: &str,
    ) -> Result<Value, UpdateError> {
        let url = format!("{}{}", self.base_for(host)?, path);
        let resp = self
            .http
            .get(&url)
            .basic_auth(&creds.username, Some(creds.password.expose()))
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpdateError::from_http_status(
                status.as_u16(),
                format!("GET {} returned {}", path, status),
            ));
        }
        resp.json().await.map_err(|e| {
            UpdateError::protocol(format!("GET {} returned malformed JSON: {}", path, e))
        })
    }

    async fn post_action(
        &self,
        host: &Host,
        creds: &Credentials,
        path: &str,
        body: Value,
    ) -> Result<UpdateStart, UpdateError> {
        let url = format!("{}{}", self.base_for(host)?, path);
        let resp = self
            .http
            .post(&url)
            .basic_auth(&creds.username, Some(creds.password.expose()))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        self.finish_submit(resp, path).await
    }

    async fn finish_submit(
        &self,
        resp: reqwest::Response,
        path: &str,
    ) -> Result<UpdateStart, UpdateError> {
        let status = resp.status();
        let task_location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.unwrap_or_default();
        let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        if status == StatusCode::NOT_FOUND {
            // Discovery lied or the firmware predates the action.
            return Err(UpdateError::action_missing(format!("{} returned 404", path)));
        }
        if !status.is_success() {
            let detail = extract_messages(&body).join("; ");
            return Err(UpdateError::from_http_status(
                status.as_u16(),
                format!("POST {} returned {}: {}", path, status, detail),
            ));
        }

        let task_location = task_location.or_else(|| {
            body["@odata.id"].as_str().map(str::to_string)
        });
        let job_id = task_location.as_deref().and_then(extract_job_id);
        Ok(UpdateStart {
            status: UpdateStatus::Queued,
            job_id,
            task_location,
            messages: extract_messages(&body),
        })
    }

    /// Discover the update actions this iDRAC exposes.
    pub async fn discover_update_actions(
        &self,
        host: &Host,
        creds: &Credentials,
    ) -> Result<UpdateActions, UpdateError> {
        let service = self.get_json(host, creds, UPDATE_SERVICE).await?;
        Ok(UpdateActions {
            simple_update: service["Actions"]["#UpdateService.SimpleUpdate"]["target"]
                .as_str()
                .map(str::to_string),
            multipart_push_uri: service["MultipartHttpPushUri"].as_str().map(str::to_string),
        })
    }

    async fn simple_update(
        &self,
        request: &FirmwareUpdateRequest,
        creds: &Credentials,
    ) -> Result<UpdateStart, UpdateError> {
        let actions = self.discover_update_actions(&request.host, creds).await?;
        let target = actions.simple_update.ok_or_else(|| {
            UpdateError::action_missing("UpdateService does not expose SimpleUpdate")
        })?;

        let image_uri = match &request.image {
            Some(ImageSource::Url(uri)) => uri.clone(),
            Some(ImageSource::File(_)) | None => {
                return Err(UpdateError::validation(
                    "SIMPLE_UPDATE requires an http(s) image URI reachable by the iDRAC",
                ))
            }
        };

        let mut body = json!({
            "ImageURI": image_uri,
            "@Redfish.OperationApplyTime": request.install_upon.redfish_apply_time(),
        });
        if !request.targets.is_empty() {
            body["Targets"] = json!(request.targets);
        }
        debug!(host_id = %request.host.id, %image_uri, "redfish SimpleUpdate");
        self.post_action(&request.host, creds, &target, body).await
    }

    async fn multipart_update(
        &self,
        request: &FirmwareUpdateRequest,
        creds: &Credentials,
    ) -> Result<UpdateStart, UpdateError> {
        let actions = self.discover_update_actions(&request.host, creds).await?;
        let push_uri = actions.multipart_push_uri.ok_or_else(|| {
            UpdateError::action_missing("UpdateService does not expose MultipartHttpPushUri")
        })?;

        let source = request.image.as_ref().ok_or_else(|| {
            UpdateError::validation("MULTIPART_UPDATE requires an image source")
        })?;
        let file_part = self.image_part(source).await?;

        let mut params = json!({
            "@Redfish.OperationApplyTime": request.install_upon.redfish_apply_time(),
        });
        if !request.targets.is_empty() {
            params["Targets"] = json!(request.targets);
        }
        let params_part = Part::text(params.to_string())
            .mime_str("application/json")
            .map_err(|e| UpdateError::protocol(e.to_string()))?;

        let form = Form::new()
            .part("UpdateParameters", params_part)
            .part("UpdateFile", file_part);

        let url = format!("{}{}", self.base_for(&request.host)?, push_uri);
        debug!(host_id = %request.host.id, %push_uri, "redfish multipart update");
        let resp = self
            .http
            .post(&url)
            .basic_auth(&creds.username, Some(creds.password.expose()))
            .multipart(form)
            .send()
            .await
            .map_err(classify_transport)?;
        self.finish_submit(resp, &push_uri).await
    }

    /// Build the streamed `UpdateFile` part. The image body flows through
    /// end-to-end; it is never buffered in memory.
    async fn image_part(&self, source: &ImageSource) -> Result<Part, UpdateError> {
        let part = match source {
            ImageSource::File(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    UpdateError::validation(format!("cannot open image {}: {}", path.display(), e))
                })?;
                let len = file
                    .metadata()
                    .await
                    .map_err(|e| UpdateError::validation(e.to_string()))?
                    .len();
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "firmware.img".to_string());
                Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), len)
                    .file_name(name)
            }
            ImageSource::Url(url) => {
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(classify_transport)?;
                if !resp.status().is_success() {
                    return Err(UpdateError::from_http_status(
                        resp.status().as_u16(),
                        format!("image fetch {} returned {}", url, resp.status()),
                    ));
                }
                let name = url
                    .rsplit('/')
                    .next()
                    .filter(|n| !n.is_empty())
                    .unwrap_or("firmware.img")
                    .to_string();
                match resp.content_length() {
                    Some(len) => {
                        Part::stream_with_length(Body::wrap_stream(resp.bytes_stream()), len)
                            .file_name(name)
                    }
                    None => Part::stream(Body::wrap_stream(resp.bytes_stream())).file_name(name),
                }
            }
        };
        part.mime_str("application/octet-stream")
            .map_err(|e| UpdateError::protocol(e.to_string()))
    }

    /// Dell OEM repository-driven install. 404 means the firmware predates
    /// the action; the caller falls back to RACADM.
    pub async fn install_from_repository(
        &self,
        host: &Host,
        creds: &Credentials,
        repository_url: &str,
    ) -> Result<UpdateStart, UpdateError> {
        let body = json!({
            "RepositoryURL": repository_url,
            "ApplyUpdate": "True",
            "RebootNeeded": true,
            "IgnoreCertWarning": "On",
        });
        debug!(host_id = %host.id, %repository_url, "redfish InstallFromRepository");
        self.post_action(host, creds, REPO_INSTALL, body).await
    }

    /// Redfish `ComputerSystem.Reset`; used when a plan staged images with
    /// `OnReset` and asks for an explicit reset.
    pub async fn reset_system(
        &self,
        host: &Host,
        creds: &Credentials,
        reset_type: &str,
    ) -> Result<(), UpdateError> {
        let start = self
            .post_action(host, creds, SYSTEM_RESET, json!({ "ResetType": reset_type }))
            .await?;
        debug!(host_id = %host.id, messages = ?start.messages, "system reset requested");
        Ok(())
    }

    /// Software inventory members, fully expanded.
    pub async fn firmware_inventory_raw(
        &self,
        host: &Host,
        creds: &Credentials,
    ) -> Result<Vec<Value>, UpdateError> {
        let collection = self.get_json(host, creds, FIRMWARE_INVENTORY).await?;
        let mut members = Vec::new();
        if let Some(refs) = collection["Members"].as_array() {
            for member in refs {
                if let Some(path) = member["@odata.id"].as_str() {
                    match self.get_json(host, creds, path).await {
                        Ok(v) => members.push(v),
                        Err(e) if e.is_retryable() => return Err(e),
                        Err(e) => {
                            warn!(%path, error = %e, "inventory member fetch failed, skipping")
                        }
                    }
                }
            }
        }
        Ok(members)
    }
}

fn extract_job_id(location: &str) -> Option<String> {
    // Dell job ids embedded in task URIs: .../Tasks/JID_123456789012
    static PATTERN: &str = r"JID_\d+";
    Regex::new(PATTERN).ok()?.find(location).map(|m| m.as_str().to_string())
}

/// Collect human-readable messages from a Redfish response body.
pub fn extract_messages(body: &Value) -> Vec<String> {
    let mut out = Vec::new();
    for key in ["Messages", "@Message.ExtendedInfo"] {
        if let Some(arr) = body[key].as_array() {
            for m in arr {
                if let Some(text) = m["Message"].as_str().or_else(|| m.as_str()) {
                    out.push(text.to_string());
                }
            }
        }
    }
    if out.is_empty() {
        if let Some(text) = body["error"]["message"].as_str() {
            out.push(text.to_string());
        }
    }
    out
}

#[async_trait]
impl ProtocolClient for RedfishClient {
    fn protocol(&self) -> ManagementProtocol {
        ManagementProtocol::Redfish
    }

    fn supported_modes(&self) -> &'static [UpdateMode] {
        SUPPORTED_MODES
    }

    async fn detect_capability(&self, host: &Host, creds: &Credentials) -> ProtocolCapability {
        let root = match self.get_json(host, creds, SERVICE_ROOT).await {
            Ok(v) => v,
            Err(e) => {
                debug!(host_id = %host.id, error = %e, "redfish detection failed");
                return ProtocolCapability::unsupported(ManagementProtocol::Redfish);
            }
        };

        let mut update_modes = Vec::new();
        if let Ok(service) = self.get_json(host, creds, UPDATE_SERVICE).await {
            if !service["Actions"]["#UpdateService.SimpleUpdate"].is_null() {
                update_modes.push(UpdateMode::SimpleUpdate);
            }
            if service["MultipartHttpPushUri"].is_string() {
                update_modes.push(UpdateMode::MultipartUpdate);
            }
        }
        if !root["Oem"]["Dell"].is_null() {
            update_modes.push(UpdateMode::InstallFromRepository);
        }

        let (generation, firmware_version) = match self.get_json(host, creds, MANAGER).await {
            Ok(manager) => {
                let firmware = manager["FirmwareVersion"].as_str().map(str::to_string);
                let generation = manager["Model"]
                    .as_str()
                    .map(Generation::from_model_string)
                    .filter(|g| *g != Generation::Unknown);
                (generation, firmware)
            }
            Err(_) => (None, None),
        };

        ProtocolCapability {
            protocol: ManagementProtocol::Redfish,
            supported: true,
            generation,
            firmware_version,
            update_modes,
            raw: root,
        }
    }

    async fn health_check(&self, host: &Host, creds: &Credentials) -> ProtocolHealth {
        let started = Instant::now();
        let result = self.get_json(host, creds, SERVICE_ROOT).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => ProtocolHealth {
                protocol: ManagementProtocol::Redfish,
                status: HealthState::Healthy,
                latency_ms,
                details: None,
            },
            Err(e) => ProtocolHealth {
                protocol: ManagementProtocol::Redfish,
                status: if e.is_retryable() {
                    HealthState::Unreachable
                } else {
                    HealthState::Degraded
                },
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
        match request.mode {
            UpdateMode::SimpleUpdate => self.simple_update(request, creds).await,
            UpdateMode::MultipartUpdate => self.multipart_update(request, creds).await,
            UpdateMode::InstallFromRepository => {
                let url = request.repository_url.as_deref().ok_or_else(|| {
                    UpdateError::validation("INSTALL_FROM_REPOSITORY requires a repository URL")
                })?;
                self.install_from_repository(&request.host, creds, url).await
            }
        }
        .map_err(|e| e.with_host(&request.host.id).with_protocol(ManagementProtocol::Redfish))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetfw_domain::HostId;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn host() -> Host {
        Host {
            id: HostId::new("10.0.0.10"),
            management_endpoint: "10.0.0.10".into(),
            model: None,
            service_tag: None,
            generation: None,
            hypervisor_ref: None,
            host_ref: None,
        }
    }

    fn creds() -> Credentials {
        Credentials::new("root", "calvin")
    }

    async fn dell_service_root(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/redfish/v1/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "RedfishVersion": "1.18.0",
                "Oem": { "Dell": { "ServiceTag": "ABC1234" } }
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn detection_reads_actions_and_generation() {
        let server = MockServer::start().await;
        dell_service_root(&server).await;
        Mock::given(method("GET"))
            .and(path("/redfish/v1/UpdateService"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Actions": { "#UpdateService.SimpleUpdate": {
                    "target": "/redfish/v1/UpdateService/Actions/UpdateService.SimpleUpdate"
                }},
                "MultipartHttpPushUri": "/redfish/v1/UpdateService/upload"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/redfish/v1/Managers/iDRAC.Embedded.1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Model": "14G Monolithic",
                "FirmwareVersion": "5.10.50.00"
            })))
            .mount(&server)
            .await;

        let client = RedfishClient::with_base(&HttpSettings::default(), server.uri());
        let cap = client.detect_capability(&host(), &creds()).await;
        assert!(cap.supported);
        assert_eq!(cap.generation, Some(Generation::G14));
        assert_eq!(cap.firmware_version.as_deref(), Some("5.10.50.00"));
        assert!(cap.update_modes.contains(&UpdateMode::SimpleUpdate));
        assert!(cap.update_modes.contains(&UpdateMode::MultipartUpdate));
        assert!(cap.update_modes.contains(&UpdateMode::InstallFromRepository));
    }

    #[tokio::test]
    async fn unreachable_host_is_unsupported_not_error() {
        // Nothing listening on this port.
        let client = RedfishClient::with_base(&HttpSettings::default(), "https://127.0.0.1:1");
        let cap = client.detect_capability(&host(), &creds()).await;
        assert!(!cap.supported);
    }

    #[tokio::test]
    async fn simple_update_submits_and_returns_task_location() {
        let server = MockServer::start().await;
        dell_service_root(&server).await;
        Mock::given(method("GET"))
            .and(path("/redfish/v1/UpdateService"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Actions": { "#UpdateService.SimpleUpdate": {
                    "target": "/redfish/v1/UpdateService/Actions/UpdateService.SimpleUpdate"
                }}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/redfish/v1/UpdateService/Actions/UpdateService.SimpleUpdate"))
            .and(body_partial_json(serde_json::json!({
                "ImageURI": "https://fw.example/idrac-7.10.exe"
            })))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Location", "/redfish/v1/TaskService/Tasks/JID_123456789012"),
            )
            .mount(&server)
            .await;

        let client = RedfishClient::with_base(&HttpSettings::default(), server.uri());
        let request = FirmwareUpdateRequest {
            host: host(),
            mode: UpdateMode::SimpleUpdate,
            components: vec!["iDRAC".into()],
            image: Some(ImageSource::Url("https://fw.example/idrac-7.10.exe".into())),
            repository_url: None,
            install_upon: Default::default(),
            targets: vec![],
            additional_params: Default::default(),
        };
        let start = client.perform_update(&request, &creds()).await.unwrap();
        assert_eq!(start.status, UpdateStatus::Queued);
        assert_eq!(
            start.task_location.as_deref(),
            Some("/redfish/v1/TaskService/Tasks/JID_123456789012")
        );
        assert_eq!(start.job_id.as_deref(), Some("JID_123456789012"));
    }

    #[tokio::test]
    async fn missing_simple_update_action_is_action_missing() {
        let server = MockServer::start().await;
        dell_service_root(&server).await;
        Mock::given(method("GET"))
            .and(path("/redfish/v1/UpdateService"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Actions": {}
            })))
            .mount(&server)
            .await;

        let client = RedfishClient::with_base(&HttpSettings::default(), server.uri());
        let request = FirmwareUpdateRequest {
            host: host(),
            mode: UpdateMode::SimpleUpdate,
            components: vec![],
            image: Some(ImageSource::Url("https://fw.example/x.exe".into())),
            repository_url: None,
            install_upon: Default::default(),
            targets: vec![],
            additional_params: Default::default(),
        };
        let err = client.perform_update(&request, &creds()).await.unwrap_err();
        assert!(err.is_fallback_signal());
    }

    #[tokio::test]
    async fn repository_install_404_is_action_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = RedfishClient::with_base(&HttpSettings::default(), server.uri());
        let err = client
            .install_from_repository(&host(), &creds(), "https://downloads.dell.com/catalog")
            .await
            .unwrap_err();
        assert!(err.is_fallback_signal());
    }

    #[tokio::test]
    async fn auth_failure_is_permanent_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = RedfishClient::with_base(&HttpSettings::default(), server.uri());
        let err = client.get_json(&host(), &creds(), SERVICE_ROOT).await.unwrap_err();
        assert_eq!(err.kind, fleetfw_domain::ErrorKind::Auth);
        assert!(!err.is_retryable());
    }

    #[test]
    fn job_id_extraction() {
        assert_eq!(
            extract_job_id("/redfish/v1/TaskService/Tasks/JID_123456789012").as_deref(),
            Some("JID_123456789012")
        );
        assert_eq!(extract_job_id("/redfish/v1/TaskService/Tasks/42"), None);
    }
}
