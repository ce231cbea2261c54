use std::time::Instant;

use async_trait::async_trait;
use fleetfw_domain::{
    Credentials, FirmwareUpdateRequest, Generation, HealthState, Host, ImageSource,
    ManagementProtocol, ProtocolCapability, ProtocolHealth, UpdateError, UpdateMode, UpdateStart,
    UpdateStatus,
};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::json;
use tracing::debug;

use crate::client::ProtocolClient;
use crate::http::{classify_transport, normalize_base_url, HttpSettings};

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";
const DCIM_SIS: &str =
    "http://schemas.dell.com/wbem/wscim/1/cim-schema/2/DCIM_SoftwareInstallationService";

const SUPPORTED_MODES: &[UpdateMode] =
    &[UpdateMode::SimpleUpdate, UpdateMode::InstallFromRepository];

/// WS-Management client speaking SOAP to `/wsman` on the iDRAC, using the
/// Dell CIM schema (`DCIM_SoftwareInstallationService`).
pub struct WsmanClient {
    http: reqwest::Client,
    base_override: Option<String>,
}

impl WsmanClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, UpdateError> {
        Ok(WsmanClient {
            http: settings.build_client()?,
            base_override: None,
        })
    }

    /// Pin every request to a fixed base URL. For tests and mock BMCs.
    pub fn with_base(settings: &HttpSettings, base: impl Into<String>) -> Self {
        WsmanClient {
            http: settings.build_client().expect("client build"),
            base_override: Some(base.into()),
        }
    }

    fn wsman_url(&self, host: &Host) -> Result<String, UpdateError> {
        let base = match &self.base_override {
            Some(base) => base.clone(),
            None => normalize_base_url(&host.management_endpoint)?,
        };
        Ok(format!("{}/wsman", base))
    }

    async fn soap_call(
        &self,
        host: &Host,
        creds: &Credentials,
        envelope: String,
    ) -> Result<String, UpdateError> {
        let url = self.wsman_url(host)?;
        let resp = self
            .http
            .post(&url)
            .basic_auth(&creds.username, Some(creds.password.expose()))
            .header(reqwest::header::CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(envelope)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(UpdateError::auth(format!("wsman returned {}", status)));
        }
        if !status.is_success() && status.as_u16() != 500 {
            // SOAP faults ride on 500; handled below from the body.
            return Err(UpdateError::from_http_status(
                status.as_u16(),
                format!("wsman returned {}", status),
            ));
        }
        if let Some(fault) = find_text(&body, "Text").or_else(|| find_text(&body, "faultstring")) {
            if body.contains("Fault") {
                return Err(UpdateError::protocol(format!("SOAP fault: {}", fault)));
            }
        }
        Ok(body)
    }

    fn identify_envelope() -> String {
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:wsmid="http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd"><s:Header/><s:Body><wsmid:Identify/></s:Body></s:Envelope>"#
            .to_string()
    }

    fn invoke_envelope(endpoint: &str, method: &str, inputs: &[(&str, &str)]) -> String {
        let body_inputs: String = inputs
            .iter()
            .map(|(k, v)| format!("<p:{k}>{v}</p:{k}>", k = k, v = xml_escape(v)))
            .collect();
        format!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:wsman="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:p="{schema}">
<s:Header>
<wsa:To>{endpoint}</wsa:To>
<wsman:ResourceURI>{schema}</wsman:ResourceURI>
<wsa:ReplyTo><wsa:Address>http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</wsa:Address></wsa:ReplyTo>
<wsa:Action>{schema}/{method}</wsa:Action>
<wsman:SelectorSet>
<wsman:Selector Name="SystemCreationClassName">DCIM_ComputerSystem</wsman:Selector>
<wsman:Selector Name="SystemName">IDRAC:ID</wsman:Selector>
<wsman:Selector Name="CreationClassName">DCIM_SoftwareInstallationService</wsman:Selector>
<wsman:Selector Name="Name">SoftwareUpdate</wsman:Selector>
</wsman:SelectorSet>
</s:Header>
<s:Body><p:{method}_INPUT>{inputs}</p:{method}_INPUT></s:Body>
</s:Envelope>"#,
            schema = DCIM_SIS,
            endpoint = endpoint,
            method = method,
            inputs = body_inputs,
        )
    }

    /// Interpret an invoke response. ReturnValue 4096 means a job was
    /// created; 0 means completed synchronously; anything else failed.
    fn interpret_invoke(body: &str) -> Result<UpdateStart, UpdateError> {
        let return_value = find_text(body, "ReturnValue");
        match return_value.as_deref() {
            Some("4096") | Some("0") => {
                let job_id = find_selector_value(body, "InstanceID");
                Ok(UpdateStart {
                    status: UpdateStatus::Queued,
                    job_id,
                    task_location: None,
                    messages: find_text(body, "Message").into_iter().collect(),
                })
            }
            Some(other) => {
                let message = find_text(body, "Message")
                    .unwrap_or_else(|| format!("ReturnValue {}", other));
                Err(UpdateError::protocol(format!("wsman invoke failed: {}", message)))
            }
            None => Err(UpdateError::protocol("wsman response carried no ReturnValue")),
        }
    }
}

/// Text content of the first element with this local name, ignoring
/// namespace prefixes.
fn find_text(xml: &str, local: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut capture = false;
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) => {
                capture = e.name().local_name().as_ref() == local.as_bytes();
            }
            Event::Text(t) if capture => {
                return t.unescape().ok().map(|s| s.into_owned());
            }
            Event::End(_) => capture = false,
            Event::Eof => return None,
            _ => {}
        }
    }
}

/// Value of a `<Selector Name="...">` element, used to pull the job
/// instance id out of an invoke response.
fn find_selector_value(xml: &str, selector_name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut capture = false;
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) => {
                capture = e.name().local_name().as_ref() == b"Selector"
                    && e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"Name"
                            && a.value.as_ref() == selector_name.as_bytes()
                    });
            }
            Event::Text(t) if capture => {
                return t.unescape().ok().map(|s| s.into_owned());
            }
            Event::End(_) => capture = false,
            Event::Eof => return None,
            _ => {}
        }
    }
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
impl ProtocolClient for WsmanClient {
    fn protocol(&self) -> ManagementProtocol {
        ManagementProtocol::Wsman
    }

    fn supported_modes(&self) -> &'static [UpdateMode] {
        SUPPORTED_MODES
    }

    async fn detect_capability(&self, host: &Host, creds: &Credentials) -> ProtocolCapability {
        let body = match self.soap_call(host, creds, Self::identify_envelope()).await {
            Ok(b) => b,
            Err(e) => {
                debug!(host_id = %host.id, error = %e, "wsman detection failed");
                return ProtocolCapability::unsupported(ManagementProtocol::Wsman);
            }
        };

        if !body.contains("IdentifyResponse") {
            return ProtocolCapability::unsupported(ManagementProtocol::Wsman);
        }

        let product = find_text(&body, "ProductName").unwrap_or_default();
        let firmware_version = find_text(&body, "ProductVersion");
        let generation = Some(Generation::from_model_string(&product))
            .filter(|g| *g != Generation::Unknown);

        ProtocolCapability {
            protocol: ManagementProtocol::Wsman,
            supported: true,
            generation,
            firmware_version,
            update_modes: SUPPORTED_MODES.to_vec(),
            raw: json!({ "product": product }),
        }
    }

    async fn health_check(&self, host: &Host, creds: &Credentials) -> ProtocolHealth {
        let started = Instant::now();
        let result = self.soap_call(host, creds, Self::identify_envelope()).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => ProtocolHealth {
                protocol: ManagementProtocol::Wsman,
                status: HealthState::Healthy,
                latency_ms,
                details: None,
            },
            Err(e) => ProtocolHealth {
                protocol: ManagementProtocol::Wsman,
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
        let endpoint = self.wsman_url(&request.host)?;
        let result = match request.mode {
            UpdateMode::SimpleUpdate => {
                let uri = match &request.image {
                    Some(ImageSource::Url(uri)) => uri.clone(),
                    _ => {
                        return Err(UpdateError::validation(
                            "wsman InstallFromURI requires an http(s) image URI",
                        )
                        .with_host(&request.host.id))
                    }
                };
                let envelope =
                    Self::invoke_envelope(&endpoint, "InstallFromURI", &[("URI", uri.as_str())]);
                let body = self.soap_call(&request.host, creds, envelope).await?;
                Self::interpret_invoke(&body)
            }
            UpdateMode::InstallFromRepository => {
                let url = request.repository_url.as_deref().ok_or_else(|| {
                    UpdateError::validation("INSTALL_FROM_REPOSITORY requires a repository URL")
                })?;
                let envelope = Self::invoke_envelope(
                    &endpoint,
                    "InstallFromRepository",
                    &[("URI", url), ("ApplyUpdate", "1"), ("RebootNeeded", "TRUE")],
                );
                let body = self.soap_call(&request.host, creds, envelope).await?;
                Self::interpret_invoke(&body)
            }
            UpdateMode::MultipartUpdate => Err(UpdateError::validation(
                "wsman does not support multipart updates",
            )),
        };
        result.map_err(|e| {
            e.with_host(&request.host.id)
                .with_protocol(ManagementProtocol::Wsman)
        })
    }
}
