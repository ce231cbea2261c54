use std::time::Duration;

use fleetfw_domain::{Credentials, UpdateError};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::http::{classify_transport, HttpSettings};

const SESSION_HEADER: &str = "vmware-api-session-id";
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MaintenanceOptions {
    /// Also evacuate powered-off VMs before entering maintenance.
    pub evacuate_powered_off: bool,
    pub timeout_minutes: u64,
}

impl Default for MaintenanceOptions {
    fn default() -> Self {
        MaintenanceOptions {
            evacuate_powered_off: true,
            timeout_minutes: 30,
        }
    }
}

/// vSphere-style REST client: cookie-session login, host maintenance
/// enter/exit returning task ids, and a task wait loop. VM placement is the
/// hypervisor's problem (DRS); this client only asks and waits.
pub struct HypervisorClient {
    http: reqwest::Client,
    base: String,
    session: RwLock<Option<String>>,
}

impl HypervisorClient {
    pub fn new(settings: &HttpSettings, endpoint: &str) -> Result<Self, UpdateError> {
        let base = endpoint.trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(UpdateError::validation("hypervisor endpoint is empty"));
        }
        Ok(HypervisorClient {
            http: settings.build_client()?,
            base,
            session: RwLock::new(None),
        })
    }

    async fn session_id(&self) -> Result<String, UpdateError> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| UpdateError::dependency("hypervisor session not established"))
    }

    /// Create an API session. The returned token authenticates every
    /// subsequent call.
    pub async fn login(&self, creds: &Credentials) -> Result<(), UpdateError> {
        let url = format!("{}/api/session", self.base);
        let resp = self
            .http
            .post(&url)
            .basic_auth(&creds.username, Some(creds.password.expose()))
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(UpdateError::auth("hypervisor rejected credentials"));
        }
        if !status.is_success() {
            return Err(UpdateError::from_http_status(
                status.as_u16(),
                format!("hypervisor login returned {}", status),
            ));
        }
        let token: String = resp
            .json()
            .await
            .map_err(|e| UpdateError::protocol(format!("malformed session response: {}", e)))?;
        info!(endpoint = %self.base, "hypervisor session established");
        *self.session.write().await = Some(token);
        Ok(())
    }

    pub async fn logout(&self) {
        if let Some(token) = self.session.write().await.take() {
            let url = format!("{}/api/session", self.base);
            let _ = self
                .http
                .delete(&url)
                .header(SESSION_HEADER, token)
                .send()
                .await;
        }
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, UpdateError> {
        let token = self.session_id().await?;
        let url = format!("{}{}", self.base, path);
        let mut builder = self.http.request(method, &url).header(SESSION_HEADER, token);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let resp = builder.send().await.map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpdateError::from_http_status(
                status.as_u16(),
                format!("{} returned {}", path, status),
            ));
        }
        let bytes = resp.bytes().await.map_err(classify_transport)?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| UpdateError::protocol(format!("{} returned malformed JSON: {}", path, e)))
    }

    /// Ask the hypervisor to put a host into maintenance mode. Returns the
    /// task id to wait on.
    pub async fn enter_maintenance(
        &self,
        host_ref: &str,
        options: &MaintenanceOptions,
    ) -> Result<String, UpdateError> {
        debug!(%host_ref, "requesting maintenance entry");
        let body = json!({
            "evacuate_powered_off": options.evacuate_powered_off,
            "timeout_minutes": options.timeout_minutes,
        });
        let resp = self
            .call(
                reqwest::Method::POST,
                &format!("/api/host/{}/maintenance?action=enter", host_ref),
                Some(body),
            )
            .await?;
        task_id_from(&resp)
    }

    pub async fn exit_maintenance(&self, host_ref: &str) -> Result<String, UpdateError> {
        debug!(%host_ref, "requesting maintenance exit");
        let resp = self
            .call(
                reqwest::Method::POST,
                &format!("/api/host/{}/maintenance?action=exit", host_ref),
                None,
            )
            .await?;
        task_id_from(&resp)
    }

    /// Current connection state of a host (`CONNECTED`, `DISCONNECTED`,
    /// `NOT_RESPONDING`). Used by postchecks after an update reboot.
    pub async fn connection_state(&self, host_ref: &str) -> Result<String, UpdateError> {
        let resp = self
            .call(reqwest::Method::GET, &format!("/api/host/{}", host_ref), None)
            .await?;
        resp["connection_state"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| UpdateError::protocol("host record has no connection_state"))
    }

    /// Wait for a hypervisor task to succeed, polling on a fixed interval
    /// under a hard deadline.
    pub async fn wait_for_task(
        &self,
        task_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(UpdateError::cancelled());
            }
            let task = self
                .call(reqwest::Method::GET, &format!("/api/task/{}", task_id), None)
                .await?;
            match task["state"].as_str().unwrap_or("RUNNING") {
                "SUCCEEDED" => return Ok(()),
                "FAILED" => {
                    let message = task["error"]
                        .as_str()
                        .unwrap_or("hypervisor task failed")
                        .to_string();
                    return Err(UpdateError::protocol(message));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(UpdateError::timeout(format!(
                    "hypervisor task {} did not finish within {:?}",
                    task_id, timeout
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(UpdateError::cancelled()),
                _ = tokio::time::sleep(TASK_POLL_INTERVAL.min(deadline - Instant::now())) => {}
            }
        }
    }
}

fn task_id_from(resp: &Value) -> Result<String, UpdateError> {
    resp["task"]
        .as_str()
        .or_else(|| resp.as_str())
        .map(str::to_string)
        .ok_or_else(|| UpdateError::protocol("maintenance call returned no task id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn logged_in(server: &MockServer) -> HypervisorClient {
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!("sess-abc")))
            .mount(server)
            .await;
        let client = HypervisorClient::new(&HttpSettings::default(), &server.uri()).unwrap();
        client.login(&Credentials::new("automation", "pw")).await.unwrap();
        client
    }

    #[tokio::test]
    async fn login_then_enter_maintenance_returns_task() {
        let server = MockServer::start().await;
        let client = logged_in(&server).await;

        Mock::given(method("POST"))
            .and(path("/api/host/host-1002/maintenance"))
            .and(query_param("action", "enter"))
            .and(header_exists("vmware-api-session-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "task": "task-77" })))
            .mount(&server)
            .await;

        let task = client
            .enter_maintenance("host-1002", &MaintenanceOptions::default())
            .await
            .unwrap();
        assert_eq!(task, "task-77");
    }

    #[tokio::test]
    async fn bad_credentials_are_auth_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = HypervisorClient::new(&HttpSettings::default(), &server.uri()).unwrap();
        let err = client.login(&Credentials::new("automation", "bad")).await.unwrap_err();
        assert_eq!(err.kind, fleetfw_domain::ErrorKind::Auth);
    }

    #[tokio::test]
    async fn wait_for_task_sees_success() {
        let server = MockServer::start().await;
        let client = logged_in(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/task/task-77"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "state": "SUCCEEDED" })))
            .mount(&server)
            .await;

        client
            .wait_for_task("task-77", Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_task_carries_error_message() {
        let server = MockServer::start().await;
        let client = logged_in(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/task/task-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": "FAILED",
                "error": "DRS cannot evacuate VM web-01"
            })))
            .mount(&server)
            .await;

        let err = client
            .wait_for_task("task-9", Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.message.contains("web-01"));
    }

    #[tokio::test]
    async fn calls_without_login_are_dependency_errors() {
        let server = MockServer::start().await;
        let client = HypervisorClient::new(&HttpSettings::default(), &server.uri()).unwrap();
        let err = client.connection_state("host-1").await.unwrap_err();
        assert_eq!(err.kind, fleetfw_domain::ErrorKind::Dependency);
    }
}
