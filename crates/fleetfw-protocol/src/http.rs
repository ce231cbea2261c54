use std::path::PathBuf;
use std::time::Duration;

use fleetfw_domain::UpdateError;

/// TLS and timeout policy for every management-endpoint HTTP client.
/// Injected at startup; no hidden global dispatcher.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Verify server certificates. iDRACs commonly ship self-signed certs,
    /// so operators may turn this off or provide a CA bundle instead.
    pub reject_unauthorized: bool,
    /// Extra root certificates (PEM bundle) trusted for management endpoints.
    pub ca_bundle_path: Option<PathBuf>,
    /// Per-call HTTP timeout.
    pub timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            reject_unauthorized: true,
            ca_bundle_path: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl HttpSettings {
    /// Build a reqwest client honoring this policy.
    pub fn build_client(&self) -> Result<reqwest::Client, UpdateError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(!self.reject_unauthorized);

        if let Some(path) = &self.ca_bundle_path {
            let pem = std::fs::read(path).map_err(|e| {
                UpdateError::dependency(format!("cannot read CA bundle {}: {}", path.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                UpdateError::dependency(format!("invalid CA bundle {}: {}", path.display(), e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        builder
            .build()
            .map_err(|e| UpdateError::dependency(format!("http client build failed: {}", e)))
    }
}

/// Normalize a management endpoint to `https://<host>`.
///
/// Bare `host` and `host:port` forms are accepted; an explicit scheme must
/// be https. Anything else is a validation error.
pub fn normalize_base_url(endpoint: &str) -> Result<String, UpdateError> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        return Err(UpdateError::validation("management endpoint is empty"));
    }
    if let Some((scheme, rest)) = endpoint.split_once("://") {
        if scheme != "https" {
            return Err(UpdateError::validation(format!(
                "unsupported scheme '{}' for management endpoint (only https)",
                scheme
            )));
        }
        if rest.is_empty() {
            return Err(UpdateError::validation("management endpoint has no host"));
        }
        return Ok(format!("https://{}", rest));
    }
    Ok(format!("https://{}", endpoint))
}

/// Host portion of a management endpoint, without scheme or port. Used by
/// subprocess transports (racadm, ipmitool) that take a bare address.
pub fn endpoint_host(endpoint: &str) -> String {
    let stripped = endpoint
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let stripped = stripped.split('/').next().unwrap_or(stripped);
    // Don't split IPv6 literals on ':'
    if stripped.starts_with('[') {
        return stripped.to_string();
    }
    match stripped.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => stripped.to_string(),
    }
}

/// Map a reqwest transport error onto the taxonomy: timeouts are `Timeout`,
/// connection-level failures are `Network`, everything else `Protocol`.
pub fn classify_transport(e: reqwest::Error) -> UpdateError {
    if e.is_timeout() {
        UpdateError::timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        UpdateError::network(e.to_string())
    } else {
        UpdateError::protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_normalization() {
        assert_eq!(normalize_base_url("10.0.0.10").unwrap(), "https://10.0.0.10");
        assert_eq!(
            normalize_base_url("idrac-r740.example:8443").unwrap(),
            "https://idrac-r740.example:8443"
        );
        assert_eq!(
            normalize_base_url("https://10.0.0.10/").unwrap(),
            "https://10.0.0.10"
        );
        assert!(normalize_base_url("http://10.0.0.10").is_err());
        assert!(normalize_base_url("ftp://10.0.0.10").is_err());
        assert!(normalize_base_url("").is_err());
    }

    #[test]
    fn endpoint_host_strips_scheme_and_port() {
        assert_eq!(endpoint_host("https://10.0.0.10:8443"), "10.0.0.10");
        assert_eq!(endpoint_host("10.0.0.10"), "10.0.0.10");
        assert_eq!(endpoint_host("idrac.example:443"), "idrac.example");
        assert_eq!(endpoint_host("[fe80::1]"), "[fe80::1]");
    }
}
