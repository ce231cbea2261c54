use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{HostId, ManagementProtocol};

// ── Classification ────────────────────────────────────────────────────────────

/// Every failure in the system is transient, permanent, or critical.
/// Only transient failures are retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Transient,
    Permanent,
    Critical,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport reset, refused connection, DNS failure.
    Network,
    /// 401/403 or a SOAP auth fault.
    Auth,
    /// Malformed request, missing image URI, unknown update mode.
    Validation,
    /// A required Redfish action is absent; signals fallback, not a
    /// user-visible failure.
    ActionMissing,
    /// Any other protocol-reported failure.
    Protocol,
    /// Secret store, queue, or catalog host unreachable when required.
    Dependency,
    /// Cooperative cancellation observed.
    Cancelled,
    /// Task or HTTP deadline exceeded.
    Timeout,
}

impl ErrorKind {
    /// The default classification for this kind; builders may override
    /// (e.g. a task-level timeout is transient, a run-level one permanent).
    pub fn default_class(&self) -> ErrorClass {
        match self {
            ErrorKind::Network => ErrorClass::Transient,
            ErrorKind::Auth => ErrorClass::Permanent,
            ErrorKind::Validation => ErrorClass::Permanent,
            ErrorKind::ActionMissing => ErrorClass::Permanent,
            ErrorKind::Protocol => ErrorClass::Permanent,
            ErrorKind::Dependency => ErrorClass::Critical,
            ErrorKind::Cancelled => ErrorClass::Permanent,
            ErrorKind::Timeout => ErrorClass::Transient,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Auth => "auth",
            ErrorKind::Validation => "validation",
            ErrorKind::ActionMissing => "action_missing",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

// ── UpdateError ───────────────────────────────────────────────────────────────

/// The classified error carried across protocol clients, the manager, the
/// poller and the state machine. Serializable so terminal runs persist it
/// into their ctx.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind} ({class}): {message}")]
pub struct UpdateError {
    pub kind: ErrorKind,
    pub class: ErrorClass,
    pub message: String,
    pub host: Option<HostId>,
    pub protocol: Option<ManagementProtocol>,
    pub component: Option<String>,
    pub attempt: Option<u32>,
}

impl UpdateError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        UpdateError {
            kind,
            class: kind.default_class(),
            message: message.into(),
            host: None,
            protocol: None,
            component: None,
            attempt: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn action_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ActionMissing, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dependency, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by operator")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Classify an HTTP response status. 408/425/429 and 5xx are transient;
    /// 401/403 is an auth failure; every other 4xx is permanent.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::auth(message),
            408 | 425 | 429 => Self::new(ErrorKind::Network, message),
            500..=599 => Self::new(ErrorKind::Network, message).with_class(ErrorClass::Transient),
            400..=499 => Self::protocol(message),
            _ => Self::protocol(message),
        }
    }

    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_host(mut self, host: &HostId) -> Self {
        self.host = Some(host.clone());
        self
    }

    pub fn with_protocol(mut self, protocol: ManagementProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Transient
    }

    /// A fallback signal rather than a user-visible failure: the manager
    /// moves to the next candidate without spending the retry budget.
    pub fn is_fallback_signal(&self) -> bool {
        self.kind == ErrorKind::ActionMissing
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classes() {
        assert_eq!(UpdateError::from_http_status(503, "x").class, ErrorClass::Transient);
        assert_eq!(UpdateError::from_http_status(429, "x").class, ErrorClass::Transient);
        assert_eq!(UpdateError::from_http_status(408, "x").class, ErrorClass::Transient);
        assert_eq!(UpdateError::from_http_status(404, "x").class, ErrorClass::Permanent);
        assert_eq!(UpdateError::from_http_status(401, "x").kind, ErrorKind::Auth);
        assert_eq!(UpdateError::from_http_status(403, "x").kind, ErrorKind::Auth);
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(UpdateError::network("reset").is_retryable());
        assert!(!UpdateError::auth("denied").is_retryable());
        assert!(!UpdateError::dependency("vault down").is_retryable());
        assert!(!UpdateError::cancelled().is_retryable());
    }

    #[test]
    fn action_missing_signals_fallback() {
        let e = UpdateError::action_missing("no SimpleUpdate");
        assert!(e.is_fallback_signal());
        assert!(!e.is_retryable());
    }

    #[test]
    fn context_builders_attach() {
        let e = UpdateError::protocol("boom")
            .with_host(&HostId::new("h1"))
            .with_protocol(ManagementProtocol::Redfish)
            .with_component("BIOS")
            .with_attempt(2);
        assert_eq!(e.host.as_ref().unwrap().as_str(), "h1");
        assert_eq!(e.protocol, Some(ManagementProtocol::Redfish));
        assert_eq!(e.component.as_deref(), Some("BIOS"));
        assert_eq!(e.attempt, Some(2));
    }
}
