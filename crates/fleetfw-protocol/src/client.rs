use async_trait::async_trait;
use fleetfw_domain::{
    Credentials, FirmwareUpdateRequest, Host, ManagementProtocol, ProtocolCapability,
    ProtocolHealth, UpdateError, UpdateMode, UpdateStart,
};

/// Capability-uniform contract every management protocol client implements.
///
/// Detection never fails: an unreachable or unsupported host yields
/// `ProtocolCapability { supported: false, .. }`. Updates return typed
/// errors; `ActionMissing` in particular is a fallback signal consumed by
/// the protocol manager, not a user-visible failure.
#[async_trait]
pub trait ProtocolClient: Send + Sync + 'static {
    fn protocol(&self) -> ManagementProtocol;

    /// Update mechanisms this client can execute. Empty for
    /// detection/power-only transports (IPMI, SSH).
    fn supported_modes(&self) -> &'static [UpdateMode];

    /// Probe the host. Cheap enough to run in parallel across all clients.
    async fn detect_capability(&self, host: &Host, creds: &Credentials) -> ProtocolCapability;

    async fn health_check(&self, host: &Host, creds: &Credentials) -> ProtocolHealth;

    /// Submit a firmware update. The manager guarantees `request.mode` is in
    /// [`supported_modes`](Self::supported_modes) before calling.
    async fn perform_update(
        &self,
        request: &FirmwareUpdateRequest,
        creds: &Credentials,
    ) -> Result<UpdateStart, UpdateError>;
}
