use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetfw_domain::{
    Credentials, ErrorKind, FirmwareUpdateRequest, Host, HostId, ManagementProtocol,
    ProtocolCapability, ProtocolHealth, UpdateError, UpdateStart,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ProtocolClient;

// ── Retry policy ──────────────────────────────────────────────────────────────

/// Exponential backoff with jitter for transient failures. The same curve
/// is used by the manager (per-client retries) and the scheduler
/// (queue-level retries); the budgets multiply, so both are explicit.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Fractional jitter, e.g. 0.2 for ±20 %.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(retry.saturating_sub(1) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        Duration::from_secs_f64((capped * (1.0 + spread)).max(0.0))
    }
}

// ── Detection ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub protocol: ManagementProtocol,
    pub priority: u8,
    pub latency_ms: u64,
}

/// Ranked detection result for one host. Cached for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub healthiest: ManagementProtocol,
    /// Supported protocols, best first: priority descending, then latency.
    pub candidates: Vec<Candidate>,
    pub capabilities: HashMap<ManagementProtocol, ProtocolCapability>,
}

/// What `run_update` reports on success.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub start: UpdateStart,
    pub protocol: ManagementProtocol,
    /// Submission attempts across all candidates, including the success.
    pub attempts: u32,
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// Owns the protocol clients for a fleet; probes hosts, ranks transports
/// and drives updates with typed fallback.
pub struct ProtocolManager {
    clients: Vec<Arc<dyn ProtocolClient>>,
    cache: RwLock<HashMap<HostId, Detection>>,
    retry: RetryPolicy,
    detect_timeout: Duration,
}

impl ProtocolManager {
    pub fn new(
        clients: Vec<Arc<dyn ProtocolClient>>,
        retry: RetryPolicy,
        detect_timeout: Duration,
    ) -> Self {
        ProtocolManager {
            clients,
            cache: RwLock::new(HashMap::new()),
            retry,
            detect_timeout,
        }
    }

    fn client_for(&self, protocol: ManagementProtocol) -> Option<Arc<dyn ProtocolClient>> {
        self.clients.iter().find(|c| c.protocol() == protocol).cloned()
    }

    /// Drop the cached detection for a host (called at the start of a run).
    pub async fn invalidate(&self, host: &HostId) {
        self.cache.write().await.remove(host);
    }

    /// Probe every client in parallel under a per-client timeout, rank the
    /// supported ones, and cache the outcome. Empty candidate set is a
    /// permanent error: the host has no usable management protocol.
    pub async fn detect(
        &self,
        host: &Host,
        creds: &Credentials,
    ) -> Result<Detection, UpdateError> {
        if let Some(cached) = self.cache.read().await.get(&host.id) {
            return Ok(cached.clone());
        }

        let mut set = JoinSet::new();
        for client in &self.clients {
            let client = client.clone();
            let host = host.clone();
            let creds = creds.clone();
            let timeout = self.detect_timeout;
            set.spawn(async move {
                let protocol = client.protocol();
                let started = Instant::now();
                let capability =
                    match tokio::time::timeout(timeout, client.detect_capability(&host, &creds))
                        .await
                    {
                        Ok(cap) => cap,
                        Err(_) => ProtocolCapability::unsupported(protocol),
                    };
                (protocol, capability, started.elapsed().as_millis() as u64)
            });
        }

        let mut capabilities = HashMap::new();
        let mut candidates = Vec::new();
        while let Some(joined) = set.join_next().await {
            let Ok((protocol, capability, latency_ms)) = joined else {
                continue;
            };
            if capability.supported {
                candidates.push(Candidate {
                    protocol,
                    priority: protocol.priority(),
                    latency_ms,
                });
            }
            capabilities.insert(protocol, capability);
        }

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.latency_ms.cmp(&b.latency_ms))
        });

        let Some(best) = candidates.first() else {
            return Err(UpdateError::protocol(format!(
                "no management protocol supports host {}",
                host.id
            ))
            .with_host(&host.id));
        };

        let detection = Detection {
            healthiest: best.protocol,
            candidates,
            capabilities,
        };
        info!(
            host_id = %host.id,
            healthiest = %detection.healthiest,
            candidates = detection.candidates.len(),
            "protocol detection complete"
        );
        self.cache.write().await.insert(host.id.clone(), detection.clone());
        Ok(detection)
    }

    /// All candidates' health, for observability endpoints.
    pub async fn health_check(&self, host: &Host, creds: &Credentials) -> Vec<ProtocolHealth> {
        let mut set = JoinSet::new();
        for client in &self.clients {
            let client = client.clone();
            let host = host.clone();
            let creds = creds.clone();
            set.spawn(async move { client.health_check(&host, &creds).await });
        }
        let mut health = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(h) = joined {
                health.push(h);
            }
        }
        health.sort_by(|a, b| b.protocol.priority().cmp(&a.protocol.priority()));
        health
    }

    /// Attempt the update across ranked candidates.
    ///
    /// Per candidate: transient failures retry on the same client with
    /// backoff; `ActionMissing` moves to the next candidate without
    /// consuming the retry budget; any other permanent (or critical)
    /// failure aborts the whole attempt, since wrong credentials are
    /// equally wrong on every transport.
    pub async fn run_update(
        &self,
        request: &FirmwareUpdateRequest,
        creds: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, UpdateError> {
        let detection = self.detect(&request.host, creds).await?;
        let mut attempts: u32 = 0;
        let mut last_error: Option<UpdateError> = None;

        for candidate in &detection.candidates {
            let mode_supported = detection
                .capabilities
                .get(&candidate.protocol)
                .map_or(false, |cap| cap.update_modes.contains(&request.mode));
            if !mode_supported {
                debug!(
                    host_id = %request.host.id,
                    protocol = %candidate.protocol,
                    mode = %request.mode,
                    "candidate skipped: mode unsupported"
                );
                continue;
            }
            let Some(client) = self.client_for(candidate.protocol) else {
                continue;
            };

            let mut retries: u32 = 0;
            loop {
                if cancel.is_cancelled() {
                    return Err(UpdateError::cancelled().with_host(&request.host.id));
                }
                attempts += 1;
                match client.perform_update(request, creds).await {
                    Ok(start) => {
                        return Ok(UpdateOutcome {
                            start,
                            protocol: candidate.protocol,
                            attempts,
                        });
                    }
                    Err(e) if e.is_fallback_signal() => {
                        // Not a failure from the operator's point of view;
                        // the next transport gets its turn.
                        info!(
                            host_id = %request.host.id,
                            protocol = %candidate.protocol,
                            error = %e,
                            "action missing, falling back to next candidate"
                        );
                        last_error = Some(e);
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        retries += 1;
                        if retries > self.retry.max_attempts {
                            warn!(
                                host_id = %request.host.id,
                                protocol = %candidate.protocol,
                                attempts,
                                "transient retry budget exhausted, moving on"
                            );
                            last_error = Some(e.with_attempt(attempts));
                            break;
                        }
                        let delay = self.retry.delay(retries);
                        debug!(
                            host_id = %request.host.id,
                            protocol = %candidate.protocol,
                            retry = retries,
                            delay_ms = delay.as_millis() as u64,
                            "transient failure, backing off"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(UpdateError::cancelled().with_host(&request.host.id));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => {
                        // Permanent or critical: no other candidate can fix
                        // an auth or validation problem.
                        return Err(e.with_attempt(attempts));
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| {
                UpdateError::new(
                    ErrorKind::Protocol,
                    format!(
                        "no candidate protocol supports update mode {}",
                        request.mode
                    ),
                )
            })
            .with_host(&request.host.id))
    }
}
