use chrono::{DateTime, Utc};
use fleetfw_domain::{ErrorClass, HostId, ManagementProtocol, PlanId, RunState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Queue jobs ────────────────────────────────────────────────────────────────

/// One unit of work: drive a single host-run to a terminal state.
///
/// Leased to exactly one worker at a time; a job whose lease expires is
/// reclaimed and redelivered (the state machine is idempotent under
/// redelivery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    /// The idempotency key, `plan:<planId>:host:<hostId>`.
    pub job_key: String,
    pub run_id: Uuid,
    pub plan_id: PlanId,
    pub host_id: HostId,
    /// Deliveries so far (0 for a job never picked up).
    pub attempt: u32,
    /// Earliest time this job may be popped (backoff between retries).
    pub not_before: DateTime<Utc>,
    pub leased_by: Option<String>,
    pub leased_until: Option<DateTime<Utc>>,
}

impl QueueJob {
    pub fn new(job_key: String, run_id: Uuid, plan_id: PlanId, host_id: HostId) -> Self {
        QueueJob {
            job_key,
            run_id,
            plan_id,
            host_id,
            attempt: 0,
            not_before: Utc::now(),
            leased_by: None,
            leased_until: None,
        }
    }

    /// Due when its backoff has elapsed and nobody holds a live lease.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && self.leased_until.map_or(true, |until| until <= now)
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new host-run record and queue job were created.
    Created(Uuid),
    /// The (plan, host) pair was already enqueued; this is its run id.
    Existing(Uuid),
}

impl EnqueueOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Existing(id) => *id,
        }
    }
}

// ── Audit events ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AuditEvent {
    PlanStarted {
        id: Uuid,
        at: DateTime<Utc>,
        plan_id: PlanId,
        targets: usize,
    },
    RunEnqueued {
        id: Uuid,
        at: DateTime<Utc>,
        run_id: Uuid,
        plan_id: PlanId,
        host_id: HostId,
    },
    StateChanged {
        id: Uuid,
        at: DateTime<Utc>,
        run_id: Uuid,
        from: RunState,
        to: RunState,
    },
    FallbackTaken {
        id: Uuid,
        at: DateTime<Utc>,
        run_id: Uuid,
        from_protocol: ManagementProtocol,
        to_protocol: ManagementProtocol,
    },
    RunRetried {
        id: Uuid,
        at: DateTime<Utc>,
        run_id: Uuid,
        attempt: u32,
        class: ErrorClass,
    },
    RunCancelled {
        id: Uuid,
        at: DateTime<Utc>,
        run_id: Uuid,
    },
}

impl AuditEvent {
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            AuditEvent::RunEnqueued { run_id, .. } => Some(*run_id),
            AuditEvent::StateChanged { run_id, .. } => Some(*run_id),
            AuditEvent::FallbackTaken { run_id, .. } => Some(*run_id),
            AuditEvent::RunRetried { run_id, .. } => Some(*run_id),
            AuditEvent::RunCancelled { run_id, .. } => Some(*run_id),
            AuditEvent::PlanStarted { .. } => None,
        }
    }
}
