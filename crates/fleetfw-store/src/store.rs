use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleetfw_domain::{Host, HostId, HostRun, Plan, PlanId, RunCtx, RunState};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{AuditEvent, EnqueueOutcome, QueueJob};

/// Durable store for plans, hosts, host-runs and the named work queue.
///
/// Run records are only ever mutated through [`transition_run`], which
/// persists state and ctx together and rejects backward transitions, so
/// observers never see a run move backwards along the state graph.
///
/// [`transition_run`]: RunStore::transition_run
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    // ── Plans ────────────────────────────────────────────────────────────────
    async fn put_plan(&self, plan: &Plan) -> Result<(), StoreError>;
    async fn get_plan(&self, id: &PlanId) -> Result<Option<Plan>, StoreError>;
    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError>;

    // ── Hosts ────────────────────────────────────────────────────────────────
    async fn put_host(&self, host: &Host) -> Result<(), StoreError>;
    async fn get_host(&self, id: &HostId) -> Result<Option<Host>, StoreError>;
    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError>;

    // ── Host-runs ────────────────────────────────────────────────────────────
    async fn get_run(&self, id: Uuid) -> Result<Option<HostRun>, StoreError>;
    async fn list_runs(&self, plan_id: Option<&PlanId>) -> Result<Vec<HostRun>, StoreError>;

    /// Atomically persist a state transition together with its ctx patch.
    /// `next` may equal the current state (ctx refresh mid-state); any other
    /// edge must be legal per [`RunState::can_transition_to`].
    async fn transition_run(
        &self,
        id: Uuid,
        next: RunState,
        ctx: &RunCtx,
    ) -> Result<(), StoreError>;

    // ── Queue ────────────────────────────────────────────────────────────────

    /// Create the run record and its queue job. Idempotent: a second call
    /// for the same `(plan, host)` returns `Existing` with the first run id,
    /// even after the original job completed.
    async fn enqueue_run(&self, run: &HostRun) -> Result<EnqueueOutcome, StoreError>;

    /// Pop the next due job (earliest `not_before` first) and lease it to
    /// `worker` for `lease`. Jobs with expired leases are reclaimable.
    async fn lease_next(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<QueueJob>, StoreError>;

    /// Remove a finished job from the queue (terminal run state reached).
    async fn complete_job(&self, job_key: &str) -> Result<(), StoreError>;

    /// Record a failed delivery. With `retry_at` the job is requeued for
    /// that time with its attempt count bumped; without, it is dropped.
    async fn retry_job(
        &self,
        job_key: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    // ── Cancellation ─────────────────────────────────────────────────────────

    /// Flag a run for cancellation. Returns false when the run is unknown.
    async fn request_cancel(&self, run_id: Uuid) -> Result<bool, StoreError>;
    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, StoreError>;

    // ── Audit trail ──────────────────────────────────────────────────────────
    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError>;
    async fn list_events(
        &self,
        run_id: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, StoreError>;
}

/// Shared transition legality check used by both store implementations.
pub(crate) fn check_transition(
    run: &HostRun,
    next: RunState,
) -> Result<(), StoreError> {
    if run.state == next || run.state.can_transition_to(next) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            run_id: run.id,
            from: run.state.to_string(),
            to: next.to_string(),
        })
    }
}
