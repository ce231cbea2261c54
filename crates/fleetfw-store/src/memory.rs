use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleetfw_domain::{Host, HostId, HostRun, Plan, PlanId, RunCtx, RunState};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{AuditEvent, EnqueueOutcome, QueueJob};
use crate::store::{check_transition, RunStore};

#[derive(Default)]
struct Inner {
    plans: HashMap<PlanId, Plan>,
    hosts: HashMap<HostId, Host>,
    runs: HashMap<Uuid, HostRun>,
    queue: HashMap<String, QueueJob>,
    /// job_key → run id, kept after completion for idempotent enqueue.
    run_keys: HashMap<String, Uuid>,
    cancels: HashSet<Uuid>,
    events: Vec<AuditEvent>,
}

/// In-memory implementation of [`RunStore`].
///
/// All data is lost on process exit. Suitable for tests and dry runs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn put_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: &PlanId) -> Result<Option<Plan>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.plans.get(id).cloned())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.plans.values().cloned().collect())
    }

    async fn put_host(&self, host: &Host) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.hosts.insert(host.id.clone(), host.clone());
        Ok(())
    }

    async fn get_host(&self, id: &HostId) -> Result<Option<Host>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.hosts.get(id).cloned())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.hosts.values().cloned().collect())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<HostRun>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.runs.get(&id).cloned())
    }

    async fn list_runs(&self, plan_id: Option<&PlanId>) -> Result<Vec<HostRun>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .runs
            .values()
            .filter(|r| plan_id.map_or(true, |p| &r.plan_id == p))
            .cloned()
            .collect())
    }

    async fn transition_run(
        &self,
        id: Uuid,
        next: RunState,
        ctx: &RunCtx,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let run = guard.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        check_transition(run, next)?;
        run.state = next;
        run.ctx = ctx.clone();
        if next.is_terminal() && run.finished_at.is_none() {
            run.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn enqueue_run(&self, run: &HostRun) -> Result<EnqueueOutcome, StoreError> {
        let mut guard = self.inner.write().await;
        let key = run.job_key();
        if let Some(existing) = guard.run_keys.get(&key) {
            return Ok(EnqueueOutcome::Existing(*existing));
        }
        guard.run_keys.insert(key.clone(), run.id);
        guard.runs.insert(run.id, run.clone());
        guard.queue.insert(
            key.clone(),
            QueueJob::new(key, run.id, run.plan_id.clone(), run.host_id.clone()),
        );
        Ok(EnqueueOutcome::Created(run.id))
    }

    async fn lease_next(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<QueueJob>, StoreError> {
        let mut guard = self.inner.write().await;
        let key = guard
            .queue
            .values()
            .filter(|j| j.is_due(now))
            .min_by_key(|j| j.not_before)
            .map(|j| j.job_key.clone());
        let Some(key) = key else {
            return Ok(None);
        };
        let job = guard.queue.get_mut(&key).expect("job vanished under lock");
        job.attempt += 1;
        job.leased_by = Some(worker.to_string());
        job.leased_until = Some(now + lease);
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, job_key: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.queue.remove(job_key);
        Ok(())
    }

    async fn retry_job(
        &self,
        job_key: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        match retry_at {
            Some(at) => {
                if let Some(job) = guard.queue.get_mut(job_key) {
                    job.not_before = at;
                    job.leased_by = None;
                    job.leased_until = None;
                }
            }
            None => {
                guard.queue.remove(job_key);
            }
        }
        Ok(())
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.runs.contains_key(&run_id) {
            return Ok(false);
        }
        guard.cancels.insert(run_id);
        Ok(true)
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.cancels.contains(&run_id))
    }

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.events.push(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        run_id: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let guard = self.inner.read().await;
        let filtered: Vec<AuditEvent> = guard
            .events
            .iter()
            .filter(|ev| run_id.map_or(true, |rid| ev.run_id() == Some(rid)))
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit as usize);
        Ok(filtered[start..].to_vec())
    }
}
