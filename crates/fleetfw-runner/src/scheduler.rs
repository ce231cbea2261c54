use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use fleetfw_domain::{HostRun, Plan, UpdateError};
use fleetfw_protocol::RetryPolicy;
use fleetfw_store::{AuditEvent, EnqueueOutcome, QueueJob, RunStore, StoreError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::machine::HostRunner;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Simultaneous host-runs.
    pub worker_count: usize,
    /// Queue-level redeliveries for run-level transient failures. Distinct
    /// from (and multiplying with) the manager's per-client retry budget.
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    /// Worker lease per delivery; an expired lease makes the job
    /// reclaimable by another worker.
    pub lease: chrono::Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            worker_count: 5,
            max_attempts: 3,
            retry: RetryPolicy::default(),
            lease: chrono::Duration::minutes(120),
        }
    }
}

/// Pops host-runs off the durable queue and executes them on a bounded
/// worker pool. Owns the in-process cancellation tokens so a cancel request
/// reaches a run mid-poll, not just at its next state boundary.
pub struct Scheduler {
    store: Arc<dyn RunStore>,
    runner: Arc<HostRunner>,
    options: SchedulerOptions,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RunStore>,
        runner: Arc<HostRunner>,
        options: SchedulerOptions,
    ) -> Self {
        Scheduler {
            store,
            runner,
            options,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Persist the plan and enqueue one host-run per target. Idempotent:
    /// a (plan, host) pair that was enqueued before (even by an earlier
    /// process) comes back as `Existing` with the original run id.
    pub async fn enqueue_plan(&self, plan: &Plan) -> Result<Vec<EnqueueOutcome>, StoreError> {
        self.store.put_plan(plan).await?;
        self.store
            .append_event(&AuditEvent::PlanStarted {
                id: Uuid::new_v4(),
                at: Utc::now(),
                plan_id: plan.id.clone(),
                targets: plan.targets.len(),
            })
            .await?;

        let mut outcomes = Vec::with_capacity(plan.targets.len());
        for host_id in &plan.targets {
            let run = HostRun::new(plan.id.clone(), host_id.clone());
            let outcome = self.store.enqueue_run(&run).await?;
            if let EnqueueOutcome::Created(run_id) = outcome {
                self.store
                    .append_event(&AuditEvent::RunEnqueued {
                        id: Uuid::new_v4(),
                        at: Utc::now(),
                        run_id,
                        plan_id: plan.id.clone(),
                        host_id: host_id.clone(),
                    })
                    .await?;
            } else {
                debug!(plan_id = %plan.id, %host_id, "duplicate enqueue deduplicated");
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Signal cancellation for a run. The store flag covers state
    /// boundaries (and other processes); the in-process token interrupts
    /// an active poll immediately.
    pub async fn cancel_host_run(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let known = self.store.request_cancel(run_id).await?;
        if !known {
            return Ok(false);
        }
        if let Some(token) = self.active.lock().expect("active map poisoned").get(&run_id) {
            token.cancel();
        }
        self.store
            .append_event(&AuditEvent::RunCancelled {
                id: Uuid::new_v4(),
                at: Utc::now(),
                run_id,
            })
            .await?;
        info!(%run_id, "cancellation requested");
        Ok(true)
    }

    /// Run the worker pool until `shutdown` is tripped. In-flight runs
    /// finish their current delivery; nothing new is leased afterwards.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut set = JoinSet::new();
        for index in 0..self.options.worker_count.max(1) {
            let scheduler = self.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move { scheduler.worker(index, shutdown).await });
        }
        while set.join_next().await.is_some() {}
    }

    async fn worker(&self, index: usize, shutdown: CancellationToken) {
        let name = format!("worker-{}", index);
        info!(worker = %name, "worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self
                .store
                .lease_next(&name, Utc::now(), self.options.lease)
                .await
            {
                Ok(Some(job)) => self.process(&name, job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                    }
                }
                Err(e) => {
                    warn!(worker = %name, error = %e, "queue pop failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {}
                    }
                }
            }
        }
        info!(worker = %name, "worker stopped");
    }

    async fn process(&self, worker: &str, job: QueueJob) {
        info!(
            worker,
            run_id = %job.run_id,
            host_id = %job.host_id,
            attempt = job.attempt,
            "run delivery"
        );

        let token = CancellationToken::new();
        if self
            .store
            .cancel_requested(job.run_id)
            .await
            .unwrap_or(false)
        {
            token.cancel();
        }
        self.active
            .lock()
            .expect("active map poisoned")
            .insert(job.run_id, token.clone());

        let result = self.runner.execute(job.run_id, &token).await;

        self.active
            .lock()
            .expect("active map poisoned")
            .remove(&job.run_id);

        match result {
            Ok(()) => {
                if let Err(e) = self.store.complete_job(&job.job_key).await {
                    warn!(run_id = %job.run_id, error = %e, "job completion failed");
                }
            }
            Err(error) => self.handle_failure(job, error, token).await,
        }
    }

    async fn handle_failure(&self, job: QueueJob, error: UpdateError, token: CancellationToken) {
        let retryable = error.is_retryable() && job.attempt < self.options.max_attempts;
        if retryable {
            let delay = self.options.retry.delay(job.attempt);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
            warn!(
                run_id = %job.run_id,
                attempt = job.attempt,
                error = %error,
                retry_at = %retry_at,
                "transient run failure, redelivering"
            );
            let _ = self
                .store
                .append_event(&AuditEvent::RunRetried {
                    id: Uuid::new_v4(),
                    at: Utc::now(),
                    run_id: job.run_id,
                    attempt: job.attempt,
                    class: error.class,
                })
                .await;
            if let Err(e) = self.store.retry_job(&job.job_key, Some(retry_at)).await {
                warn!(run_id = %job.run_id, error = %e, "job requeue failed");
            }
            return;
        }

        // Permanent, critical, cancelled, or out of retries: terminal ERROR
        // with best-effort maintenance exit.
        self.runner.finalize_error(job.run_id, error, &token).await;
        if let Err(e) = self.store.complete_job(&job.job_key).await {
            warn!(run_id = %job.run_id, error = %e, "job completion failed");
        }
    }
}
