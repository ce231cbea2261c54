use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleetfw_domain::{Host, HostId, HostRun, Plan, PlanId, RunCtx, RunState};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{AuditEvent, EnqueueOutcome, QueueJob};
use crate::store::{check_transition, RunStore};

const PLANS: TableDefinition<&str, &[u8]> = TableDefinition::new("plans");
const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");
const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
const QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("queue");
const RUN_KEYS: TableDefinition<&str, &str> = TableDefinition::new("run_keys");
const CANCELS: TableDefinition<&str, u8> = TableDefinition::new("cancels");
const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

fn internal(e: impl std::fmt::Display) -> StoreError {
    StoreError::Internal(e.to_string())
}

/// Persistent store backed by a redb database file.
///
/// Runs, the queue and the dedupe index survive process restarts, so
/// interrupted host-runs are reclaimed and resumed after a crash.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(internal)?;
        }
        let db = Database::create(path).map_err(internal)?;

        // Ensure tables exist
        {
            let wtxn = db.begin_write().map_err(internal)?;
            wtxn.open_table(PLANS).map_err(internal)?;
            wtxn.open_table(HOSTS).map_err(internal)?;
            wtxn.open_table(RUNS).map_err(internal)?;
            wtxn.open_table(QUEUE).map_err(internal)?;
            wtxn.open_table(RUN_KEYS).map_err(internal)?;
            wtxn.open_table(CANCELS).map_err(internal)?;
            wtxn.open_table(EVENTS).map_err(internal)?;
            wtxn.open_table(META).map_err(internal)?;
            wtxn.commit().map_err(internal)?;
        }

        Ok(Self { db: Arc::new(db) })
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let t = rtxn.open_table(table).map_err(internal)?;
        match t.get(key).map_err(internal)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn put_json<T: serde::Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut t = wtxn.open_table(table).map_err(internal)?;
            t.insert(key, bytes.as_slice()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    fn list_json<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> Result<Vec<T>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let t = rtxn.open_table(table).map_err(internal)?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            results.push(serde_json::from_slice(v.value())?);
        }
        Ok(results)
    }
}

#[async_trait]
impl RunStore for RedbStore {
    async fn put_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        self.put_json(PLANS, plan.id.as_str(), plan)
    }

    async fn get_plan(&self, id: &PlanId) -> Result<Option<Plan>, StoreError> {
        self.get_json(PLANS, id.as_str())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        self.list_json(PLANS)
    }

    async fn put_host(&self, host: &Host) -> Result<(), StoreError> {
        self.put_json(HOSTS, host.id.as_str(), host)
    }

    async fn get_host(&self, id: &HostId) -> Result<Option<Host>, StoreError> {
        self.get_json(HOSTS, id.as_str())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        self.list_json(HOSTS)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<HostRun>, StoreError> {
        self.get_json(RUNS, &id.to_string())
    }

    async fn list_runs(&self, plan_id: Option<&PlanId>) -> Result<Vec<HostRun>, StoreError> {
        let all: Vec<HostRun> = self.list_json(RUNS)?;
        Ok(all
            .into_iter()
            .filter(|r| plan_id.map_or(true, |p| &r.plan_id == p))
            .collect())
    }

    async fn transition_run(
        &self,
        id: Uuid,
        next: RunState,
        ctx: &RunCtx,
    ) -> Result<(), StoreError> {
        let key = id.to_string();
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut t = wtxn.open_table(RUNS).map_err(internal)?;
            let mut run: HostRun = match t.get(key.as_str()).map_err(internal)? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => return Err(StoreError::RunNotFound(id)),
            };
            check_transition(&run, next)?;
            run.state = next;
            run.ctx = ctx.clone();
            if next.is_terminal() && run.finished_at.is_none() {
                run.finished_at = Some(Utc::now());
            }
            let bytes = serde_json::to_vec(&run)?;
            t.insert(key.as_str(), bytes.as_slice()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn enqueue_run(&self, run: &HostRun) -> Result<EnqueueOutcome, StoreError> {
        let key = run.job_key();
        let wtxn = self.db.begin_write().map_err(internal)?;
        let outcome = {
            let mut keys = wtxn.open_table(RUN_KEYS).map_err(internal)?;
            let existing = keys
                .get(key.as_str())
                .map_err(internal)?
                .map(|g| g.value().to_string());
            match existing {
                Some(id_str) => {
                    let id = Uuid::parse_str(&id_str)
                        .map_err(|e| StoreError::Internal(format!("corrupt run key: {}", e)))?;
                    EnqueueOutcome::Existing(id)
                }
                None => {
                    let id_str = run.id.to_string();
                    keys.insert(key.as_str(), id_str.as_str()).map_err(internal)?;

                    let mut runs = wtxn.open_table(RUNS).map_err(internal)?;
                    let run_bytes = serde_json::to_vec(run)?;
                    runs.insert(id_str.as_str(), run_bytes.as_slice())
                        .map_err(internal)?;

                    let job = QueueJob::new(
                        key.clone(),
                        run.id,
                        run.plan_id.clone(),
                        run.host_id.clone(),
                    );
                    let mut queue = wtxn.open_table(QUEUE).map_err(internal)?;
                    let job_bytes = serde_json::to_vec(&job)?;
                    queue
                        .insert(key.as_str(), job_bytes.as_slice())
                        .map_err(internal)?;

                    EnqueueOutcome::Created(run.id)
                }
            }
        };
        wtxn.commit().map_err(internal)?;
        Ok(outcome)
    }

    async fn lease_next(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<QueueJob>, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let leased = {
            let mut queue = wtxn.open_table(QUEUE).map_err(internal)?;

            let mut due: Option<QueueJob> = None;
            for entry in queue.iter().map_err(internal)? {
                let (_k, v) = entry.map_err(internal)?;
                let job: QueueJob = serde_json::from_slice(v.value())?;
                if job.is_due(now) && due.as_ref().map_or(true, |d| job.not_before < d.not_before) {
                    due = Some(job);
                }
            }

            match due {
                Some(mut job) => {
                    job.attempt += 1;
                    job.leased_by = Some(worker.to_string());
                    job.leased_until = Some(now + lease);
                    let bytes = serde_json::to_vec(&job)?;
                    queue
                        .insert(job.job_key.as_str(), bytes.as_slice())
                        .map_err(internal)?;
                    Some(job)
                }
                None => None,
            }
        };
        wtxn.commit().map_err(internal)?;
        Ok(leased)
    }

    async fn complete_job(&self, job_key: &str) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut queue = wtxn.open_table(QUEUE).map_err(internal)?;
            queue.remove(job_key).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn retry_job(
        &self,
        job_key: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut queue = wtxn.open_table(QUEUE).map_err(internal)?;
            match retry_at {
                Some(at) => {
                    let job = queue
                        .get(job_key)
                        .map_err(internal)?
                        .map(|g| serde_json::from_slice::<QueueJob>(g.value()))
                        .transpose()?;
                    if let Some(mut job) = job {
                        job.not_before = at;
                        job.leased_by = None;
                        job.leased_until = None;
                        let bytes = serde_json::to_vec(&job)?;
                        queue
                            .insert(job_key, bytes.as_slice())
                            .map_err(internal)?;
                    }
                }
                None => {
                    queue.remove(job_key).map_err(internal)?;
                }
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<bool, StoreError> {
        if self.get_run(run_id).await?.is_none() {
            return Ok(false);
        }
        let key = run_id.to_string();
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut t = wtxn.open_table(CANCELS).map_err(internal)?;
            t.insert(key.as_str(), 1u8).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(true)
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let key = run_id.to_string();
        let rtxn = self.db.begin_read().map_err(internal)?;
        let t = rtxn.open_table(CANCELS).map_err(internal)?;
        Ok(t.get(key.as_str()).map_err(internal)?.is_some())
    }

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(event)?;
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut meta = wtxn.open_table(META).map_err(internal)?;
            let seq = meta
                .get("event_seq")
                .map_err(internal)?
                .map(|g| g.value())
                .unwrap_or(0);
            let new_seq = seq + 1;
            meta.insert("event_seq", new_seq).map_err(internal)?;

            let mut events = wtxn.open_table(EVENTS).map_err(internal)?;
            events
                .insert(new_seq, bytes.as_slice())
                .map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn list_events(
        &self,
        run_id: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(EVENTS).map_err(internal)?;
        let mut all: Vec<AuditEvent> = Vec::new();
        for entry in table.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            let event: AuditEvent = serde_json::from_slice(v.value())?;
            if run_id.map_or(true, |rid| event.run_id() == Some(rid)) {
                all.push(event);
            }
        }
        let start = all.len().saturating_sub(limit as usize);
        Ok(all[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RedbStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("state.redb")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn run_round_trip() {
        let (_dir, store) = open_temp();
        let run = HostRun::new(PlanId::new("p1"), HostId::new("10.0.0.10"));
        store.enqueue_run(&run).await.unwrap();

        let got = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(got.state, RunState::Prechecks);
        assert_eq!(got.host_id.as_str(), "10.0.0.10");
    }

    #[tokio::test]
    async fn dedupe_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        let run = HostRun::new(PlanId::new("p1"), HostId::new("h1"));
        {
            let store = RedbStore::open(&path).unwrap();
            store.enqueue_run(&run).await.unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        let outcome = store
            .enqueue_run(&HostRun::new(PlanId::new("p1"), HostId::new("h1")))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Existing(run.id));
    }

    #[tokio::test]
    async fn queue_survives_reopen_and_leases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store
                .enqueue_run(&HostRun::new(PlanId::new("p1"), HostId::new("h1")))
                .await
                .unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        let job = store
            .lease_next("w0", Utc::now(), Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.attempt, 1);
        store.complete_job(&job.job_key).await.unwrap();
        assert!(store
            .lease_next("w0", Utc::now(), Duration::seconds(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn transition_is_atomic_with_ctx() {
        let (_dir, store) = open_temp();
        let run = HostRun::new(PlanId::new("p1"), HostId::new("h1"));
        store.enqueue_run(&run).await.unwrap();

        let mut ctx = RunCtx::default();
        ctx.attempt = 2;
        store.transition_run(run.id, RunState::Apply, &ctx).await.unwrap();

        let got = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(got.state, RunState::Apply);
        assert_eq!(got.ctx.attempt, 2);

        assert!(store
            .transition_run(run.id, RunState::Prechecks, &ctx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn events_append_in_order() {
        let (_dir, store) = open_temp();
        let run_id = Uuid::new_v4();
        for (from, to) in [
            (RunState::Prechecks, RunState::Apply),
            (RunState::Apply, RunState::Reboot),
        ] {
            store
                .append_event(&AuditEvent::StateChanged {
                    id: Uuid::new_v4(),
                    at: Utc::now(),
                    run_id,
                    from,
                    to,
                })
                .await
                .unwrap();
        }
        let events = store.list_events(Some(run_id), 10).await.unwrap();
        assert_eq!(events.len(), 2);
        match &events[1] {
            AuditEvent::StateChanged { to, .. } => assert_eq!(*to, RunState::Reboot),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
