use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::UpdateError;
use crate::types::{
    HostId, Inventory, InventoryObservation, ManagementProtocol, PlanId, ProgressEvent,
    ProgressKind, ProtocolCapability, TaskCompletion,
};

// ── Run state graph ───────────────────────────────────────────────────────────

/// Per-host orchestration state.
///
/// Transitions:
///   Prechecks → EnterMaint → Apply → Reboot → Postchecks → ExitMaint → Done
///   EnterMaint is skipped (Prechecks → Apply) when the host has no
///   hypervisor reference; any non-terminal state may fail into Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Prechecks,
    EnterMaint,
    Apply,
    Reboot,
    Postchecks,
    ExitMaint,
    Done,
    Error,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Error)
    }

    /// Whether `next` is a legal forward edge from this state. The store
    /// rejects writes that would move a run backwards or out of a terminal
    /// state.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Prechecks, EnterMaint)
                | (Prechecks, Apply)
                | (EnterMaint, Apply)
                | (Apply, Reboot)
                | (Reboot, Postchecks)
                | (Postchecks, ExitMaint)
                | (Postchecks, Done)
                | (ExitMaint, Done)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Prechecks => "PRECHECKS",
            RunState::EnterMaint => "ENTER_MAINT",
            RunState::Apply => "APPLY",
            RunState::Reboot => "REBOOT",
            RunState::Postchecks => "POSTCHECKS",
            RunState::ExitMaint => "EXIT_MAINT",
            RunState::Done => "DONE",
            RunState::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

// ── Run context ───────────────────────────────────────────────────────────────

/// Outcome of one component attempt during APPLY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentResult {
    pub component: String,
    pub image_uri: String,
    pub task: Option<TaskSummary>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub location: String,
    pub state: TaskCompletion,
    pub percent: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceCtx {
    pub entered: bool,
    /// Maintenance was exited (successfully or not); stops the error path
    /// from attempting a second exit.
    pub exited: bool,
    /// Populated when best-effort EXIT_MAINT failed; the run may still be
    /// DONE if APPLY succeeded.
    pub exit_error: Option<String>,
}

/// Typed progress/result bag for a host-run. Only the state machine writes
/// it; observers read it alongside the state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCtx {
    /// 1-based count of update submission attempts across retries.
    pub attempt: u32,
    /// Protocol the manager selected during prechecks.
    pub management_protocol: Option<ManagementProtocol>,
    /// Capabilities discovered during prechecks, one per probed protocol.
    #[serde(default)]
    pub capabilities: Vec<ProtocolCapability>,
    /// Ordered history of structured events.
    #[serde(default)]
    pub progress: Vec<ProgressEvent>,
    /// One entry per component attempt during APPLY.
    #[serde(default)]
    pub results: Vec<ComponentResult>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub maintenance: MaintenanceCtx,
    /// Inventory snapshot taken before APPLY.
    pub baseline_inventory: Option<Inventory>,
    /// Inventory observation after the final task, including the diff.
    pub final_inventory: Option<InventoryObservation>,
    /// Terminal failure, when the run ended in ERROR.
    pub error: Option<UpdateError>,
}

impl RunCtx {
    pub fn push_progress(&mut self, kind: ProgressKind, message: impl Into<String>) {
        self.progress.push(ProgressEvent::now(kind, message));
    }

    pub fn push_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.progress.push(ProgressEvent::now(ProgressKind::Warning, message.clone()));
        self.warnings.push(message);
    }

    /// Components already applied successfully, used to resume APPLY after
    /// a queue redelivery without re-submitting finished work.
    pub fn completed_components(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| {
                r.task
                    .as_ref()
                    .map_or(false, |t| t.state == TaskCompletion::Completed)
            })
            .map(|r| r.component.as_str())
            .collect()
    }
}

// ── HostRun ───────────────────────────────────────────────────────────────────

/// A single instance of the state machine driving one host through one plan.
/// Created by the scheduler, owned by one worker at a time, mutated only by
/// the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRun {
    pub id: Uuid,
    pub plan_id: PlanId,
    pub host_id: HostId,
    pub state: RunState,
    pub ctx: RunCtx,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl HostRun {
    pub fn new(plan_id: PlanId, host_id: HostId) -> Self {
        HostRun {
            id: Uuid::new_v4(),
            plan_id,
            host_id,
            state: RunState::Prechecks,
            ctx: RunCtx::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Composite dedupe key for idempotent enqueue.
    pub fn job_key(&self) -> String {
        job_key(&self.plan_id, &self.host_id)
    }
}

/// The queue's idempotency key: `plan:<planId>:host:<hostId>`.
pub fn job_key(plan_id: &PlanId, host_id: &HostId) -> String {
    format!("plan:{}:host:{}", plan_id, host_id)
}
