use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetfw_catalog::{FirmwarePlanner, PlanRequest};
use fleetfw_domain::{
    Credentials, Generation, Host, HostRun, Plan, PlanUpdateMode, ProgressKind, RunState,
    UpdateError, UpdateMode,
};
use fleetfw_protocol::{
    collect_software_inventory, diff_inventories, HttpSettings, HypervisorClient,
    MaintenanceOptions, ProtocolManager, RedfishClient,
};
use fleetfw_secrets::CredentialsProvider;
use fleetfw_store::{AuditEvent, RunStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Overall Redfish task deadline per component.
    pub task_timeout: Duration,
    /// Hypervisor maintenance entry/exit cap.
    pub maintenance_timeout: Duration,
    /// How long to wait for the iDRAC to come back after a RACADM
    /// repository update restarts it.
    pub idrac_return_timeout: Duration,
    /// Default catalog URL when the plan has no override.
    pub catalog_url: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            task_timeout: Duration::from_secs(90 * 60),
            maintenance_timeout: Duration::from_secs(30 * 60),
            idrac_return_timeout: Duration::from_secs(10 * 60),
            catalog_url: "https://downloads.dell.com/catalog/Catalog.xml.gz".to_string(),
        }
    }
}

// ── HostRunner ────────────────────────────────────────────────────────────────

/// Drives one host-run through the state graph:
///
/// ```text
/// PRECHECKS → ENTER_MAINT → APPLY → REBOOT → POSTCHECKS → EXIT_MAINT → DONE
/// ```
///
/// ENTER_MAINT is skipped for hosts without a hypervisor reference. Every
/// transition persists state and ctx together; re-entering a state after a
/// queue redelivery re-evaluates its preconditions and resumes from
/// `ctx.results`.
pub struct HostRunner {
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) secrets: Arc<dyn CredentialsProvider>,
    pub(crate) manager: Arc<ProtocolManager>,
    pub(crate) redfish: Arc<RedfishClient>,
    pub(crate) planner: Arc<FirmwarePlanner>,
    pub(crate) http: HttpSettings,
    pub(crate) config: RunnerConfig,
}

impl HostRunner {
    pub fn new(
        store: Arc<dyn RunStore>,
        secrets: Arc<dyn CredentialsProvider>,
        manager: Arc<ProtocolManager>,
        redfish: Arc<RedfishClient>,
        planner: Arc<FirmwarePlanner>,
        http: HttpSettings,
        config: RunnerConfig,
    ) -> Self {
        HostRunner {
            store,
            secrets,
            manager,
            redfish,
            planner,
            http,
            config,
        }
    }

    /// Execute the run until DONE or the first failure. Failures are
    /// returned to the scheduler undecided: transient ones may be
    /// redelivered with the run still in its current state, anything else
    /// goes through [`finalize_error`](Self::finalize_error).
    pub async fn execute(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| UpdateError::validation(format!("unknown host-run {}", run_id)))?;
        if run.state.is_terminal() {
            return Ok(());
        }

        let plan = self
            .store
            .get_plan(&run.plan_id)
            .await?
            .ok_or_else(|| UpdateError::validation(format!("unknown plan {}", run.plan_id)))?;
        let host = self
            .store
            .get_host(&run.host_id)
            .await?
            .ok_or_else(|| UpdateError::validation(format!("unknown host {}", run.host_id)))?;

        // Credentials are scoped to this delivery and dropped (zeroed) with it.
        let creds = self
            .secrets
            .management_credentials(&host.id)
            .await
            .map_err(|e| UpdateError::from(e).with_host(&host.id))?;

        loop {
            self.check_cancel(&run, cancel).await?;
            match run.state {
                RunState::Prechecks => {
                    let next = self.prechecks(&mut run, &plan, &host, &creds).await?;
                    self.transition(&mut run, next).await?;
                }
                RunState::EnterMaint => {
                    self.enter_maintenance(&mut run, &plan, &host, cancel).await?;
                    self.transition(&mut run, RunState::Apply).await?;
                }
                RunState::Apply => {
                    self.apply(&mut run, &plan, &host, &creds, cancel).await?;
                    self.transition(&mut run, RunState::Reboot).await?;
                }
                RunState::Reboot => {
                    self.reboot_marker(&mut run, &plan, &host, &creds).await;
                    self.transition(&mut run, RunState::Postchecks).await?;
                }
                RunState::Postchecks => {
                    self.postchecks(&mut run, &host, &creds).await?;
                    let next = if run.ctx.maintenance.entered && !run.ctx.maintenance.exited {
                        RunState::ExitMaint
                    } else {
                        RunState::Done
                    };
                    self.transition(&mut run, next).await?;
                }
                RunState::ExitMaint => {
                    self.exit_maintenance_best_effort(&mut run, &host, cancel).await;
                    self.transition(&mut run, RunState::Done).await?;
                }
                RunState::Done | RunState::Error => return Ok(()),
            }
        }
    }

    /// Terminate a run in ERROR after a best-effort maintenance exit. The
    /// scheduler calls this once retries are exhausted (or the failure was
    /// never retryable).
    pub async fn finalize_error(
        &self,
        run_id: Uuid,
        error: UpdateError,
        cancel: &CancellationToken,
    ) {
        let Ok(Some(mut run)) = self.store.get_run(run_id).await else {
            warn!(%run_id, "cannot load run for error finalization");
            return;
        };
        if run.state.is_terminal() {
            return;
        }

        if run.ctx.maintenance.entered && !run.ctx.maintenance.exited {
            if let Ok(Some(host)) = self.store.get_host(&run.host_id).await {
                self.exit_maintenance_best_effort(&mut run, &host, cancel).await;
            }
        }

        warn!(%run_id, error = %error, "host-run failed");
        run.ctx.push_progress(ProgressKind::Error, error.to_string());
        run.ctx.error = Some(error);
        if let Err(e) = self.store.transition_run(run.id, RunState::Error, &run.ctx).await {
            warn!(%run_id, error = %e, "failed to persist terminal error state");
            return;
        }
        let _ = self
            .store
            .append_event(&AuditEvent::StateChanged {
                id: Uuid::new_v4(),
                at: Utc::now(),
                run_id: run.id,
                from: run.state,
                to: RunState::Error,
            })
            .await;
    }

    // ── Shared helpers ────────────────────────────────────────────────────────

    async fn check_cancel(
        &self,
        run: &HostRun,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        if cancel.is_cancelled() || self.store.cancel_requested(run.id).await? {
            return Err(UpdateError::cancelled().with_host(&run.host_id));
        }
        Ok(())
    }

    async fn transition(&self, run: &mut HostRun, next: RunState) -> Result<(), UpdateError> {
        let from = run.state;
        self.store.transition_run(run.id, next, &run.ctx).await?;
        run.state = next;
        info!(run_id = %run.id, host_id = %run.host_id, %from, to = %next, "state transition");
        self.store
            .append_event(&AuditEvent::StateChanged {
                id: Uuid::new_v4(),
                at: Utc::now(),
                run_id: run.id,
                from,
                to: next,
            })
            .await?;
        Ok(())
    }

    /// Persist a ctx refresh without changing state.
    pub(crate) async fn persist(&self, run: &HostRun) -> Result<(), UpdateError> {
        self.store.transition_run(run.id, run.state, &run.ctx).await?;
        Ok(())
    }

    pub(crate) fn required_mode(plan: &Plan) -> UpdateMode {
        match plan.policy.update_mode {
            PlanUpdateMode::LatestFromCatalog => UpdateMode::InstallFromRepository,
            PlanUpdateMode::SpecificUrl => UpdateMode::SimpleUpdate,
            PlanUpdateMode::MultipartFile => UpdateMode::MultipartUpdate,
        }
    }

    // ── PRECHECKS ─────────────────────────────────────────────────────────────

    async fn prechecks(
        &self,
        run: &mut HostRun,
        plan: &Plan,
        host: &Host,
        creds: &Credentials,
    ) -> Result<RunState, UpdateError> {
        // The capability cache lives for one run.
        self.manager.invalidate(&host.id).await;
        let detection = self.manager.detect(host, creds).await?;

        let required = Self::required_mode(plan);
        let mode_available = detection
            .capabilities
            .values()
            .any(|cap| cap.supported && cap.update_modes.contains(&required));
        if !mode_available {
            return Err(UpdateError::validation(format!(
                "no detected protocol on {} supports update mode {}",
                host.id, required
            ))
            .with_host(&host.id));
        }

        run.ctx.management_protocol = Some(detection.healthiest);
        let mut capabilities: Vec<_> = detection.capabilities.values().cloned().collect();
        capabilities.sort_by(|a, b| b.protocol.priority().cmp(&a.protocol.priority()));
        run.ctx.capabilities = capabilities;
        run.ctx.push_progress(
            ProgressKind::Info,
            format!(
                "prechecks passed: management via {} ({} candidate protocols)",
                detection.healthiest,
                detection.candidates.len()
            ),
        );

        // Stamp the probed generation back onto the host record.
        let probed_generation = detection
            .capabilities
            .values()
            .find_map(|cap| cap.generation);
        if let Some(generation) = probed_generation {
            if host.generation != Some(generation) {
                let mut updated = host.clone();
                updated.generation = Some(generation);
                self.store.put_host(&updated).await?;
            }
        }

        // Catalog plans with named components are gated up front so a plan
        // with nothing applicable fails fast, not mid-APPLY.
        if plan.policy.update_mode == PlanUpdateMode::LatestFromCatalog
            && !plan.artifacts.is_empty()
        {
            let firmware_plan = self
                .planner
                .plan(&PlanRequest {
                    generation: probed_generation.unwrap_or(Generation::Unknown),
                    model: host.model.clone(),
                    components: plan.artifacts.iter().map(|a| a.component.clone()).collect(),
                    catalog_url: plan.policy.catalog_url.clone(),
                    custom_repository_path: plan.policy.custom_repository_path.clone(),
                })
                .await
                .map_err(|e| UpdateError::from(e).with_host(&host.id))?;
            for artifact in &firmware_plan.artifacts {
                run.ctx.push_progress(
                    ProgressKind::Info,
                    format!(
                        "planned {} {} from catalog",
                        artifact.component,
                        artifact.version.as_deref().unwrap_or("?")
                    ),
                );
            }
            for skipped in &firmware_plan.skipped {
                run.ctx
                    .push_warning(format!("{}: {}", skipped.component, skipped.reasons.join("; ")));
            }
        }

        Ok(if host.hypervisor_ref.is_some() {
            RunState::EnterMaint
        } else {
            RunState::Apply
        })
    }

    // ── ENTER_MAINT ───────────────────────────────────────────────────────────

    async fn enter_maintenance(
        &self,
        run: &mut HostRun,
        plan: &Plan,
        host: &Host,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        // Reachable with a stale host record after a redelivery.
        let hypervisor_ref = host.hypervisor_ref.as_deref().ok_or_else(|| {
            UpdateError::validation(format!("host {} lost its hypervisor_ref", host.id))
                .with_host(&host.id)
        })?;
        let host_ref = host.host_ref.as_deref().ok_or_else(|| {
            UpdateError::validation(format!(
                "host {} has hypervisor_ref but no host_ref",
                host.id
            ))
            .with_host(&host.id)
        })?;

        let hv = self
            .secrets
            .hypervisor_credentials(&host.id, hypervisor_ref)
            .await
            .map_err(|e| UpdateError::from(e).with_host(&host.id))?;
        let client = HypervisorClient::new(&self.http, &hv.endpoint)?;
        client.login(&hv.credentials).await?;

        let timeout = plan
            .policy
            .maintenance_timeout_minutes
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(self.config.maintenance_timeout);
        let options = MaintenanceOptions {
            evacuate_powered_off: true,
            timeout_minutes: timeout.as_secs() / 60,
        };

        info!(host_id = %host.id, %host_ref, "entering hypervisor maintenance");
        let task = client.enter_maintenance(host_ref, &options).await?;
        let result = client.wait_for_task(&task, timeout, cancel).await;
        client.logout().await;
        result?;

        run.ctx.maintenance.entered = true;
        run.ctx
            .push_progress(ProgressKind::Info, "host entered maintenance mode");
        Ok(())
    }

    // ── REBOOT (marker) ───────────────────────────────────────────────────────

    /// The reboot itself rides inside the Redfish update task. Only an
    /// explicit `OnReset` policy triggers a separate system reset.
    async fn reboot_marker(
        &self,
        run: &mut HostRun,
        plan: &Plan,
        host: &Host,
        creds: &Credentials,
    ) {
        if plan.policy.install_upon == Some(fleetfw_domain::InstallUpon::OnReset) {
            match self.redfish.reset_system(host, creds, "GracefulRestart").await {
                Ok(()) => run
                    .ctx
                    .push_progress(ProgressKind::Info, "graceful restart requested for staged images"),
                Err(e) => run.ctx.push_warning(format!("system reset request failed: {}", e)),
            }
        } else {
            run.ctx.push_progress(
                ProgressKind::Info,
                "reboot handled by the update task where required",
            );
        }
    }

    // ── POSTCHECKS ────────────────────────────────────────────────────────────

    async fn postchecks(
        &self,
        run: &mut HostRun,
        host: &Host,
        creds: &Credentials,
    ) -> Result<(), UpdateError> {
        match collect_software_inventory(&self.redfish, host, creds).await {
            Ok(after) => {
                let before = run.ctx.baseline_inventory.clone().unwrap_or_default();
                let changes = diff_inventories(&before, &after);
                run.ctx.push_progress(
                    ProgressKind::Info,
                    format!(
                        "postchecks: {} components, {} changed",
                        after.len(),
                        changes.version_changed.len()
                    ),
                );
                run.ctx.final_inventory = Some(fleetfw_domain::InventoryObservation {
                    before,
                    after,
                    changes,
                });
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(e.with_host(&host.id)),
            Err(e) => {
                // Hosts managed over WSMAN/RACADM may not answer Redfish
                // inventory reads; that alone doesn't fail a finished update.
                if run.ctx.management_protocol
                    == Some(fleetfw_domain::ManagementProtocol::Redfish)
                {
                    Err(e.with_host(&host.id))
                } else {
                    run.ctx
                        .push_warning(format!("postcheck inventory unavailable: {}", e));
                    Ok(())
                }
            }
        }
    }

    // ── EXIT_MAINT (best effort) ──────────────────────────────────────────────

    /// Exit maintenance and wait for the task. Never fails the run: an
    /// exit failure is surfaced in `ctx.maintenance.exit_error` and the
    /// warnings list instead.
    pub(crate) async fn exit_maintenance_best_effort(
        &self,
        run: &mut HostRun,
        host: &Host,
        cancel: &CancellationToken,
    ) {
        if !run.ctx.maintenance.entered || run.ctx.maintenance.exited {
            return;
        }
        run.ctx.maintenance.exited = true;

        let result = async {
            let hypervisor_ref = host
                .hypervisor_ref
                .as_deref()
                .ok_or_else(|| UpdateError::validation("host lost its hypervisor_ref"))?;
            let host_ref = host
                .host_ref
                .as_deref()
                .ok_or_else(|| UpdateError::validation("host lost its host_ref"))?;
            let hv = self
                .secrets
                .hypervisor_credentials(&host.id, hypervisor_ref)
                .await?;
            let client = HypervisorClient::new(&self.http, &hv.endpoint)?;
            client.login(&hv.credentials).await?;
            let task = client.exit_maintenance(host_ref).await?;
            // Exit must run even for a cancelled run, so the task wait gets
            // a fresh token rather than the tripped one.
            let wait_cancel = if cancel.is_cancelled() {
                CancellationToken::new()
            } else {
                cancel.clone()
            };
            let result = client
                .wait_for_task(&task, self.config.maintenance_timeout, &wait_cancel)
                .await;
            client.logout().await;
            result
        }
        .await;

        match result {
            Ok(()) => {
                run.ctx
                    .push_progress(ProgressKind::Info, "host exited maintenance mode");
            }
            Err(e) => {
                warn!(host_id = %host.id, error = %e, "maintenance exit failed");
                run.ctx.maintenance.exit_error = Some(e.to_string());
                run.ctx.push_warning(format!("maintenance exit failed: {}", e));
            }
        }
    }
}
