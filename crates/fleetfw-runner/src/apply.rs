use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use fleetfw_catalog::{check_artifact_sequence, sort_update_order};
use fleetfw_domain::{
    ComponentResult, Credentials, FirmwareUpdateRequest, HealthState, Host, HostRun, ImageSource,
    InstallUpon, ManagementProtocol, Plan, PlanUpdateMode, ProgressEvent, TaskCompletion,
    TaskSummary, UpdateArtifact, UpdateError, UpdateMode,
};
use fleetfw_protocol::{collect_software_inventory, poll_task, PollOptions, ProtocolClient};
use fleetfw_store::AuditEvent;
use uuid::Uuid;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::machine::HostRunner;

impl HostRunner {
    // ── APPLY ─────────────────────────────────────────────────────────────────

    pub(crate) async fn apply(
        &self,
        run: &mut HostRun,
        plan: &Plan,
        host: &Host,
        creds: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        if run.ctx.baseline_inventory.is_none() {
            match collect_software_inventory(&self.redfish, host, creds).await {
                Ok(inventory) => run.ctx.baseline_inventory = Some(inventory),
                Err(e) => run
                    .ctx
                    .push_warning(format!("baseline inventory unavailable: {}", e)),
            }
            self.persist(run).await?;
        }

        match plan.policy.update_mode {
            PlanUpdateMode::LatestFromCatalog => {
                self.apply_repository(run, plan, host, creds, cancel).await
            }
            PlanUpdateMode::SpecificUrl => {
                self.apply_artifacts(run, plan, host, creds, cancel, UpdateMode::SimpleUpdate)
                    .await
            }
            PlanUpdateMode::MultipartFile => {
                self.apply_artifacts(run, plan, host, creds, cancel, UpdateMode::MultipartUpdate)
                    .await
            }
        }
    }

    /// LATEST_FROM_CATALOG: one repository-driven install covering every
    /// applicable component. Redfish first; a RACADM fallback is taken by
    /// the protocol manager when the OEM action is missing, after which the
    /// iDRAC restarts and must come back before the run proceeds.
    async fn apply_repository(
        &self,
        run: &mut HostRun,
        plan: &Plan,
        host: &Host,
        creds: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let repository_url = plan
            .policy
            .catalog_url
            .clone()
            .unwrap_or_else(|| self.config.catalog_url.clone());

        let request = FirmwareUpdateRequest {
            host: host.clone(),
            mode: UpdateMode::InstallFromRepository,
            components: plan.artifacts.iter().map(|a| a.component.clone()).collect(),
            image: None,
            repository_url: Some(repository_url.clone()),
            install_upon: plan.policy.install_upon.unwrap_or_default(),
            targets: plan.policy.targets.clone(),
            additional_params: Default::default(),
        };

        let outcome = self.manager.run_update(&request, creds, cancel).await?;
        run.ctx.attempt += outcome.attempts;

        if outcome.protocol == ManagementProtocol::Racadm {
            run.ctx.push_warning(format!(
                "RACADM_FALLBACK: repository update via racadm (job {})",
                outcome.start.job_id.as_deref().unwrap_or("unknown")
            ));
            self.store
                .append_event(&AuditEvent::FallbackTaken {
                    id: Uuid::new_v4(),
                    at: Utc::now(),
                    run_id: run.id,
                    from_protocol: ManagementProtocol::Redfish,
                    to_protocol: outcome.protocol,
                })
                .await?;
            self.persist(run).await?;
            self.wait_for_idrac_return(host, creds, cancel).await?;
        }

        let mut result = ComponentResult {
            component: "repository".to_string(),
            image_uri: repository_url,
            task: None,
            message: outcome.start.messages.first().cloned(),
        };

        if let Some(task_location) = outcome.start.task_location.clone() {
            let observation = self
                .poll_into_ctx(run, host, creds, &task_location, cancel)
                .await?;
            result.task = Some(TaskSummary {
                location: task_location,
                state: observation.state,
                percent: observation.percent,
            });
            if let Some(inventory) = observation.inventory {
                run.ctx.final_inventory = Some(inventory);
            }
            let failed = observation.state != TaskCompletion::Completed;
            run.ctx.results.push(result);
            self.persist(run).await?;
            if failed {
                return Err(UpdateError::protocol(format!(
                    "repository install task ended {:?}: {}",
                    observation.state,
                    observation.messages.join("; ")
                ))
                .with_host(&host.id)
                .with_component("repository"));
            }
        } else {
            run.ctx.results.push(result);
            self.persist(run).await?;
        }

        Ok(())
    }

    /// SPECIFIC_URL / MULTIPART_FILE: one submission per artifact, polled
    /// to completion, resumable across redeliveries via `ctx.results`.
    async fn apply_artifacts(
        &self,
        run: &mut HostRun,
        plan: &Plan,
        host: &Host,
        creds: &Credentials,
        cancel: &CancellationToken,
        mode: UpdateMode,
    ) -> Result<(), UpdateError> {
        check_artifact_sequence(&plan.artifacts).map_err(UpdateError::from)?;
        let artifacts = ordered_artifacts(&plan.artifacts);

        for artifact in artifacts {
            self.check_artifact_cancel(run, cancel).await?;

            let already_done = run.ctx.results.iter().any(|r| {
                r.component == artifact.component
                    && r.image_uri == artifact.image_uri
                    && r.task
                        .as_ref()
                        .map_or(false, |t| t.state == TaskCompletion::Completed)
            });
            if already_done {
                info!(
                    run_id = %run.id,
                    component = %artifact.component,
                    "component already applied, skipping"
                );
                continue;
            }

            let image = ImageSource::parse(&artifact.image_uri);
            if let (Some(checksum), ImageSource::File(path)) = (&artifact.checksum, &image) {
                verify_checksum(path, checksum)
                    .await
                    .map_err(|e| e.with_component(&artifact.component))?;
            }

            let request = FirmwareUpdateRequest {
                host: host.clone(),
                mode,
                components: vec![artifact.component.clone()],
                image: Some(image),
                repository_url: None,
                install_upon: plan
                    .policy
                    .install_upon
                    .unwrap_or_else(|| InstallUpon::default_for(&artifact.component)),
                targets: plan.policy.targets.clone(),
                additional_params: Default::default(),
            };

            info!(
                run_id = %run.id,
                component = %artifact.component,
                image_uri = %artifact.image_uri,
                "submitting component update"
            );
            let outcome = self
                .manager
                .run_update(&request, creds, cancel)
                .await
                .map_err(|e| e.with_component(&artifact.component))?;
            run.ctx.attempt += outcome.attempts;

            let mut result = ComponentResult {
                component: artifact.component.clone(),
                image_uri: artifact.image_uri.clone(),
                task: None,
                message: outcome
                    .start
                    .job_id
                    .clone()
                    .or_else(|| outcome.start.messages.first().cloned()),
            };

            match outcome.start.task_location.clone() {
                Some(task_location) => {
                    let observation = self
                        .poll_into_ctx(run, host, creds, &task_location, cancel)
                        .await
                        .map_err(|e| e.with_component(&artifact.component))?;
                    result.task = Some(TaskSummary {
                        location: task_location,
                        state: observation.state,
                        percent: observation.percent,
                    });
                    if let Some(inventory) = observation.inventory {
                        run.ctx.final_inventory = Some(inventory);
                    }
                    let failed = observation.state != TaskCompletion::Completed;
                    let messages = observation.messages.join("; ");
                    run.ctx.results.push(result);
                    self.persist(run).await?;
                    if failed {
                        return Err(UpdateError::protocol(format!(
                            "component {} task ended {:?}: {}",
                            artifact.component, observation.state, messages
                        ))
                        .with_host(&host.id)
                        .with_component(&artifact.component));
                    }
                }
                None => {
                    // Jobs without a pollable task (WSMAN) are recorded as
                    // queued; the postcheck inventory diff is the evidence.
                    run.ctx.results.push(result);
                    self.persist(run).await?;
                }
            }
        }

        Ok(())
    }

    async fn check_artifact_cancel(
        &self,
        run: &HostRun,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        if cancel.is_cancelled() || self.store.cancel_requested(run.id).await? {
            return Err(UpdateError::cancelled().with_host(&run.host_id));
        }
        Ok(())
    }

    /// Poll a task, streaming its events into `ctx.progress`.
    async fn poll_into_ctx(
        &self,
        run: &mut HostRun,
        host: &Host,
        creds: &Credentials,
        task_location: &str,
        cancel: &CancellationToken,
    ) -> Result<fleetfw_domain::TaskObservation, UpdateError> {
        let mut events: Vec<ProgressEvent> = Vec::new();
        let result = poll_task(
            &self.redfish,
            host,
            creds,
            task_location,
            PollOptions {
                timeout: self.config.task_timeout,
                baseline: run.ctx.baseline_inventory.clone(),
            },
            cancel,
            &mut |event| events.push(event),
        )
        .await;
        run.ctx.progress.extend(events);
        self.persist(run).await?;
        result
    }

    /// After a RACADM repository update the iDRAC restarts. Block until its
    /// Redfish endpoint answers again (bounded), so postchecks don't race
    /// the controller.
    async fn wait_for_idrac_return(
        &self,
        host: &Host,
        creds: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let deadline = tokio::time::Instant::now() + self.config.idrac_return_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(UpdateError::cancelled().with_host(&host.id));
            }
            let health = self.redfish.health_check(host, creds).await;
            if health.status == HealthState::Healthy {
                info!(host_id = %host.id, "iDRAC back after racadm update");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(UpdateError::timeout(format!(
                    "iDRAC on {} did not return within {:?} after racadm update",
                    host.id, self.config.idrac_return_timeout
                ))
                .with_host(&host.id));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(UpdateError::cancelled().with_host(&host.id)),
                _ = tokio::time::sleep(Duration::from_secs(15).min(deadline - tokio::time::Instant::now())) => {}
            }
        }
    }
}

/// Apply order: explicit sequence numbers first (ascending), then canonical
/// component order for the rest.
fn ordered_artifacts(artifacts: &[UpdateArtifact]) -> Vec<UpdateArtifact> {
    let components: Vec<String> = artifacts.iter().map(|a| a.component.clone()).collect();
    let canonical = sort_update_order(&components);
    let rank = |component: &str| {
        canonical
            .iter()
            .position(|c| c.eq_ignore_ascii_case(component))
            .unwrap_or(usize::MAX)
    };
    let mut sorted = artifacts.to_vec();
    sorted.sort_by_key(|a| (a.sequence.unwrap_or(u32::MAX), rank(&a.component)));
    sorted
}

/// Stream a local image through SHA-256 and compare against the expected
/// hex digest.
async fn verify_checksum(path: &Path, expected: &str) -> Result<(), UpdateError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        UpdateError::validation(format!("cannot open image {}: {}", path.display(), e))
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .map_err(|e| UpdateError::validation(format!("image read failed: {}", e)))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    let digest = format!("{:x}", hasher.finalize());
    if digest.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        warn!(path = %path.display(), "image checksum mismatch");
        Err(UpdateError::validation(format!(
            "checksum mismatch for {}: expected {}, computed {}",
            path.display(),
            expected,
            digest
        )))
    }
}
