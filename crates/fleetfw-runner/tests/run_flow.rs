use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use fleetfw_catalog::{CatalogCache, FirmwarePlanner};
use fleetfw_domain::{
    ErrorKind, Host, HostId, ManagementProtocol, Plan, PlanId, PlanPolicy, PlanUpdateMode,
    ProgressKind, RunState, TaskCompletion, UpdateArtifact,
};
use fleetfw_protocol::{
    HttpSettings, ProtocolClient, ProtocolManager, RacadmClient, RedfishClient, RetryPolicy,
};
use fleetfw_runner::{HostRunner, RunnerConfig, Scheduler, SchedulerOptions};
use fleetfw_secrets::FileProvider;
use fleetfw_store::{AuditEvent, EnqueueOutcome, InMemoryStore, RunStore};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    store: Arc<InMemoryStore>,
    runner: Arc<HostRunner>,
    _secrets_file: tempfile::NamedTempFile,
}

fn write_secrets(hypervisor_endpoint: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    write!(
        f,
        r#"
management:
  default:
    username: root
    password: calvin
hypervisors:
  vc-01:
    endpoint: {}
    username: automation
    password: pw
"#,
        hypervisor_endpoint
    )
    .unwrap();
    f
}

fn fixture(server: &MockServer) -> Fixture {
    fixture_with(server, Vec::new())
}

fn fixture_with(server: &MockServer, extra_clients: Vec<Arc<dyn ProtocolClient>>) -> Fixture {
    let settings = HttpSettings::default();
    let store = Arc::new(InMemoryStore::new());
    let secrets_file = write_secrets(&server.uri());
    let secrets = Arc::new(FileProvider::open(secrets_file.path()).unwrap());

    let redfish = Arc::new(RedfishClient::with_base(&settings, server.uri()));
    let mut clients: Vec<Arc<dyn ProtocolClient>> = vec![redfish.clone()];
    clients.extend(extra_clients);
    let manager = Arc::new(ProtocolManager::new(
        clients,
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            jitter: 0.0,
        },
        Duration::from_secs(2),
    ));
    let planner = Arc::new(FirmwarePlanner::new(
        CatalogCache::new(reqwest::Client::new(), Duration::from_secs(60)),
        format!("{}/Catalog.xml", server.uri()),
    ));
    let runner = Arc::new(HostRunner::new(
        store.clone(),
        secrets,
        manager,
        redfish,
        planner,
        settings,
        RunnerConfig {
            task_timeout: Duration::from_secs(20),
            maintenance_timeout: Duration::from_secs(10),
            idrac_return_timeout: Duration::from_secs(5),
            catalog_url: format!("{}/Catalog.xml", server.uri()),
        },
    ));
    Fixture {
        store,
        runner,
        _secrets_file: secrets_file,
    }
}

fn host(id: &str, with_hypervisor: bool) -> Host {
    Host {
        id: HostId::new(id),
        management_endpoint: id.to_string(),
        model: Some("PowerEdge R740".into()),
        service_tag: Some("ABC1234".into()),
        generation: None,
        hypervisor_ref: with_hypervisor.then(|| "vc-01".to_string()),
        host_ref: with_hypervisor.then(|| "host-1002".to_string()),
    }
}

fn specific_url_plan(plan_id: &str, host_id: &str) -> Plan {
    Plan {
        id: PlanId::new(plan_id),
        name: plan_id.to_string(),
        policy: PlanPolicy {
            update_mode: PlanUpdateMode::SpecificUrl,
            catalog_url: None,
            targets: vec![],
            install_upon: None,
            maintenance_timeout_minutes: None,
            max_attempts: None,
            custom_repository_path: None,
        },
        targets: vec![HostId::new(host_id)],
        artifacts: vec![UpdateArtifact {
            component: "iDRAC".into(),
            image_uri: "https://fw.example/idrac-7.10.exe".into(),
            version: Some("7.10.30.00".into()),
            checksum: None,
            sequence: None,
        }],
    }
}

async fn mount_redfish_happy_path(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/redfish/v1/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "RedfishVersion": "1.18.0",
            "Oem": { "Dell": { "ServiceTag": "ABC1234" } }
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/UpdateService"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Actions": { "#UpdateService.SimpleUpdate": {
                "target": "/redfish/v1/UpdateService/Actions/UpdateService.SimpleUpdate"
            }},
            "MultipartHttpPushUri": "/redfish/v1/UpdateService/upload"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/Managers/iDRAC.Embedded.1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Model": "14G Monolithic",
            "FirmwareVersion": "6.10.00.00"
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/redfish/v1/UpdateService/Actions/UpdateService.SimpleUpdate"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", "/redfish/v1/TaskService/Tasks/JID_123456789012"),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/TaskService/Tasks/JID_123456789012"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "TaskState": "Completed",
            "TaskStatus": "OK",
            "PercentComplete": 100,
            "Messages": [ { "Message": "Job completed successfully." } ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/UpdateService/FirmwareInventory"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Members": [
                { "@odata.id": "/redfish/v1/UpdateService/FirmwareInventory/Installed-iDRAC" }
            ]
        })))
        .mount(server)
        .await;
    // Baseline read sees the old version once; every later read the new one.
    Mock::given(method("GET"))
        .and(path("/redfish/v1/UpdateService/FirmwareInventory/Installed-iDRAC"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Id": "Installed-iDRAC",
            "Name": "Integrated Remote Access Controller",
            "Version": "6.10.00.00"
        })))
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/UpdateService/FirmwareInventory/Installed-iDRAC"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Id": "Installed-iDRAC",
            "Name": "Integrated Remote Access Controller",
            "Version": "7.10.30.00"
        })))
        .mount(server)
        .await;
}

async fn mount_hypervisor(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/session"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!("sess-abc")))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/host/host-1002/maintenance"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "task": "task-1" })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/task/task-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "state": "SUCCEEDED" })))
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/session"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

fn observed_states(events: &[AuditEvent]) -> Vec<RunState> {
    events
        .iter()
        .filter_map(|e| match e {
            AuditEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn specific_url_run_without_hypervisor_completes() {
    let server = MockServer::start().await;
    mount_redfish_happy_path(&server).await;
    let fx = fixture(&server);

    fx.store.put_host(&host("10.0.0.10", false)).await.unwrap();
    let plan = specific_url_plan("p1", "10.0.0.10");
    fx.store.put_plan(&plan).await.unwrap();
    let run = fleetfw_domain::HostRun::new(plan.id.clone(), HostId::new("10.0.0.10"));
    fx.store.enqueue_run(&run).await.unwrap();

    fx.runner
        .execute(run.id, &CancellationToken::new())
        .await
        .unwrap();

    let stored = fx.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Done);
    assert!(stored.finished_at.is_some());

    // Component result reached a completed task.
    assert_eq!(stored.ctx.results.len(), 1);
    let result = &stored.ctx.results[0];
    assert_eq!(result.component, "iDRAC");
    assert_eq!(result.task.as_ref().unwrap().state, TaskCompletion::Completed);

    // Inventory diff shows the iDRAC version change.
    let inventory = stored.ctx.final_inventory.as_ref().unwrap();
    assert_eq!(inventory.changes.version_changed.len(), 1);
    assert_eq!(inventory.changes.version_changed[0].after, "7.10.30.00");

    // Generation was stamped back from the probe.
    let probed = fx.store.get_host(&HostId::new("10.0.0.10")).await.unwrap().unwrap();
    assert_eq!(probed.generation, Some(fleetfw_domain::Generation::G14));

    // Observed transitions are a forward path through the graph.
    let events = fx.store.list_events(Some(run.id), 100).await.unwrap();
    assert_eq!(
        observed_states(&events),
        vec![RunState::Apply, RunState::Reboot, RunState::Postchecks, RunState::Done]
    );
}

#[tokio::test]
async fn hypervisor_host_passes_through_maintenance() {
    let server = MockServer::start().await;
    mount_redfish_happy_path(&server).await;
    mount_hypervisor(&server).await;
    let fx = fixture(&server);

    fx.store.put_host(&host("10.0.0.11", true)).await.unwrap();
    let plan = specific_url_plan("p2", "10.0.0.11");
    fx.store.put_plan(&plan).await.unwrap();
    let run = fleetfw_domain::HostRun::new(plan.id.clone(), HostId::new("10.0.0.11"));
    fx.store.enqueue_run(&run).await.unwrap();

    fx.runner
        .execute(run.id, &CancellationToken::new())
        .await
        .unwrap();

    let stored = fx.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Done);
    assert!(stored.ctx.maintenance.entered);
    assert!(stored.ctx.maintenance.exited);
    assert!(stored.ctx.maintenance.exit_error.is_none());

    let events = fx.store.list_events(Some(run.id), 100).await.unwrap();
    assert_eq!(
        observed_states(&events),
        vec![
            RunState::EnterMaint,
            RunState::Apply,
            RunState::Reboot,
            RunState::Postchecks,
            RunState::ExitMaint,
            RunState::Done
        ]
    );
}

#[tokio::test]
async fn missing_update_mode_support_fails_permanently() {
    let server = MockServer::start().await;
    // Service root without the Dell OEM tree, update service without actions.
    Mock::given(method("GET"))
        .and(path("/redfish/v1/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "RedfishVersion": "1.6.0" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/UpdateService"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/Managers/iDRAC.Embedded.1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let fx = fixture(&server);

    fx.store.put_host(&host("10.0.0.12", false)).await.unwrap();
    let plan = specific_url_plan("p3", "10.0.0.12");
    fx.store.put_plan(&plan).await.unwrap();
    let run = fleetfw_domain::HostRun::new(plan.id.clone(), HostId::new("10.0.0.12"));
    fx.store.enqueue_run(&run).await.unwrap();

    let token = CancellationToken::new();
    let err = fx.runner.execute(run.id, &token).await.unwrap_err();
    assert!(!err.is_retryable());

    fx.runner.finalize_error(run.id, err, &token).await;
    let stored = fx.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Error);
    let recorded = stored.ctx.error.as_ref().unwrap();
    assert_eq!(recorded.class, fleetfw_domain::ErrorClass::Permanent);
}

#[tokio::test]
async fn cancellation_mid_poll_finalizes_as_cancelled() {
    let server = MockServer::start().await;
    mount_never_finishing(&server).await;
    let fx = fixture(&server);

    fx.store.put_host(&host("10.0.0.13", false)).await.unwrap();
    let plan = specific_url_plan("p4", "10.0.0.13");
    fx.store.put_plan(&plan).await.unwrap();
    let run = fleetfw_domain::HostRun::new(plan.id.clone(), HostId::new("10.0.0.13"));
    fx.store.enqueue_run(&run).await.unwrap();

    let token = CancellationToken::new();
    let trip = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trip.cancel();
    });

    let err = fx.runner.execute(run.id, &token).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);

    fx.runner.finalize_error(run.id, err, &token).await;
    let stored = fx.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Error);
    assert_eq!(stored.ctx.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    // The submitted task location stays recorded; nothing cancels the iDRAC.
    assert_eq!(stored.ctx.results.len(), 0);
    assert!(!stored.ctx.progress.is_empty());
}

async fn mount_never_finishing(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/redfish/v1/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Oem": { "Dell": {} }
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/UpdateService"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Actions": { "#UpdateService.SimpleUpdate": {
                "target": "/redfish/v1/UpdateService/Actions/UpdateService.SimpleUpdate"
            }}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/Managers/iDRAC.Embedded.1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/redfish/v1/UpdateService/Actions/UpdateService.SimpleUpdate"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", "/redfish/v1/TaskService/Tasks/JID_9"),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/TaskService/Tasks/JID_9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "TaskState": "Running",
            "PercentComplete": 10
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/UpdateService/FirmwareInventory"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Members": [] })))
        .mount(server)
        .await;
}

fn catalog_plan(plan_id: &str, host_id: &str) -> Plan {
    Plan {
        id: PlanId::new(plan_id),
        name: plan_id.to_string(),
        policy: PlanPolicy {
            update_mode: PlanUpdateMode::LatestFromCatalog,
            catalog_url: Some("https://downloads.dell.com/catalog/Catalog.xml.gz".into()),
            targets: vec![],
            install_upon: None,
            maintenance_timeout_minutes: None,
            max_attempts: None,
            custom_repository_path: None,
        },
        targets: vec![HostId::new(host_id)],
        artifacts: vec![],
    }
}

/// A stand-in `racadm` binary: answers `getversion` for detection and a
/// repository `update` with a scheduled job line.
fn write_fake_racadm(dir: &tempfile::TempDir) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("racadm");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         case \"$*\" in\n\
         *getversion*) echo \"iDRAC Version = 5.10.50.00\" ;;\n\
         *update*) echo \"Initiating repository update...\"; echo \"Job JID_271338583761 scheduled\" ;;\n\
         *) exit 1 ;;\n\
         esac\n",
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Redfish surface for a Dell iDRAC whose firmware predates the OEM
/// repository install action: detection succeeds, the install POST 404s.
async fn mount_repo_install_missing(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/redfish/v1/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "RedfishVersion": "1.6.0",
            "Oem": { "Dell": { "ServiceTag": "ABC1234" } }
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/UpdateService"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Actions": {} })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/Managers/iDRAC.Embedded.1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Model": "14G Monolithic",
            "FirmwareVersion": "5.10.50.00"
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/redfish/v1/Dell/Systems/System.Embedded.1/DellSoftwareInstallationService/Actions/DellSoftwareInstallationService.InstallFromRepository"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/UpdateService/FirmwareInventory"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Members": [
                { "@odata.id": "/redfish/v1/UpdateService/FirmwareInventory/Installed-iDRAC" }
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/redfish/v1/UpdateService/FirmwareInventory/Installed-iDRAC"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Id": "Installed-iDRAC",
            "Name": "Integrated Remote Access Controller",
            "Version": "5.10.50.00"
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn repository_install_falls_back_to_racadm() {
    let server = MockServer::start().await;
    mount_repo_install_missing(&server).await;

    let racadm_dir = tempfile::tempdir().unwrap();
    let racadm = Arc::new(RacadmClient::new(write_fake_racadm(&racadm_dir)));
    let fx = fixture_with(&server, vec![racadm]);

    fx.store.put_host(&host("10.0.0.15", false)).await.unwrap();
    let plan = catalog_plan("p6", "10.0.0.15");
    fx.store.put_plan(&plan).await.unwrap();
    let run = fleetfw_domain::HostRun::new(plan.id.clone(), HostId::new("10.0.0.15"));
    fx.store.enqueue_run(&run).await.unwrap();

    fx.runner
        .execute(run.id, &CancellationToken::new())
        .await
        .unwrap();

    // The run completes; a fully-DONE plan exits 0 at the CLI.
    let stored = fx.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Done);
    assert!(stored.ctx.error.is_none());

    // Exactly one fallback phase, its warning recorded in ctx.progress.
    let fallback_warnings: Vec<&String> = stored
        .ctx
        .warnings
        .iter()
        .filter(|w| w.starts_with("RACADM_FALLBACK"))
        .collect();
    assert_eq!(fallback_warnings.len(), 1);
    assert!(fallback_warnings[0].contains("JID_271338583761"));
    assert!(stored
        .ctx
        .progress
        .iter()
        .any(|p| p.kind == ProgressKind::Warning && p.message.starts_with("RACADM_FALLBACK")));

    // The repository attempt is recorded; racadm jobs have no Redfish task.
    assert_eq!(stored.ctx.results.len(), 1);
    assert_eq!(stored.ctx.results[0].component, "repository");
    assert!(stored.ctx.results[0].task.is_none());

    // The protocol hop landed in the audit trail.
    let events = fx.store.list_events(Some(run.id), 100).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        AuditEvent::FallbackTaken {
            from_protocol: ManagementProtocol::Redfish,
            to_protocol: ManagementProtocol::Racadm,
            ..
        }
    )));
}

#[tokio::test]
async fn scheduler_runs_plan_to_done_and_dedupes() {
    let server = MockServer::start().await;
    mount_redfish_happy_path(&server).await;
    let fx = fixture(&server);

    fx.store.put_host(&host("10.0.0.14", false)).await.unwrap();
    let plan = specific_url_plan("p5", "10.0.0.14");

    let scheduler = Arc::new(Scheduler::new(
        fx.store.clone(),
        fx.runner.clone(),
        SchedulerOptions {
            worker_count: 2,
            ..SchedulerOptions::default()
        },
    ));

    let outcomes = scheduler.enqueue_plan(&plan).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    let run_id = outcomes[0].run_id();
    assert!(matches!(outcomes[0], EnqueueOutcome::Created(_)));

    // Property 1: a second start of the same plan creates nothing new.
    let again = scheduler.enqueue_plan(&plan).await.unwrap();
    assert_eq!(again[0], EnqueueOutcome::Existing(run_id));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(scheduler.clone().run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let run = fx.store.get_run(run_id).await.unwrap().unwrap();
        if run.state.is_terminal() {
            assert_eq!(run.state, RunState::Done);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run did not finish in time (state {})",
            run.state
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(fx.store.list_runs(Some(&plan.id)).await.unwrap().len(), 1);
}
