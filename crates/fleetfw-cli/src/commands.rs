use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetfw_api::build_app;
use fleetfw_catalog::{CatalogCache, FirmwarePlanner};
use fleetfw_config::OrchestratorConfig;
use fleetfw_domain::{Credentials, Host, HostId, PlanId};
use fleetfw_protocol::{
    HttpSettings, IpmiClient, ProtocolClient, ProtocolManager, RacadmClient, RedfishClient,
    RetryPolicy, SshClient, WsmanClient,
};
use fleetfw_runner::{HostRunner, RunnerConfig, Scheduler, SchedulerOptions};
use fleetfw_secrets::{provider_from_ref, SplitProvider};
use fleetfw_store::{InMemoryStore, RedbStore, RunStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::output;

/// Everything a command needs, wired once from the orchestrator config.
pub struct Stack {
    pub config: OrchestratorConfig,
    pub store: Arc<dyn RunStore>,
    pub manager: Arc<ProtocolManager>,
    pub runner: Arc<HostRunner>,
}

pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig, i32> {
    fleetfw_config::load_config(path).map_err(|e| {
        eprintln!("config error: {}", e);
        2
    })
}

pub fn build_stack(config: OrchestratorConfig) -> Result<Stack> {
    let http = HttpSettings {
        reject_unauthorized: config.tls.reject_unauthorized,
        ca_bundle_path: config.tls.ca_bundle_path.clone(),
        timeout: config.timeouts.http,
    };

    let store: Arc<dyn RunStore> = match &config.store_path {
        Some(path) => Arc::new(RedbStore::open(path).context("opening state store")?),
        None => Arc::new(InMemoryStore::new()),
    };

    let redfish = Arc::new(RedfishClient::new(&http).context("building redfish client")?);
    let clients: Vec<Arc<dyn ProtocolClient>> = vec![
        redfish.clone(),
        Arc::new(WsmanClient::new(&http).context("building wsman client")?),
        Arc::new(RacadmClient::new(config.racadm_path.clone())),
        Arc::new(IpmiClient::new(config.ipmitool_path.clone())),
        Arc::new(SshClient::new()),
    ];
    let manager = Arc::new(ProtocolManager::new(
        clients,
        RetryPolicy {
            max_attempts: config.max_attempts,
            ..RetryPolicy::default()
        },
        config.timeouts.detect,
    ));

    let catalog_client = reqwest::Client::builder()
        .timeout(config.timeouts.catalog_fetch)
        .build()
        .context("building catalog http client")?;
    let planner = Arc::new(FirmwarePlanner::new(
        CatalogCache::new(catalog_client, config.catalog_cache_ttl),
        config.catalog_url.clone(),
    ));

    let secrets = Arc::new(SplitProvider::new(
        provider_from_ref(&config.management_secrets).context("management secrets backend")?,
        provider_from_ref(&config.hypervisor_secrets).context("hypervisor secrets backend")?,
    ));

    let runner = Arc::new(HostRunner::new(
        store.clone(),
        secrets,
        manager.clone(),
        redfish,
        planner,
        http,
        RunnerConfig {
            task_timeout: config.timeouts.task,
            maintenance_timeout: config.timeouts.maintenance,
            idrac_return_timeout: Duration::from_secs(10 * 60),
            catalog_url: config.catalog_url.clone(),
        },
    ));

    Ok(Stack {
        config,
        store,
        manager,
        runner,
    })
}

fn scheduler_for(stack: &Stack) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(
        stack.store.clone(),
        stack.runner.clone(),
        SchedulerOptions {
            worker_count: stack.config.worker_count,
            max_attempts: stack.config.max_attempts,
            ..SchedulerOptions::default()
        },
    ))
}

async fn register_hosts(store: &Arc<dyn RunStore>, path: &Path) -> Result<usize, i32> {
    let hosts = fleetfw_config::load_hosts(path).map_err(|e| {
        eprintln!("hosts file error: {}", e);
        2
    })?;
    let count = hosts.len();
    for host in hosts {
        if let Err(e) = store.put_host(&host).await {
            eprintln!("failed to register host: {}", e);
            return Err(1);
        }
    }
    Ok(count)
}

// ── serve ─────────────────────────────────────────────────────────────────────

pub async fn serve(
    stack: Stack,
    bind: String,
    token: String,
    hosts: Option<PathBuf>,
) -> Result<i32> {
    if let Some(path) = &hosts {
        match register_hosts(&stack.store, path).await {
            Ok(count) => info!(count, "hosts registered from inventory file"),
            Err(code) => return Ok(code),
        }
    }

    let scheduler = scheduler_for(&stack);
    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown.clone()));

    let app = build_app(
        stack.store.clone(),
        scheduler,
        stack.manager.clone(),
        Arc::new(token),
    );
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!(%bind, workers = stack.config.worker_count, "fleetfw serving");

    let server = async { axum::serve(listener, app).await };
    tokio::select! {
        result = server => {
            result.context("api server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    shutdown.cancel();
    let _ = scheduler_task.await;
    Ok(0)
}

// ── apply ─────────────────────────────────────────────────────────────────────

pub async fn apply(stack: Stack, plan_path: PathBuf, hosts_path: PathBuf, dry_run: bool) -> Result<i32> {
    let plan = match fleetfw_config::load_plan(&plan_path) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("plan error: {}", e);
            return Ok(2);
        }
    };

    if plan.targets.is_empty() {
        eprintln!("plan '{}' has no target hosts", plan.id);
        return Ok(2);
    }
    if let Err(code) = register_hosts(&stack.store, &hosts_path).await {
        return Ok(code);
    }
    for target in &plan.targets {
        if stack.store.get_host(target).await?.is_none() {
            eprintln!("plan targets unknown host '{}'", target);
            return Ok(2);
        }
    }

    if dry_run {
        println!("plan {} ({} targets):", plan.id, plan.targets.len());
        for target in &plan.targets {
            println!("  {}", target);
        }
        return Ok(0);
    }

    let scheduler = scheduler_for(&stack);
    let outcomes = scheduler.enqueue_plan(&plan).await?;
    info!(plan_id = %plan.id, runs = outcomes.len(), "plan enqueued");

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown.clone()));

    // Drive until every host-run reaches a terminal state.
    let runs = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let runs = stack.store.list_runs(Some(&plan.id)).await?;
        if !runs.is_empty() && runs.iter().all(|r| r.state.is_terminal()) {
            break runs;
        }
    };

    shutdown.cancel();
    let _ = scheduler_task.await;

    let mut runs = runs;
    runs.sort_by(|a, b| a.host_id.as_str().cmp(b.host_id.as_str()));
    output::print_runs(&runs);
    Ok(output::exit_code_for_runs(&runs))
}

// ── status ────────────────────────────────────────────────────────────────────

pub async fn status(stack: Stack, plan_id: String) -> Result<i32> {
    let plan_id = PlanId::new(plan_id);
    if stack.store.get_plan(&plan_id).await?.is_none() {
        eprintln!("plan '{}' not found", plan_id);
        return Ok(2);
    }
    let mut runs = stack.store.list_runs(Some(&plan_id)).await?;
    runs.sort_by(|a, b| a.host_id.as_str().cmp(b.host_id.as_str()));
    output::print_runs(&runs);
    Ok(0)
}

// ── discover ──────────────────────────────────────────────────────────────────

pub async fn discover(
    stack: Stack,
    host_id: String,
    username: String,
    password: String,
    endpoint: Option<String>,
) -> Result<i32> {
    let id = HostId::new(&host_id);
    let host = match stack.store.get_host(&id).await? {
        Some(host) => host,
        None => match endpoint {
            Some(management_endpoint) => Host {
                id,
                management_endpoint,
                model: None,
                service_tag: None,
                generation: None,
                hypervisor_ref: None,
                host_ref: None,
            },
            None => {
                eprintln!("host '{}' is not registered; pass --endpoint", host_id);
                return Ok(2);
            }
        },
    };

    let creds = Credentials::new(username, password);
    stack.manager.invalidate(&host.id).await;
    match stack.manager.detect(&host, &creds).await {
        Ok(detection) => {
            let health = stack.manager.health_check(&host, &creds).await;
            output::print_detection(&detection, &health);
            Ok(0)
        }
        Err(e) => {
            eprintln!("discovery failed: {}", e);
            Ok(output::exit_code_for_error(&e))
        }
    }
}

// ── cancel ────────────────────────────────────────────────────────────────────

pub async fn cancel(stack: Stack, run_id: Uuid) -> Result<i32> {
    if stack.store.request_cancel(run_id).await? {
        println!("cancellation requested for {}", run_id);
        Ok(0)
    } else {
        warn!(%run_id, "unknown run");
        eprintln!("run '{}' not found", run_id);
        Ok(2)
    }
}
