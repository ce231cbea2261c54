use std::io::Write;

use fleetfw_domain::{InstallUpon, PlanUpdateMode};

fn write_temp(content: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(content.as_bytes()).unwrap();
    f
}

#[test]
fn plan_round_trip() {
    let f = write_temp(
        r#"
id: q3-bios-refresh
name: Q3 BIOS refresh
policy:
  update_mode: SPECIFIC_URL
  install_upon: OnReset
  maintenance_timeout_minutes: 45
targets:
  - 10.0.0.10
  - 10.0.0.11
artifacts:
  - component: BIOS
    image_uri: https://fw.example/bios-2.20.exe
    version: "2.20"
"#,
    );

    let plan = fleetfw_config::load_plan(f.path()).unwrap();
    assert_eq!(plan.id.as_str(), "q3-bios-refresh");
    assert_eq!(plan.policy.update_mode, PlanUpdateMode::SpecificUrl);
    assert_eq!(plan.policy.install_upon, Some(InstallUpon::OnReset));
    assert_eq!(plan.policy.maintenance_timeout_minutes, Some(45));
    assert_eq!(plan.targets.len(), 2);
    assert_eq!(plan.artifacts[0].component, "BIOS");
}

#[test]
fn unknown_update_mode_is_rejected() {
    let f = write_temp(
        r#"
id: bad
policy:
  update_mode: YOLO_MODE
targets: [10.0.0.10]
"#,
    );
    let err = fleetfw_config::load_plan(f.path()).unwrap_err();
    assert!(err.to_string().contains("YOLO_MODE"));
}

#[test]
fn specific_url_requires_artifacts() {
    let f = write_temp(
        r#"
id: empty
policy:
  update_mode: SPECIFIC_URL
targets: [10.0.0.10]
"#,
    );
    assert!(fleetfw_config::load_plan(f.path()).is_err());
}

#[test]
fn hosts_file_loads_sorted_without_generation() {
    let f = write_temp(
        r#"
hosts:
  esx-02:
    management_endpoint: 10.0.0.11
    hypervisor_ref: vc-01
    host_ref: host-1002
  esx-01:
    management_endpoint: 10.0.0.10
    model: PowerEdge R740
"#,
    );
    let hosts = fleetfw_config::load_hosts(f.path()).unwrap();
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[0].id.as_str(), "esx-01");
    assert!(hosts[0].generation.is_none());
    assert_eq!(hosts[1].hypervisor_ref.as_deref(), Some("vc-01"));
}

#[test]
fn defaults_when_no_config_file() {
    let config = fleetfw_config::load_config(None).unwrap();
    assert_eq!(config.worker_count, 5);
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.catalog_url, fleetfw_config::DEFAULT_CATALOG_URL);
    assert!(config.tls.reject_unauthorized);
    assert_eq!(config.timeouts.http.as_secs(), 30);
    assert_eq!(config.timeouts.task.as_secs(), 90 * 60);
}

#[test]
fn config_file_overrides_defaults() {
    let f = write_temp(
        r#"
worker_count: 2
catalog_url: https://mirror.internal/catalog.xml.gz
tls:
  reject_unauthorized: false
timeouts:
  task_minutes: 120
"#,
    );
    let config = fleetfw_config::load_config(Some(f.path())).unwrap();
    assert_eq!(config.worker_count, 2);
    assert_eq!(config.catalog_url, "https://mirror.internal/catalog.xml.gz");
    assert!(!config.tls.reject_unauthorized);
    assert_eq!(config.timeouts.task.as_secs(), 120 * 60);
    // untouched fields keep defaults
    assert_eq!(config.max_attempts, 3);
}

#[test]
fn zero_workers_is_invalid() {
    let f = write_temp("worker_count: 0\n");
    assert!(fleetfw_config::load_config(Some(f.path())).is_err());
}
