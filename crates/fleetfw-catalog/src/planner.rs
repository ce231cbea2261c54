use std::path::{Path, PathBuf};

use fleetfw_domain::{CatalogEntry, Generation, UpdateArtifact};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{find_latest, CatalogCache};
use crate::compat::{sort_update_order, validate_compatibility};
use crate::error::CatalogError;

// ── Inputs and outputs ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub generation: Generation,
    pub model: Option<String>,
    /// Requested component types, in any order.
    pub components: Vec<String>,
    /// Override for the configured catalog URL.
    pub catalog_url: Option<String>,
    /// Local mirror: `<path>/<basename(url)>` replaces the remote URL when
    /// the file exists.
    pub custom_repository_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedArtifact {
    pub component: String,
    pub image_uri: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incompatibility {
    pub component: String,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwarePlan {
    /// Artifacts in canonical apply order.
    pub artifacts: Vec<PlannedArtifact>,
    /// Components that were requested but could not be planned.
    pub skipped: Vec<Incompatibility>,
}

// ── Planner ───────────────────────────────────────────────────────────────────

/// Turns (generation, model, requested components) into an ordered artifact
/// list backed by the freshest catalog entries.
pub struct FirmwarePlanner {
    cache: CatalogCache,
    default_catalog_url: String,
}

impl FirmwarePlanner {
    pub fn new(cache: CatalogCache, default_catalog_url: impl Into<String>) -> Self {
        FirmwarePlanner {
            cache,
            default_catalog_url: default_catalog_url.into(),
        }
    }

    pub async fn plan(&self, req: &PlanRequest) -> Result<FirmwarePlan, CatalogError> {
        check_unique_components(&req.components)?;

        let catalog_url = req
            .catalog_url
            .as_deref()
            .unwrap_or(&self.default_catalog_url);
        let entries = self.cache.get(catalog_url).await?;

        let ordered = sort_update_order(&req.components);
        let mut artifacts: Vec<PlannedArtifact> = Vec::new();
        let mut skipped: Vec<Incompatibility> = Vec::new();
        let mut applied: Vec<String> = Vec::new();

        for component in &ordered {
            let compat = validate_compatibility(component, req.generation, &applied);
            if !compat.supported {
                warn!(%component, reasons = ?compat.reasons, "component skipped as incompatible");
                skipped.push(Incompatibility {
                    component: component.clone(),
                    reasons: compat.reasons,
                });
                continue;
            }

            let Some(entry) = find_latest(&entries, component, req.model.as_deref()) else {
                skipped.push(Incompatibility {
                    component: component.clone(),
                    reasons: vec![format!(
                        "no catalog entry for {} (model {})",
                        component,
                        req.model.as_deref().unwrap_or("any")
                    )],
                });
                continue;
            };

            let image_uri = rewrite_for_local_repo(entry, req.custom_repository_path.as_deref());
            debug!(%component, version = %entry.version, %image_uri, "component planned");
            artifacts.push(PlannedArtifact {
                component: component.clone(),
                image_uri,
                version: Some(entry.version.clone()),
            });
            applied.push(component.clone());
        }

        if artifacts.is_empty() {
            return Err(CatalogError::NoCompatibleFirmware {
                incompatibilities: skipped,
            });
        }

        Ok(FirmwarePlan { artifacts, skipped })
    }
}

/// When a local mirror holds the catalog file, point the artifact at it.
fn rewrite_for_local_repo(entry: &CatalogEntry, repo: Option<&Path>) -> String {
    let Some(repo) = repo else {
        return entry.url.clone();
    };
    let Some(basename) = entry.url.rsplit('/').next().filter(|b| !b.is_empty()) else {
        return entry.url.clone();
    };
    let local = repo.join(basename);
    if local.is_file() {
        format!("file://{}", local.display())
    } else {
        entry.url.clone()
    }
}

/// Reject duplicate component names unless every duplicate carries an
/// explicit sequence.
pub fn check_artifact_sequence(artifacts: &[UpdateArtifact]) -> Result<(), CatalogError> {
    for (i, a) in artifacts.iter().enumerate() {
        let dup = artifacts
            .iter()
            .enumerate()
            .any(|(j, b)| i != j && a.component.eq_ignore_ascii_case(&b.component));
        if dup && a.sequence.is_none() {
            return Err(CatalogError::DuplicateComponent(a.component.clone()));
        }
    }
    Ok(())
}

fn check_unique_components(components: &[String]) -> Result<(), CatalogError> {
    for (i, a) in components.iter().enumerate() {
        if components[..i].iter().any(|b| a.eq_ignore_ascii_case(b)) {
            return Err(CatalogError::DuplicateComponent(a.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CATALOG: &str = r#"<Manifest>
        <SoftwareComponent ComponentType="BIOS" version="2.20" path="bios-2.20.exe" releaseDate="2023-07-07"/>
        <SoftwareComponent ComponentType="iDRAC" version="7.10.30.00" path="idrac-7.10.exe" releaseDate="2023-06-01"/>
        <SoftwareComponent ComponentType="LifecycleController" version="3.0" path="lc.exe" releaseDate="2020-01-01"/>
    </Manifest>"#;

    async fn planner_with(body: &str) -> (MockServer, FirmwarePlanner) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Catalog.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(&server)
            .await;
        let cache = CatalogCache::new(reqwest::Client::new(), Duration::from_secs(60));
        let url = format!("{}/Catalog.xml", server.uri());
        (server, FirmwarePlanner::new(cache, url))
    }

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn plans_in_canonical_order() {
        let (_server, planner) = planner_with(CATALOG).await;
        let plan = planner
            .plan(&PlanRequest {
                generation: Generation::G14,
                model: None,
                components: strs(&["iDRAC", "BIOS"]),
                catalog_url: None,
                custom_repository_path: None,
            })
            .await
            .unwrap();
        let order: Vec<&str> = plan.artifacts.iter().map(|a| a.component.as_str()).collect();
        assert_eq!(order, vec!["BIOS", "iDRAC"]);
        assert_eq!(plan.artifacts[0].version.as_deref(), Some("2.20"));
        assert!(plan.skipped.is_empty());
    }

    #[tokio::test]
    async fn incompatible_components_are_skipped_not_fatal() {
        let (_server, planner) = planner_with(CATALOG).await;
        // LifecycleController is gone from 14G; BIOS still plans.
        let plan = planner
            .plan(&PlanRequest {
                generation: Generation::G14,
                model: None,
                components: strs(&["LifecycleController", "BIOS"]),
                catalog_url: None,
                custom_repository_path: None,
            })
            .await
            .unwrap();
        assert_eq!(plan.artifacts.len(), 1);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].component, "LifecycleController");
    }

    #[tokio::test]
    async fn empty_plan_raises_no_compatible_firmware() {
        let (_server, planner) = planner_with(CATALOG).await;
        let err = planner
            .plan(&PlanRequest {
                generation: Generation::G14,
                model: None,
                components: strs(&["LifecycleController"]),
                catalog_url: None,
                custom_repository_path: None,
            })
            .await
            .unwrap_err();
        match err {
            CatalogError::NoCompatibleFirmware { incompatibilities } => {
                assert_eq!(incompatibilities.len(), 1);
            }
            other => panic!("expected NoCompatibleFirmware, got {other}"),
        }
    }

    #[tokio::test]
    async fn missing_catalog_entry_is_recorded() {
        let (_server, planner) = planner_with(CATALOG).await;
        let plan = planner
            .plan(&PlanRequest {
                generation: Generation::G14,
                model: None,
                components: strs(&["BIOS", "NIC"]),
                catalog_url: None,
                custom_repository_path: None,
            })
            .await
            .unwrap();
        assert_eq!(plan.artifacts.len(), 1);
        assert!(plan.skipped[0].reasons[0].contains("no catalog entry"));
    }

    #[tokio::test]
    async fn local_repository_rewrites_uri() {
        let (_server, planner) = planner_with(CATALOG).await;
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("bios-2.20.exe"), b"image").unwrap();

        let plan = planner
            .plan(&PlanRequest {
                generation: Generation::G14,
                model: None,
                components: strs(&["BIOS", "iDRAC"]),
                catalog_url: None,
                custom_repository_path: Some(repo.path().to_path_buf()),
            })
            .await
            .unwrap();
        // bios exists locally, idrac does not
        assert!(plan.artifacts[0].image_uri.starts_with("file://"));
        assert!(plan.artifacts[1].image_uri.starts_with("http"));
    }

    #[tokio::test]
    async fn duplicate_components_rejected() {
        let (_server, planner) = planner_with(CATALOG).await;
        let err = planner
            .plan(&PlanRequest {
                generation: Generation::G14,
                model: None,
                components: strs(&["BIOS", "bios"]),
                catalog_url: None,
                custom_repository_path: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateComponent(_)));
    }

    #[test]
    fn sequenced_duplicates_are_allowed() {
        use fleetfw_domain::UpdateArtifact;
        let dup = |seq: Option<u32>| UpdateArtifact {
            component: "NIC".into(),
            image_uri: "https://fw.example/nic.exe".into(),
            version: None,
            checksum: None,
            sequence: seq,
        };
        assert!(check_artifact_sequence(&[dup(Some(1)), dup(Some(2))]).is_ok());
        assert!(check_artifact_sequence(&[dup(None), dup(Some(2))]).is_err());
        assert!(check_artifact_sequence(&[dup(None)]).is_ok());
    }
}
