//! Poll mode: pull staged deployments from a registry endpoint.
//!
//! A target-mode process with polling configured periodically queries
//! `<url>/catalogs/registry` for catalogs labeled `staged_target=<name>`,
//! reconciles each catalog's embedded `deployment`, observes the result, and
//! reports the observed components back under `"<instance>-<target>"`.

use std::collections::BTreeMap;

use maestro_core::{Result, StatusError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::manager::SolutionManager;
use crate::model::DeploymentSpec;

/// Poll-mode configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollConfig {
    /// Base URL of the registry endpoint.
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

/// A staged catalog as returned by the registry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Catalog {
    pub metadata: CatalogMetadata,
    pub spec: CatalogSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogMetadata {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogSpec {
    pub properties: BTreeMap<String, Value>,
}

/// Whether poll mode is active for this manager.
pub fn enabled(manager: &SolutionManager) -> bool {
    manager.config().is_target && manager.config().poll.as_ref().is_some_and(|p| !p.url.is_empty())
}

/// Runs one poll pass over every configured target name.
///
/// Stops at the first error, mirroring the at-least-once posture: a failed
/// pass leaves the staged catalog in place for the next one.
pub async fn poll(manager: &SolutionManager) -> Vec<StatusError> {
    if !enabled(manager) {
        return Vec::new();
    }
    let Some(config) = manager.config().poll.clone() else {
        return Vec::new();
    };

    let client = reqwest::Client::new();
    for target in manager.config().target_names.clone() {
        if let Err(err) = poll_target(manager, &client, &config, &target).await {
            warn!(error = %err, target = %target, "poll pass failed");
            return vec![err];
        }
    }
    Vec::new()
}

async fn poll_target(
    manager: &SolutionManager,
    client: &reqwest::Client,
    config: &PollConfig,
    target: &str,
) -> Result<()> {
    let url = format!("{}/catalogs/registry", config.url);
    let filter = format!("staged_target={}", target);

    let response = client
        .get(&url)
        .basic_auth(&config.user, Some(&config.password))
        .query(&[("filterType", "label"), ("filterValue", filter.as_str())])
        .send()
        .await
        .map_err(|e| StatusError::with_source(maestro_core::Status::InternalError, "failed to query staged catalogs", e))?;
    if !response.status().is_success() {
        return Err(StatusError::internal(format!(
            "staged catalog query returned {}",
            response.status()
        )));
    }

    let catalogs: Vec<Catalog> = response
        .json()
        .await
        .map_err(|e| StatusError::with_source(maestro_core::Status::InternalError, "failed to decode staged catalogs", e))?;

    info!(target = %target, catalogs = catalogs.len(), "poll pass");

    for catalog in catalogs {
        let Some(embedded) = catalog.spec.properties.get("deployment") else {
            continue;
        };
        let deployment: DeploymentSpec = serde_json::from_value(embedded.clone()).map_err(|e| {
            StatusError::with_source(maestro_core::Status::InternalError, "failed to decode staged deployment", e)
        })?;

        manager
            .reconcile(deployment.clone(), false, &catalog.metadata.namespace, target)
            .await?;
        let (_, components) = manager.get(&deployment, target).await?;

        let report_url = format!(
            "{}/catalogs/registry/{}-{}",
            config.url, deployment.instance.name, target
        );
        client
            .post(&report_url)
            .basic_auth(&config.user, Some(&config.password))
            .json(&components)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                StatusError::with_source(maestro_core::Status::InternalError, "failed to report observed components", e)
            })?;
    }
    Ok(())
}
