//! Maintenance update of an environment.
//!
//! The update is requested by adding a `mu_upgrade` block to the
//! environment's settings (or, once the environment has been deployed, to
//! every per-node deployment document) and then redeploying pending changes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;
use serde_yml::Value;

use crate::client::{DeploymentClient, SettingsDocument};
use crate::error::{Error, Result};
use crate::lock;
use crate::utils::io;

pub const DEFAULT_REPOS: &str = "mos, mos-updates, mos-security, mos-holdback";

const UPGRADE_KEY: &str = "mu_upgrade";
const EDITABLE_KEY: &str = "editable";

pub fn default_repos() -> Vec<String> {
    DEFAULT_REPOS.split(", ").map(str::to_string).collect()
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub repos: Vec<String>,
    pub restart_rabbit: bool,
    pub restart_mysql: bool,
    /// Without this only validation runs.
    pub install: bool,
    /// Local directory receiving a copy of every document before patching.
    pub backup_dir: Option<PathBuf>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            repos: default_repos(),
            restart_rabbit: false,
            restart_mysql: false,
            install: false,
            backup_dir: None,
        }
    }
}

impl UpdateOptions {
    /// Repository list as stored in the upgrade block.
    pub fn repos_value(&self) -> String {
        if self.repos.is_empty() {
            DEFAULT_REPOS.to_string()
        } else {
            self.repos.join(", ")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateTarget {
    Settings,
    Deployment,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateReport {
    pub env: u32,
    pub repos: String,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<UpdateTarget>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<u64>,
}

fn repo_names(settings: &Value) -> Option<BTreeSet<String>> {
    let repos = settings
        .get(EDITABLE_KEY)?
        .get("repo_setup")?
        .get("repos")?
        .get("value")?
        .as_sequence()?;
    Some(
        repos
            .iter()
            .filter_map(|repo| repo.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
    )
}

/// Every requested repository must be configured for the environment.
pub fn validate_repo_list(settings: &Value, repos: &[String]) -> Result<()> {
    let valid = repo_names(settings).ok_or_else(|| {
        Error::deploy_unexpected_output(
            "download settings",
            "settings have no editable.repo_setup.repos.value list",
        )
    })?;

    let unknown: Vec<&String> = repos.iter().filter(|repo| !valid.contains(*repo)).collect();
    if unknown.is_empty() {
        return Ok(());
    }

    let valid: Vec<String> = valid.into_iter().collect();
    Err(Error::validation_invalid_argument(
        "repos",
        format!(
            "Invalid repository list: {}, valid repositories are: {}",
            repos.join(", "),
            valid.join(", ")
        ),
        None,
        Some(valid),
    ))
}

fn upgrade_block(options: &UpdateOptions, deployment_info: bool) -> Result<Value> {
    let metadata = json!({
        "label": "Maintenance update",
        "weight": 65,
        "group": "general",
    });
    let repos = options.repos_value();

    let block = if deployment_info {
        json!({
            "enabled": true,
            "metadata": metadata,
            "repos": repos,
            "restart_rabbit": options.restart_rabbit,
            "restart_mysql": options.restart_mysql,
        })
    } else {
        json!({
            "metadata": metadata,
            "repos": {
                "value": repos,
                "type": "text",
                "label": "Repos for upgrade",
                "description": "The list of repositories to be used for cluster maintenance upgrade",
            },
            "restart_rabbit": { "value": options.restart_rabbit, "type": "hidden" },
            "restart_mysql": { "value": options.restart_mysql, "type": "hidden" },
            "enabled": { "value": true, "type": "hidden" },
        })
    };

    serde_yml::to_value(block).map_err(|e| Error::internal_unexpected(e.to_string()))
}

/// Add (or replace) the upgrade block in `doc`.
///
/// The block goes into the `editable` mapping when the document has one,
/// otherwise at the top level.
pub fn apply_upgrade(doc: &mut Value, options: &UpdateOptions, deployment_info: bool) -> Result<()> {
    let block = upgrade_block(options, deployment_info)?;

    let root = doc.as_mapping_mut().ok_or_else(|| {
        Error::deploy_unexpected_output("apply upgrade", "document is not a mapping")
    })?;

    if let Some(Value::Mapping(editable)) = root.get_mut(EDITABLE_KEY) {
        editable.insert(Value::from(UPGRADE_KEY), block);
        return Ok(());
    }
    root.insert(Value::from(UPGRADE_KEY), block);
    Ok(())
}

fn backup(dir: &Path, documents: &[&SettingsDocument]) -> Result<()> {
    io::ensure_dir(dir)?;
    for document in documents {
        let content = serde_yml::to_string(&document.data)
            .map_err(|e| Error::internal_unexpected(e.to_string()))?;
        let path = dir.join(document.file_name());
        io::write_file(&path, &content, "write backup")?;
        tracing::debug!(path = %path.display(), "backup written");
    }
    Ok(())
}

/// Validate the request and, with `options.install`, patch and redeploy.
pub fn prepare_update(
    client: &dyn DeploymentClient,
    env: u32,
    options: &UpdateOptions,
) -> Result<UpdateReport> {
    let mut settings = client.download_settings(env)?;
    validate_repo_list(&settings.data, &options.repos)?;

    let mut report = UpdateReport {
        env,
        repos: options.repos_value(),
        installed: false,
        target: None,
        documents: Vec::new(),
        task_id: None,
    };
    if !options.install {
        return Ok(report);
    }

    match client.download_deployment(env)? {
        None => {
            if let Some(dir) = &options.backup_dir {
                backup(dir, &[&settings])?;
            }
            apply_upgrade(&mut settings.data, options, false)?;
            client.upload_settings(env, &settings)?;
            report.target = Some(UpdateTarget::Settings);
            report.documents.push(settings.path.display().to_string());
        }
        Some(mut documents) => {
            if let Some(dir) = &options.backup_dir {
                backup(dir, &documents.iter().collect::<Vec<_>>())?;
            }
            for document in &mut documents {
                apply_upgrade(&mut document.data, options, true)?;
            }
            client.upload_deployment(env, &documents)?;
            report.target = Some(UpdateTarget::Deployment);
            report.documents = documents
                .iter()
                .map(|doc| doc.path.display().to_string())
                .collect();
        }
    }

    let task_id = client.redeploy_changes(env)?;
    tracing::info!(
        "Successfully prepared and started updates on cluster {0} as task {1}. \
         Check the status of the updates deployment procedure by running \
         `fuel2 task show {1}` or using Web UI.",
        env,
        task_id
    );
    crate::log_status!("update", "Started updates on cluster {} as task {}", env, task_id);

    report.installed = true;
    report.task_id = Some(task_id);
    Ok(report)
}

/// [`prepare_update`] guarded by the `update` lock. `Ok(None)` means
/// another update is already running.
pub fn install_updates(
    client: &dyn DeploymentClient,
    env: u32,
    options: &UpdateOptions,
) -> Result<Option<UpdateReport>> {
    lock::run_with_lock("update", || {
        prepare_update(client, env, options).map_err(|err| {
            tracing::error!(env, error = %err, details = %err.details, "Fail to install updates for environment {}", env);
            err
        })
    })
}
