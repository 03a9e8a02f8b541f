//! Deployment-management client.
//!
//! [`DeploymentClient`] is the surface the update and report workflows need.
//! [`FuelCli`] implements it by driving the `fuel`/`fuel2` command-line tools
//! on the master node through [`ssh_node`], so the same code path works when
//! running on the master itself (loopback, no SSH) or from a workstation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::config::Config;
use crate::error::{Error, RemoteCommandFailedDetails, Result};
use crate::executor::CommandResult;
use crate::ssh::{ssh_node, RemoteCommand};
use crate::utils::shell;

const NO_DEPLOYMENT_INFO: &str = "no deployment info for this environment";

/// A YAML document living at `path` on the master node.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsDocument {
    pub path: PathBuf,
    pub data: serde_yml::Value,
}

impl SettingsDocument {
    pub fn new(path: impl Into<PathBuf>, data: serde_yml::Value) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub trait DeploymentClient {
    /// Current settings of environment `env`.
    fn download_settings(&self, env: u32) -> Result<SettingsDocument>;

    fn upload_settings(&self, env: u32, settings: &SettingsDocument) -> Result<()>;

    /// Per-node deployment info, or `None` if the environment has none yet.
    fn download_deployment(&self, env: u32) -> Result<Option<Vec<SettingsDocument>>>;

    fn upload_deployment(&self, env: u32, documents: &[SettingsDocument]) -> Result<()>;

    /// Start redeployment of pending changes. Returns the task id.
    fn redeploy_changes(&self, env: u32) -> Result<u64>;

    /// Finished (`ready`) history records of a task, summaries included.
    fn deployment_history(&self, task: u64) -> Result<Vec<Value>>;
}

type Executor = Arc<dyn Fn(&RemoteCommand) -> Result<CommandResult> + Send + Sync>;

/// `DeploymentClient` backed by the fuel CLI on `fuel_ip`.
#[derive(Clone)]
pub struct FuelCli {
    host: String,
    ssh_opts: Vec<String>,
    env_vars: Vec<String>,
    timeout: std::time::Duration,
    work_dir: PathBuf,
    exec: Executor,
}

impl std::fmt::Debug for FuelCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuelCli")
            .field("host", &self.host)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

impl FuelCli {
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.fuel_ip.clone(),
            ssh_opts: config.ssh_opts.clone(),
            env_vars: client_env(config),
            timeout: config.timeout(),
            work_dir: config.work_dir.clone(),
            exec: Arc::new(ssh_node),
        }
    }

    /// Replace the command runner (used to script the fuel CLI in tests).
    pub fn with_executor<F>(mut self, exec: F) -> Self
    where
        F: Fn(&RemoteCommand) -> Result<CommandResult> + Send + Sync + 'static,
    {
        self.exec = Arc::new(exec);
        self
    }

    fn command(&self, command: impl Into<String>) -> RemoteCommand {
        RemoteCommand::new(self.host.clone(), command)
            .ssh_opts(&self.ssh_opts)
            .env_vars(&self.env_vars)
            .timeout(self.timeout)
    }

    fn run(&self, spec: RemoteCommand) -> Result<CommandResult> {
        let result = (self.exec)(&spec)?;
        if !result.success() {
            return Err(Error::remote_command_failed(RemoteCommandFailedDetails {
                command: spec.command,
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
                host: spec.host,
            }));
        }
        Ok(result)
    }

    fn read_document(&self, path: &Path) -> Result<SettingsDocument> {
        let command = format!("cat {}", quote(path));
        let result = self.run(self.command(command.clone()))?;
        let data = serde_yml::from_str(&result.stdout)
            .map_err(|e| Error::deploy_unexpected_output(command, e.to_string()))?;
        Ok(SettingsDocument::new(path, data))
    }

    fn write_document(&self, document: &SettingsDocument) -> Result<()> {
        let content = serde_yml::to_string(&document.data).map_err(|e| {
            Error::internal_unexpected(format!(
                "serialize {}: {}",
                document.path.display(),
                e
            ))
        })?;
        let spec = self
            .command(format!("cat > {}", quote(&document.path)))
            .input(content.into_bytes());
        self.run(spec).map(|_| ())
    }

    fn settings_path(&self, env: u32) -> PathBuf {
        self.work_dir.join(format!("settings_{}.yaml", env))
    }

    fn deployment_dir(&self, env: u32) -> PathBuf {
        self.work_dir.join(format!("deployment_{}", env))
    }

    fn fuel(&self, args: &str) -> String {
        format!("fuel {} --dir {}", args, quote(&self.work_dir))
    }
}

impl DeploymentClient for FuelCli {
    fn download_settings(&self, env: u32) -> Result<SettingsDocument> {
        self.run(self.command(self.fuel(&format!("settings --env {} --download", env))))?;
        self.read_document(&self.settings_path(env))
    }

    fn upload_settings(&self, env: u32, settings: &SettingsDocument) -> Result<()> {
        self.write_document(settings)?;
        self.run(self.command(self.fuel(&format!("settings --env {} --upload", env))))
            .map(|_| ())
    }

    fn download_deployment(&self, env: u32) -> Result<Option<Vec<SettingsDocument>>> {
        let download = self.fuel(&format!("deployment --env {} --download --split", env));
        match self.run(self.command(download)) {
            Ok(_) => {}
            Err(err) if mentions_no_deployment_info(&err) => {
                tracing::info!(env, "environment has no deployment info");
                return Ok(None);
            }
            Err(err) => return Err(err),
        }

        let listing = self.run(self.command(format!(
            "ls -1 {}/*.yaml",
            quote(&self.deployment_dir(env))
        )))?;

        listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|path| self.read_document(Path::new(path)))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    fn upload_deployment(&self, env: u32, documents: &[SettingsDocument]) -> Result<()> {
        for document in documents {
            self.write_document(document)?;
        }
        self.run(self.command(self.fuel(&format!("deployment --env {} --upload --split", env))))
            .map(|_| ())
    }

    fn redeploy_changes(&self, env: u32) -> Result<u64> {
        let command = format!("fuel2 env redeploy {}", env);
        let result = self.run(self.command(command.clone()))?;
        parse_task_id(&result.stdout)
            .ok_or_else(|| Error::deploy_unexpected_output(command, result.stdout))
    }

    fn deployment_history(&self, task: u64) -> Result<Vec<Value>> {
        let command = format!(
            "fuel2 task history show {} --include-summary --statuses ready -f json",
            task
        );
        let result = self.run(self.command(command.clone()))?;
        serde_json::from_str(&result.stdout)
            .map_err(|e| Error::deploy_unexpected_output(command, e.to_string()))
    }
}

/// Connection and credential settings for the fuel CLI, as env assignments.
fn client_env(config: &Config) -> Vec<String> {
    let mut vars = vec![
        assign("SERVER_ADDRESS", &config.fuel_ip),
        assign("SERVER_PORT", &config.fuel_port.to_string()),
        assign("OS_USERNAME", &config.fuel_user),
        assign("OS_PASSWORD", &config.fuel_pass),
        assign("OS_TENANT_NAME", &config.fuel_tenant),
    ];
    if let Some(proxy) = &config.fuel_http_proxy {
        vars.push(assign("http_proxy", proxy));
        vars.push(assign("HTTP_PROXY", proxy));
    }
    vars.extend(config.env_vars.iter().cloned());
    vars
}

fn assign(name: &str, value: &str) -> String {
    format!("{}={}", name, shell::quote_arg(value))
}

fn quote(path: &Path) -> String {
    shell::quote_path(&path.to_string_lossy())
}

fn mentions_no_deployment_info(err: &Error) -> bool {
    ["stdout", "stderr"].iter().any(|stream| {
        err.details
            .get(stream)
            .and_then(Value::as_str)
            .is_some_and(|text| text.contains(NO_DEPLOYMENT_INFO))
    })
}

fn parse_task_id(output: &str) -> Option<u64> {
    let pattern = Regex::new(r"(?i)task\s+with\s+id\s+(\d+)|\bid\s*[:=]?\s*(\d+)").ok()?;
    let captures = pattern.captures(output)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use parking_lot::Mutex;

    type Script = Vec<(&'static str, CommandResult)>;

    fn ok(stdout: &str) -> CommandResult {
        CommandResult {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    fn failed(code: i32, stderr: &str) -> CommandResult {
        CommandResult {
            stderr: stderr.to_string(),
            exit_code: code,
            ..Default::default()
        }
    }

    /// A client whose commands are answered by the first script entry whose
    /// needle occurs in the command. Every issued command is recorded.
    fn scripted(script: Script) -> (FuelCli, Arc<Mutex<Vec<RemoteCommand>>>) {
        let issued = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&issued);
        let client = FuelCli::new(&Config::default()).with_executor(move |spec| {
            log.lock().push(spec.clone());
            Ok(script
                .iter()
                .find(|(needle, _)| spec.command.contains(needle))
                .map(|(_, result)| result.clone())
                .unwrap_or_default())
        });
        (client, issued)
    }

    #[test]
    fn credentials_travel_as_env_assignments() {
        let config = Config {
            fuel_pass: "p@ss word".to_string(),
            fuel_http_proxy: Some("http://proxy:3128".to_string()),
            ..Config::default()
        };
        let vars = client_env(&config);

        assert!(vars.contains(&"SERVER_ADDRESS=127.0.0.1".to_string()));
        assert!(vars.contains(&"SERVER_PORT=8000".to_string()));
        assert!(vars.contains(&"OS_PASSWORD='p@ss word'".to_string()));
        assert!(vars.contains(&"http_proxy=http://proxy:3128".to_string()));
        assert!(vars.contains(&"HTTP_PROXY=http://proxy:3128".to_string()));
    }

    #[test]
    fn download_settings_reads_the_downloaded_file() {
        let (client, issued) = scripted(vec![
            ("fuel settings", ok("")),
            ("cat '/root/settings_3.yaml'", ok("editable:\n  foo: 1\n")),
        ]);

        let settings = client.download_settings(3).unwrap();
        assert_eq!(settings.path, PathBuf::from("/root/settings_3.yaml"));
        assert_eq!(settings.data["editable"]["foo"], serde_yml::Value::from(1));

        let issued = issued.lock();
        assert_eq!(
            issued[0].command,
            "fuel settings --env 3 --download --dir '/root'"
        );
        assert_eq!(issued[0].host, "127.0.0.1");
    }

    #[test]
    fn upload_settings_writes_through_stdin() {
        let (client, issued) = scripted(vec![]);
        let doc = SettingsDocument::new(
            "/root/settings_3.yaml",
            serde_yml::from_str("editable: {}").unwrap(),
        );

        client.upload_settings(3, &doc).unwrap();

        let issued = issued.lock();
        assert_eq!(issued[0].command, "cat > '/root/settings_3.yaml'");
        let written = String::from_utf8(issued[0].input.clone().unwrap()).unwrap();
        assert!(written.contains("editable"));
        assert_eq!(issued[1].command, "fuel settings --env 3 --upload --dir '/root'");
    }

    #[test]
    fn missing_deployment_info_is_none() {
        let (client, _) = scripted(vec![(
            "fuel deployment",
            failed(1, "400 Client Error: no deployment info for this environment"),
        )]);
        assert_eq!(client.download_deployment(1).unwrap(), None);
    }

    #[test]
    fn deployment_documents_are_listed_and_read() {
        let (client, _) = scripted(vec![
            ("fuel deployment", ok("")),
            (
                "ls -1",
                ok("/root/deployment_1/controller_1.yaml\n/root/deployment_1/compute_2.yaml\n"),
            ),
            ("controller_1", ok("uid: '1'\n")),
            ("compute_2", ok("uid: '2'\n")),
        ]);

        let docs = client.download_deployment(1).unwrap().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].file_name(), "controller_1.yaml");
        assert_eq!(docs[1].data["uid"], serde_yml::Value::from("2"));
    }

    #[test]
    fn other_failures_propagate() {
        let (client, _) = scripted(vec![("fuel deployment", failed(2, "connection refused"))]);
        let err = client.download_deployment(1).unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
        assert_eq!(err.details["exitCode"], 2);
        assert_eq!(err.details["stderr"], "connection refused");
    }

    #[test]
    fn redeploy_returns_task_id() {
        let (client, _) = scripted(vec![(
            "fuel2 env redeploy",
            ok("Deployment task with id 42 for the environment 1 has been started.\n"),
        )]);
        assert_eq!(client.redeploy_changes(1).unwrap(), 42);
    }

    #[test]
    fn redeploy_without_task_id_is_unexpected_output() {
        let (client, _) = scripted(vec![("fuel2 env redeploy", ok("nothing to do\n"))]);
        let err = client.redeploy_changes(1).unwrap_err();
        assert_eq!(err.code, ErrorCode::DeployUnexpectedOutput);
    }

    #[test]
    fn history_is_parsed_as_json() {
        let (client, issued) = scripted(vec![(
            "task history",
            ok(r#"[{"task_name": "netconfig", "node_id": "1", "summary": {}}]"#),
        )]);
        let history = client.deployment_history(9).unwrap();
        assert_eq!(history.len(), 1);
        assert!(issued.lock()[0].command.contains("--statuses ready"));
    }

    #[test]
    fn task_id_patterns() {
        assert_eq!(parse_task_id("Deployment task with id 7 for the environment 1"), Some(7));
        assert_eq!(parse_task_id("id: 12"), Some(12));
        assert_eq!(parse_task_id("no id here"), None);
    }
}
