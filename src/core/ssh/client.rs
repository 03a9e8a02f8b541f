use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::executor::{launch_cmd_redacted, ChildTracker, CommandResult};
use crate::utils::shell;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// A command to run on one host, locally or over SSH.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub host: String,
    pub command: String,
    pub ssh_opts: Vec<String>,
    pub env_vars: Vec<String>,
    pub timeout: Duration,
    /// Local script streamed into `bash -s`; wins over `command` and any input.
    pub script: Option<PathBuf>,
    /// Local file redirected to the command's stdin; wins over `input`.
    pub input_file: Option<PathBuf>,
    /// File (on the target) receiving the command's stdout.
    pub output_file: Option<PathBuf>,
    pub input: Option<Vec<u8>>,
    pub prefix: Option<String>,
}

/// The assembled shell line plus the stdin bytes that go with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
    pub command: String,
    /// `command` with credential env values masked, for logs and errors.
    pub display: String,
    pub input: Option<Vec<u8>>,
    pub via_ssh: bool,
}

impl RemoteCommand {
    pub fn new(host: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            command: command.into(),
            ssh_opts: Vec::new(),
            env_vars: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            script: None,
            input_file: None,
            output_file: None,
            input: None,
            prefix: None,
        }
    }

    pub fn ssh_opts(mut self, opts: &[String]) -> Self {
        self.ssh_opts = opts.to_vec();
        self
    }

    pub fn env_vars(mut self, vars: &[String]) -> Self {
        self.env_vars = vars.to_vec();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn script(mut self, path: impl Into<PathBuf>) -> Self {
        self.script = Some(path.into());
        self
    }

    pub fn input_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_file = Some(path.into());
        self
    }

    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn input(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.input = Some(bytes.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

/// Check if a host address refers to the local machine.
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1") || host.starts_with("127.")
}

fn quote_file(path: &Path) -> String {
    shell::quote_path(&path.to_string_lossy())
}

fn format_timeout(timeout: Duration) -> String {
    format!("{}", timeout.as_secs_f64())
}

/// Assemble the full shell line for `spec` without running it.
pub fn build_command(spec: &RemoteCommand) -> BuiltCommand {
    let ssh_opts = spec.ssh_opts.join(" ");
    let env_vars = spec.env_vars.join(" ");
    let prefix = spec.prefix.as_deref().unwrap_or("");
    let timeout = format_timeout(spec.timeout);
    let via_ssh = !is_local_host(&spec.host);

    let base = if via_ssh {
        tracing::info!(host = %spec.host, "exec ssh");
        format!(
            "timeout '{}' ssh -t -T {} {} {} ",
            timeout,
            ssh_opts,
            shell::quote_path(&spec.host),
            shell::quote_path(&env_vars)
        )
    } else {
        tracing::info!(host = %spec.host, "skip ssh");
        format!("{} timeout '{}' bash -c ", env_vars, timeout)
    };

    let mut input = spec.input.clone();
    let mut cmd = match &spec.script {
        Some(script) => {
            input = None;
            let cmd = format!(
                "{}{} < {}",
                base,
                shell::quote_path(&format!("{} bash -s", prefix)),
                quote_file(script)
            );
            tracing::info!(
                command = %shell::redact_assignments(&cmd, &spec.env_vars),
                "inputfile selected"
            );
            cmd
        }
        None => {
            let mut cmd = format!(
                "{} {}",
                base,
                shell::quote_arg(&format!("{} {}", prefix, spec.command))
            );
            if let Some(input_file) = &spec.input_file {
                input = None;
                cmd = format!("{} < {}", cmd, quote_file(input_file));
            }
            cmd
        }
    };

    if let Some(output_file) = &spec.output_file {
        cmd = format!("{} > {}", cmd, quote_file(output_file));
    }

    let command = wrap_binary_safe(&cmd);
    BuiltCommand {
        display: shell::redact_assignments(&command, &spec.env_vars),
        command,
        input,
        via_ssh,
    }
}

/// Hex-encode stdin before it crosses shell/SSH layers and decode it just in
/// front of the payload. SIGTERM/SIGINT delivered to the wrapping shell are
/// forwarded to the payload.
fn wrap_binary_safe(cmd: &str) -> String {
    format!(
        "input=\"$(cat | xxd -p)\"; trap 'kill $pid' 15; trap 'kill $pid' 2; \
         echo -n \"$input\" | xxd -r -p | {} &:; pid=$!; wait $!",
        cmd
    )
}

/// Run a command on `spec.host`, locally for loopback hosts, otherwise over SSH.
pub fn ssh_node(spec: &RemoteCommand) -> Result<CommandResult> {
    ssh_node_tracked(spec, None)
}

pub fn ssh_node_tracked(spec: &RemoteCommand, tracker: Option<&ChildTracker>) -> Result<CommandResult> {
    let built = build_command(spec);
    launch_cmd_redacted(
        &built.command,
        &built.display,
        spec.timeout,
        built.input.as_deref(),
        tracker,
    )
}
