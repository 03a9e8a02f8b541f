use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigFileNotFound,
    ConfigInvalidYaml,
    ConfigInvalidJson,
    ConfigInvalidValue,
    ConfigMissingKey,

    ValidationMissingArgument,
    ValidationInvalidArgument,

    CommandSpawnFailed,
    RemoteCommandFailed,

    DeployUnexpectedOutput,

    BatchWorkerFailed,
    BatchInterrupted,

    InternalIoError,
    InternalDirectoryCreateFailed,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigFileNotFound => "config.file_not_found",
            ErrorCode::ConfigInvalidYaml => "config.invalid_yaml",
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",
            ErrorCode::ConfigMissingKey => "config.missing_key",

            ErrorCode::ValidationMissingArgument => "validation.missing_argument",
            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::CommandSpawnFailed => "command.spawn_failed",
            ErrorCode::RemoteCommandFailed => "remote.command_failed",

            ErrorCode::DeployUnexpectedOutput => "deploy.unexpected_output",

            ErrorCode::BatchWorkerFailed => "batch.worker_failed",
            ErrorCode::BatchInterrupted => "batch.interrupted",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalDirectoryCreateFailed => "internal.directory_create_failed",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFileDetails {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingArgumentDetails {
    pub args: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub host: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWorkerFailedDetails {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub kind: String,
    pub message: String,
    pub terminated: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn config_file_not_found(path: impl Into<String>, error: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            ErrorCode::ConfigFileNotFound,
            format!("Cannot read file: {}", path),
            to_details(ConfigFileDetails {
                path,
                error: error.into(),
            }),
        )
    }

    pub fn config_invalid_yaml(path: impl Into<String>, error: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            ErrorCode::ConfigInvalidYaml,
            format!("Could not parse {}", path),
            to_details(ConfigFileDetails {
                path,
                error: error.into(),
            }),
        )
    }

    pub fn config_invalid_json(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Could not convert data",
            to_details(ConfigFileDetails {
                path: path.into(),
                error: error.into(),
            }),
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidValue,
            "Invalid configuration value",
            to_details(ConfigInvalidValueDetails {
                key: key.into(),
                value,
                problem: problem.into(),
            }),
        )
    }

    pub fn config_missing_key(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(
            ErrorCode::ConfigMissingKey,
            format!("Option with name {} is not configured", key),
            serde_json::json!({ "key": key }),
        )
    }

    pub fn validation_missing_argument(args: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ValidationMissingArgument,
            "Missing required argument",
            to_details(MissingArgumentDetails { args }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let problem = problem.into();
        Self::new(
            ErrorCode::ValidationInvalidArgument,
            format!("Invalid argument: {}", problem),
            to_details(InvalidArgumentDetails {
                field: field.into(),
                problem,
                id,
                tried,
            }),
        )
    }

    pub fn command_spawn_failed(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::CommandSpawnFailed,
            "Failed to spawn command",
            serde_json::json!({ "command": command.into(), "error": error.into() }),
        )
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        Self::new(
            ErrorCode::RemoteCommandFailed,
            "Remote command failed",
            to_details(details),
        )
    }

    pub fn deploy_unexpected_output(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::DeployUnexpectedOutput,
            "Unexpected output from deployment client",
            serde_json::json!({ "command": command.into(), "output": output.into() }),
        )
    }

    pub fn batch_worker_failed(details: BatchWorkerFailedDetails) -> Self {
        let message = format!("{}: {}", details.kind, details.message);
        Self::new(ErrorCode::BatchWorkerFailed, message, to_details(details))
    }

    pub fn batch_interrupted(terminated: usize) -> Self {
        Self::new(
            ErrorCode::BatchInterrupted,
            "Interrupted, exiting.",
            serde_json::json!({ "terminated": terminated }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalIoError,
            "IO error",
            to_details(InternalIoErrorDetails {
                error: error.into(),
                context,
            }),
        )
    }

    pub fn internal_directory_create_failed(
        path: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let path = path.into();
        Self::new(
            ErrorCode::InternalDirectoryCreateFailed,
            format!("Can't create a directory: {}", path),
            serde_json::json!({ "path": path, "error": error.into() }),
        )
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalJsonError,
            "JSON error",
            to_details(InternalIoErrorDetails {
                error: error.into(),
                context,
            }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }
}
