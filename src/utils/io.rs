//! File I/O primitives with consistent error handling.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// Read file contents with standardized error handling.
///
/// Wraps `fs::read_to_string` with consistent `Error::internal_io` formatting.
pub fn read_file(path: &Path, operation: &str) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(operation.to_string())))
}

/// Write content to file with standardized error handling.
pub fn write_file(path: &Path, content: &str, operation: &str) -> Result<()> {
    fs::write(path, content)
        .map_err(|e| Error::internal_io(e.to_string(), Some(operation.to_string())))
}

fn read_config_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "Can't load file");
        Error::config_file_not_found(path.display().to_string(), e.to_string())
    })
}

/// Load and deserialize a JSON document.
///
/// Missing/unreadable files and malformed content are both exit-1 class
/// errors (`config.file_not_found`, `config.invalid_json`).
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = read_config_file(path)?;
    serde_json::from_str(&content).map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "Could not convert data");
        Error::config_invalid_json(path.display().to_string(), e.to_string())
    })
}

/// Load and deserialize a YAML document.
pub fn load_yaml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = read_config_file(path)?;
    serde_yml::from_str(&content).map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "Could not parse");
        Error::config_invalid_yaml(path.display().to_string(), e.to_string())
    })
}

/// Create `dir` and its parents if missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|e| {
        tracing::error!(path = %dir.display(), error = %e, "Can't create a directory");
        Error::internal_directory_create_failed(dir.display().to_string(), e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn read_file_returns_error_for_missing_file() {
        let err = read_file(Path::new("/nonexistent/path.txt"), "test read").unwrap_err();
        assert_eq!(err.code.as_str(), "internal.io_error");
    }

    #[test]
    fn write_then_read() {
        let temp = NamedTempFile::new().unwrap();
        write_file(temp.path(), "new content", "test write").unwrap();
        assert_eq!(read_file(temp.path(), "test read").unwrap(), "new content");
    }

    #[test]
    fn yaml_file_loads_into_typed_value() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "timeout: 30\nmaxthreads: 4").unwrap();

        let loaded: BTreeMap<String, u64> = load_yaml_file(temp.path()).unwrap();
        assert_eq!(loaded["timeout"], 30);
        assert_eq!(loaded["maxthreads"], 4);
    }

    #[test]
    fn malformed_yaml_is_reported_as_invalid_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "key: [unclosed").unwrap();

        let err = load_yaml_file::<serde_yml::Value>(temp.path()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidYaml);
    }

    #[test]
    fn missing_file_is_reported_as_not_found() {
        let err = load_yaml_file::<serde_yml::Value>(Path::new("/nonexistent/cfg.yaml"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigFileNotFound);
        assert_eq!(err.details["path"], "/nonexistent/cfg.yaml");
    }

    #[test]
    fn malformed_json_is_reported_as_invalid_json() {
        let mut temp = NamedTempFile::new().unwrap();
        write!(temp, "{{\"a\": ").unwrap();

        let err = load_json_file::<serde_json::Value>(temp.path()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidJson);
    }

    #[test]
    fn ensure_dir_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir(&nested).unwrap();
    }

    #[test]
    fn ensure_dir_fails_below_a_file() {
        let file = NamedTempFile::new().unwrap();
        let err = ensure_dir(&file.path().join("sub")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalDirectoryCreateFailed);
    }
}
