use std::env;
use std::path::PathBuf;

/// Prefix shared by every lock file this tool creates.
pub const LOCK_NAMESPACE: &str = "mupdate";

/// Shared temporary directory (honours `TMPDIR`).
pub fn tmp_dir() -> PathBuf {
    env::temp_dir()
}

/// Lock file for a named operation: `<tmp>/mupdate_<operation>.lock`
pub fn lock_file(operation: &str) -> PathBuf {
    tmp_dir().join(format!("{}_{}.lock", LOCK_NAMESPACE, operation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_uses_namespace_and_operation() {
        let path = lock_file("update");
        assert_eq!(path.parent(), Some(tmp_dir().as_path()));
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("mupdate_update.lock")
        );
    }
}
