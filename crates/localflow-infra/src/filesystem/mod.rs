//! Filesystem layout for Localflow.
//!
//! ```text
//! {data_dir}/
//!   config.toml
//!   localflow.db
//!   activities/     executable scripts exposed as activities
//!   workflows/      `.flow` definitions registered by a bare `register`
//! ```

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "LOCALFLOW_DATA_DIR";

/// Default definitions directory inside the data directory.
pub const WORKFLOWS_DIR: &str = "workflows";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `LOCALFLOW_DATA_DIR` environment variable
/// 2. `~/.localflow`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".localflow");
    }

    // Last resort: current directory
    PathBuf::from(".localflow")
}

/// `{data_dir}/workflows`.
pub fn workflows_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(WORKFLOWS_DIR)
}

/// Create the data directory and its standard subdirectories.
pub async fn ensure_data_dir(data_dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(data_dir).await?;
    tokio::fs::create_dir_all(data_dir.join(crate::config::ACTIVITIES_DIR)).await?;
    tokio::fs::create_dir_all(workflows_dir(data_dir)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_ensure_data_dir_creates_layout() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("lf");

        ensure_data_dir(&data_dir).await.unwrap();
        assert!(data_dir.join("activities").is_dir());
        assert!(data_dir.join("workflows").is_dir());

        // Idempotent.
        ensure_data_dir(&data_dir).await.unwrap();
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var(DATA_DIR_ENV, "/tmp/test-localflow");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-localflow"));
        unsafe {
            std::env::remove_var(DATA_DIR_ENV);
        }
    }
}
