// src/config/loader.rs

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;
use crate::fs::{FileSystem, RealFileSystem};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "Tickdag.toml";

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation (DAG correctness, etc.). Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    load_with_fs(&RealFileSystem, path.as_ref())
}

/// [`load_from_path`] through an explicit filesystem.
pub fn load_with_fs(fs: &dyn FileSystem, path: &Path) -> Result<RawConfigFile> {
    let contents = fs
        .read_to_string(path)
        .with_context(|| format!("loading config {}", path.display()))?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and validate it.
///
/// - Reads TOML.
/// - Applies defaults (`[default]` retry policy, `[engine]` settings).
/// - Parses durations and checks schedules, unknown or self `after`
///   references and DAG cycles.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// `Tickdag.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TickdagError;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn missing_file_reports_the_path() {
        let fs = MockFileSystem::new();
        let err = load_with_fs(&fs, Path::new("/etc/tickdag/Tickdag.toml")).unwrap_err();
        assert!(matches!(err, TickdagError::Other(_)));
        assert!(err.to_string().contains("/etc/tickdag/Tickdag.toml"));
    }

    #[test]
    fn reads_raw_config_through_the_filesystem() {
        let fs = MockFileSystem::new();
        fs.add_file(
            "/cfg/Tickdag.toml",
            r#"
[dag.nightly]
start = "2024-01-01T00:00:00Z"
interval = "1d"
catchup = false

[dag.nightly.task.backup]
cmd = "tar czf backup.tgz data"
"#,
        );

        let raw = load_with_fs(&fs, Path::new("/cfg/Tickdag.toml")).unwrap();
        assert!(!raw.dag["nightly"].catchup);
        assert_eq!(raw.dag["nightly"].task["backup"].after.len(), 0);
    }
}
