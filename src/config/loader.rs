//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::schema::Config;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration files were given")]
    NoFiles,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a single configuration file without validating it.
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    load_configs(&[path.to_path_buf()])
}

/// Load every file in order, merge them and validate the result.
///
/// Paths naming a directory contribute each `*.toml` file inside it, sorted
/// by name.
pub fn load_configs(paths: &[PathBuf]) -> Result<Config, ConfigError> {
    if paths.is_empty() {
        return Err(ConfigError::NoFiles);
    }

    let mut merged = Config::default();
    for path in expand_paths(paths)? {
        let config = parse_config(&path)?;
        tracing::debug!(path = %path.display(), "Loaded configuration file");
        merged = merged.merge(config);
    }

    validate_config(&merged).map_err(ConfigError::Validation)?;
    Ok(merged)
}

fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>, ConfigError> {
    let mut files = Vec::new();
    for path in paths {
        if !path.is_dir() {
            files.push(path.clone());
            continue;
        }
        let entries = fs::read_dir(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut found: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        found.sort();
        files.extend(found);
    }
    if files.is_empty() {
        return Err(ConfigError::NoFiles);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_merges_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("10-base.toml"),
            r#"
            log_level = "warn"
            [[listeners]]
            type = "tcp"
            address = "127.0.0.1:8100"
            tls_disable = true
            "#,
        )
        .unwrap();
        fs::write(dir.path().join("20-override.toml"), "log_level = \"debug\"\n").unwrap();
        fs::write(dir.path().join("README"), "ignored").unwrap();

        let config = load_configs(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.listeners.len(), 1);
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "listeners = [[[").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "unexpected error: {}", err);
    }

    #[test]
    fn test_load_reports_validation_errors_together() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        fs::write(&path, "log_level = \"info\"\n").unwrap();

        let err = load_config(&path).unwrap_err();
        match err {
            ConfigError::Validation(errors) => assert!(!errors.is_empty()),
            other => panic!("expected validation error, got {}", other),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/proxy.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
