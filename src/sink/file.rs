//! File sink: writes the token atomically to a path on disk.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::config::SinkConfig;
use crate::sink::{Sink, SinkError};

const DEFAULT_MODE: u32 = 0o640;

pub struct FileSink {
    path: PathBuf,
    mode: u32,
    remove_on_exit: bool,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: DEFAULT_MODE,
            remove_on_exit: false,
        }
    }

    pub fn from_config(config: &SinkConfig) -> Result<Self, SinkError> {
        let path = config
            .config
            .get("path")
            .and_then(|v| v.as_str())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SinkError::InvalidConfig("'path' must be specified".to_string()))?;

        let mode = match config.config.get("mode") {
            None => DEFAULT_MODE,
            Some(toml::Value::Integer(mode)) => u32::try_from(*mode)
                .map_err(|_| SinkError::InvalidConfig(format!("invalid file mode {}", mode)))?,
            Some(toml::Value::String(mode)) => u32::from_str_radix(mode.trim_start_matches("0o"), 8)
                .map_err(|_| SinkError::InvalidConfig(format!("invalid file mode {:?}", mode)))?,
            Some(other) => {
                return Err(SinkError::InvalidConfig(format!("invalid file mode {}", other)));
            }
        };

        let remove_on_exit = config
            .config
            .get("remove_on_exit")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(Self {
            path: PathBuf::from(path),
            mode,
            remove_on_exit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "token".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn write_token(&self, token: &str) -> Result<(), SinkError> {
        let temp = self.temp_path();
        tokio::fs::write(&temp, token.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(self.mode);
            if let Err(e) = tokio::fs::set_permissions(&temp, permissions).await {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(self.io_error(e));
            }
        }

        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(self.io_error(e));
        }

        tracing::debug!(path = %self.path.display(), "Token written to file sink");
        Ok(())
    }

    async fn close(&self) {
        if !self.remove_on_exit {
            return;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed token file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove token file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let sink = FileSink::new(&path);

        sink.write_token("s.first").await.unwrap();
        sink.write_token("s.second").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "s.second");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1, "temporary files must not remain");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mode_applied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let mut config = SinkConfig::file(&path);
        config.config.insert("mode".into(), toml::Value::Integer(0o600));
        let sink = FileSink::from_config(&config).unwrap();

        sink.write_token("s.token").await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_remove_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let mut config = SinkConfig::file(&path);
        config.config.insert("remove_on_exit".into(), toml::Value::Boolean(true));
        let sink = FileSink::from_config(&config).unwrap();

        sink.write_token("s.token").await.unwrap();
        sink.close().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_error() {
        let sink = FileSink::new("/nonexistent/dir/token");
        assert!(matches!(sink.write_token("s.token").await, Err(SinkError::Io { .. })));
    }
}
