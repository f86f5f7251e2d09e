use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("location picker failed: {0}")]
    Picker(String),
    #[error("no save target configured")]
    NoTarget,
}

/// Asks where a bundle should go. `None` means the user declined.
#[async_trait]
pub trait LocationPicker: Send + Sync {
    async fn pick(&self, suggested_name: &str) -> Result<Option<PathBuf>, SaveError>;
}

/// Non-interactive delivery of a finished bundle. Returns where it ended up.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, name: &str, bytes: &[u8]) -> Result<String, SaveError>;
}

/// Writes bundles into a directory, creating it on first use
#[derive(Debug, Clone)]
pub struct DirectoryDelivery {
    dir: PathBuf,
}

impl DirectoryDelivery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Delivery for DirectoryDelivery {
    async fn deliver(&self, name: &str, bytes: &[u8]) -> Result<String, SaveError> {
        // only the final component, callers cannot escape the directory
        let file_name = Path::new(name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("bundle.tar.gz"));
        let path = self.dir.join(file_name);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SaveError::Io {
                path: self.dir.clone(),
                source,
            })?;
        write_file(&path, bytes).await?;
        Ok(path.display().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(String),
    Declined,
}

/// Where finished bundles go: the picker when there is one, otherwise the
///  fallback delivery
#[derive(Clone, Default)]
pub struct SaveTargets {
    picker: Option<Arc<dyn LocationPicker>>,
    fallback: Option<Arc<dyn Delivery>>,
}

impl SaveTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_picker(mut self, picker: Arc<dyn LocationPicker>) -> Self {
        self.picker = Some(picker);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Delivery>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self::new().with_fallback(Arc::new(DirectoryDelivery::new(dir)))
    }

    pub fn is_empty(&self) -> bool {
        self.picker.is_none() && self.fallback.is_none()
    }

    pub async fn persist(&self, name: &str, bytes: &[u8]) -> Result<SaveOutcome, SaveError> {
        if let Some(picker) = &self.picker {
            return match picker.pick(name).await? {
                Some(path) => {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|source| SaveError::Io {
                                path: parent.to_path_buf(),
                                source,
                            })?;
                    }
                    write_file(&path, bytes).await?;
                    Ok(SaveOutcome::Saved(path.display().to_string()))
                }
                None => Ok(SaveOutcome::Declined),
            };
        }

        match &self.fallback {
            Some(delivery) => delivery.deliver(name, bytes).await.map(SaveOutcome::Saved),
            None => Err(SaveError::NoTarget),
        }
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), SaveError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| SaveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "wrote bundle");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPicker(Option<PathBuf>);

    #[async_trait]
    impl LocationPicker for FixedPicker {
        async fn pick(&self, _suggested_name: &str) -> Result<Option<PathBuf>, SaveError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_directory_delivery_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let targets = SaveTargets::directory(tmp.path().join("out"));

        let outcome = targets.persist("../evil/x.tar.gz", b"data").await.unwrap();
        let expected = tmp.path().join("out").join("x.tar.gz");
        assert_eq!(outcome, SaveOutcome::Saved(expected.display().to_string()));
        assert_eq!(std::fs::read(expected).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_picker_takes_precedence_and_may_decline() {
        let tmp = tempfile::tempdir().unwrap();
        let declined = SaveTargets::directory(tmp.path())
            .with_picker(Arc::new(FixedPicker(None)));
        assert_eq!(
            declined.persist("a.tar.gz", b"x").await.unwrap(),
            SaveOutcome::Declined
        );
        assert!(!tmp.path().join("a.tar.gz").exists());

        let chosen = tmp.path().join("nested").join("picked.tar.gz");
        let picked = SaveTargets::new().with_picker(Arc::new(FixedPicker(Some(chosen.clone()))));
        picked.persist("a.tar.gz", b"y").await.unwrap();
        assert_eq!(std::fs::read(chosen).unwrap(), b"y");
    }

    #[tokio::test]
    async fn test_no_target() {
        let targets = SaveTargets::new();
        assert!(targets.is_empty());
        assert!(matches!(
            targets.persist("a", b"").await,
            Err(SaveError::NoTarget)
        ));
    }
}
