use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AppError, Result};

/// Last fully processed block height, surviving restarts.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self) -> Result<Option<u64>>;
    async fn save(&self, height: u64) -> Result<()>;
}

/// Cursor kept as a single integer in a text file.
pub struct FileCursor {
    path: PathBuf,
}

impl FileCursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CursorStore for FileCursor {
    async fn load(&self) -> Result<Option<u64>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed.parse::<u64>().map(Some).map_err(|_| {
            AppError::Configuration(format!(
                "cursor file {} does not hold a block height: {trimmed:?}",
                self.path.display()
            ))
        })
    }

    /// Written beside the target and renamed over it.
    async fn save(&self, height: u64) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, format!("{height}\n")).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(height, path = %self.path.display(), "cursor saved");
        Ok(())
    }
}

#[cfg(test)]
pub struct MemoryCursor(std::sync::Mutex<Option<u64>>);

#[cfg(test)]
impl MemoryCursor {
    pub fn new(height: Option<u64>) -> Self {
        Self(std::sync::Mutex::new(height))
    }

    pub fn get(&self) -> Option<u64> {
        *self.0.lock().unwrap()
    }
}

#[cfg(test)]
#[async_trait]
impl CursorStore for MemoryCursor {
    async fn load(&self) -> Result<Option<u64>> {
        Ok(self.get())
    }

    async fn save(&self, height: u64) -> Result<()> {
        *self.0.lock().unwrap() = Some(height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_cursor_round_trips_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = FileCursor::new(dir.path().join("last_block.txt"));
        assert_eq!(cursor.load().await.unwrap(), None);

        cursor.save(860_123).await.unwrap();
        assert_eq!(cursor.load().await.unwrap(), Some(860_123));
        cursor.save(860_130).await.unwrap();
        assert_eq!(cursor.load().await.unwrap(), Some(860_130));
    }

    #[tokio::test]
    async fn garbage_cursor_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_block.txt");
        std::fs::write(&path, "not-a-height").unwrap();
        let err = FileCursor::new(path).load().await.unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }
}
