use std::path::Path;

use async_trait::async_trait;

use super::ftp_source::TransferError;

/// # Row Extractor
///
/// Returns the latest record of a downloaded data file.
#[async_trait]
pub trait RowExtractor: Send + Sync {
    /// Returns the trimmed last non-blank line of `path`. An empty string
    /// means the file holds no record yet.
    async fn latest_record(&self, path: &Path) -> Result<String, TransferError>;
}

/// # Last Line Extractor
///
/// Reads the whole file (the logger writes one small file per day) and keeps
/// the last line that is not blank. `\r\n`, `\n` and trailing whitespace are
/// all tolerated; bytes that are not valid UTF-8 are replaced rather than
/// failing the cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastLineExtractor;

impl LastLineExtractor {
    /// Pure helper over already-loaded file content.
    pub fn last_record(content: &str) -> &str {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .unwrap_or("")
    }
}

#[async_trait]
impl RowExtractor for LastLineExtractor {
    async fn latest_record(&self, path: &Path) -> Result<String, TransferError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| TransferError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let content = String::from_utf8_lossy(&bytes);
        Ok(Self::last_record(&content).to_string())
    }
}
