use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::PersistError;
use crate::model::CrawlResult;

/// Writes `result` as indented JSON, replacing any previous artifact.
///
/// The JSON goes to a sibling `.tmp` file first and is renamed into place, so
/// a failed write leaves the old artifact untouched.
pub async fn write_result(path: &Path, result: &CrawlResult) -> Result<(), PersistError> {
    let mut json = serde_json::to_vec_pretty(result)?;
    json.push(b'\n');

    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| PersistError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
    }

    let staging = staging_path(path);
    let write_err = |source: std::io::Error| PersistError::Write {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::write(&staging, &json).await.map_err(write_err)?;
    if let Err(source) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(write_err(source));
    }

    info!(
        "Wrote {} articles to {}",
        result.meta.article_count,
        path.display()
    );
    Ok(())
}

/// Reads the last written artifact verbatim.
pub async fn read_result(path: &Path) -> std::io::Result<Vec<u8>> {
    tokio::fs::read(path).await
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
