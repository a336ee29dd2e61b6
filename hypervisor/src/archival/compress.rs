use std::{
    fs::File,
    path::{Path, PathBuf},
};

use flate2::{write::GzEncoder, Compression};
use tracing::info;

use crate::error::ArchivalError;

/// Pack `dir` into `{dir}.tar.gz` next to it, rooted at the directory name.
/// A partial archive is removed on failure.
pub async fn compress_dir(dir: &Path) -> Result<PathBuf, ArchivalError> {
    let dir = dir.to_path_buf();
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ArchivalError::Compress(format!("{} has no name", dir.display())))?;
    let archive = dir.with_file_name(format!("{name}.tar.gz"));

    let target = archive.clone();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
        let file = File::create(&target)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(&name, &dir)?;
        builder.into_inner()?.finish()?.sync_all()?;
        Ok(std::fs::metadata(&target)?.len())
    })
    .await
    .map_err(|e| ArchivalError::Compress(format!("compression task failed: {e}")))?;

    match result {
        Ok(size) => {
            info!(archive = %archive.display(), bytes = size, "archive created");
            Ok(archive)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&archive).await;
            Err(ArchivalError::Compress(e.to_string()))
        }
    }
}
