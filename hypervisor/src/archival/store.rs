//! Remote artifact stores. `exists` is eventually consistent: a `false`
//! right after a successful upload means "not yet", not "lost".

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tracing::debug;

use crate::error::ArchivalError;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, local: &Path, remote_name: &str) -> Result<(), ArchivalError>;

    async fn exists(&self, remote_name: &str) -> Result<bool, ArchivalError>;
}

/// `http(s)://` locations get the HTTP store; anything else (optionally
/// `file://`-prefixed) is a directory.
pub fn from_location(
    location: &str,
    token: Option<String>,
) -> Result<Arc<dyn ArtifactStore>, ArchivalError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(Arc::new(HttpArtifactStore::new(location, token)?));
    }
    let path = location.strip_prefix("file://").unwrap_or(location);
    Ok(Arc::new(DirectoryArtifactStore::new(path)))
}

// ============================================================================
// HTTP
// ============================================================================

/// Objects live at `{base_url}/{remote_name}`; `PUT` uploads, `HEAD` checks.
pub struct HttpArtifactStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpArtifactStore {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ArchivalError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| ArchivalError::Upload(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, remote_name: &str) -> String {
        format!("{}/{remote_name}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn upload(&self, local: &Path, remote_name: &str) -> Result<(), ArchivalError> {
        let body = tokio::fs::read(local).await?;
        let response = self
            .authorized(self.client.put(self.url(remote_name)))
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .body(body)
            .send()
            .await
            .map_err(|e| ArchivalError::Upload(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchivalError::Upload(format!("{remote_name}: store returned {status}")));
        }
        debug!(remote = remote_name, "uploaded");
        Ok(())
    }

    async fn exists(&self, remote_name: &str) -> Result<bool, ArchivalError> {
        let response = self
            .authorized(self.client.head(self.url(remote_name)))
            .send()
            .await
            .map_err(|e| ArchivalError::Verify(e.to_string()))?;
        match response.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => Err(ArchivalError::Verify(format!("{remote_name}: store returned {s}"))),
        }
    }
}

// ============================================================================
// Directory
// ============================================================================

/// A mounted directory acting as the store.
pub struct DirectoryArtifactStore {
    root: PathBuf,
}

impl DirectoryArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for DirectoryArtifactStore {
    async fn upload(&self, local: &Path, remote_name: &str) -> Result<(), ArchivalError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let partial = self.root.join(format!("{remote_name}.partial"));
        tokio::fs::copy(local, &partial)
            .await
            .map_err(|e| ArchivalError::Upload(format!("{remote_name}: {e}")))?;
        tokio::fs::rename(&partial, self.root.join(remote_name)).await?;
        Ok(())
    }

    async fn exists(&self, remote_name: &str) -> Result<bool, ArchivalError> {
        match tokio::fs::metadata(self.root.join(remote_name)).await {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ArchivalError::Verify(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_store_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("a.tar.gz");
        std::fs::write(&local, b"archive").unwrap();

        let store = DirectoryArtifactStore::new(tmp.path().join("remote"));
        assert!(!store.exists("a.tar.gz").await.unwrap());
        store.upload(&local, "a.tar.gz").await.unwrap();
        assert!(store.exists("a.tar.gz").await.unwrap());
        assert_eq!(std::fs::read(tmp.path().join("remote/a.tar.gz")).unwrap(), b"archive");
    }

    #[test]
    fn location_picks_backend() {
        let http = HttpArtifactStore::new("https://store.example/bucket/", None).unwrap();
        assert_eq!(http.url("x.tar.gz"), "https://store.example/bucket/x.tar.gz");
        assert!(from_location("https://store.example", Some("t".into())).is_ok());
        assert!(from_location("file:///mnt/archive", None).is_ok());
    }
}
