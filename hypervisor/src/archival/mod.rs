//! Archival Worker: offloads finished trace directories to a remote store.
//!
//! Per candidate the pipeline is compress → upload → verify → delete. A
//! failure halts that candidate at its last good state; nothing local is
//! deleted before the upload is verified.

pub mod candidate;
pub mod compress;
pub mod lock;
pub mod process;
pub mod store;
pub mod supervisor;

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ArchivalSettings;
use crate::error::ArchivalError;

pub use candidate::ArchiveCandidate;
pub use lock::SingletonLock;
pub use store::ArtifactStore;
pub use supervisor::ArchivalSupervisor;

/// Receives the orchestrator's live task keys. Each call replaces the whole
/// set.
#[async_trait]
pub trait LiveTaskSink: Send + Sync {
    async fn publish(&self, keys: HashSet<String>);
}

#[async_trait]
impl LiveTaskSink for watch::Sender<HashSet<String>> {
    async fn publish(&self, keys: HashSet<String>) {
        self.send_replace(keys);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    Archived,
    SkippedLive,
    SkippedRecent,
    CompressFailed,
    /// Local archive removed, source directory kept.
    UploadFailed,
    /// Both the archive and the source directory kept.
    Unverified,
}

pub struct ArchivalWorker {
    data_dir: PathBuf,
    interval: Duration,
    age_threshold: Duration,
    store: Arc<dyn ArtifactStore>,
}

impl ArchivalWorker {
    pub fn new(settings: &ArchivalSettings, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            data_dir: settings.data_dir.clone(),
            interval: settings.interval,
            age_threshold: settings.age_threshold,
            store,
        }
    }

    /// Wait an interval, sweep, repeat. Cancellation is observed between
    /// sweeps, never in the middle of one.
    pub async fn run(&self, live: watch::Receiver<HashSet<String>>, shutdown: CancellationToken) {
        info!(
            pid = std::process::id(),
            interval_secs = self.interval.as_secs(),
            data_dir = %self.data_dir.display(),
            "archival worker started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let live_now = live.borrow().clone();
            let outcomes = self.sweep(&live_now).await;
            let archived = outcomes
                .iter()
                .filter(|(_, o)| *o == CandidateOutcome::Archived)
                .count();
            info!(candidates = outcomes.len(), archived, "archival sweep finished");
        }
        info!("archival worker shutting down");
    }

    /// One pass over the data directory.
    pub async fn sweep(&self, live: &HashSet<String>) -> Vec<(String, CandidateOutcome)> {
        let candidates = match candidate::enumerate(&self.data_dir).await {
            Ok(c) => c,
            Err(e) => {
                error!(data_dir = %self.data_dir.display(), error = %e, "cannot list data directory");
                return Vec::new();
            }
        };

        let now = SystemTime::now();
        let mut outcomes = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let outcome = if live.contains(&candidate.task_key) {
                debug!(folder = %candidate.name, "skipping live task folder");
                CandidateOutcome::SkippedLive
            } else if candidate.age(now) < self.age_threshold {
                debug!(folder = %candidate.name, age_secs = candidate.age(now).as_secs(), "folder too recent");
                CandidateOutcome::SkippedRecent
            } else {
                self.archive(&candidate).await
            };
            outcomes.push((candidate.name, outcome));
        }
        outcomes
    }

    async fn archive(&self, candidate: &ArchiveCandidate) -> CandidateOutcome {
        info!(folder = %candidate.name, "archiving folder");
        let archive = match compress::compress_dir(&candidate.path).await {
            Ok(path) => path,
            Err(e) => {
                error!(folder = %candidate.name, error = %e, "compression failed");
                return CandidateOutcome::CompressFailed;
            }
        };
        let remote_name = format!("{}.tar.gz", candidate.name);

        if let Err(e) = self.store.upload(&archive, &remote_name).await {
            error!(archive = %remote_name, error = %e, "upload failed; keeping folder for retry");
            remove_archive(&archive).await;
            return CandidateOutcome::UploadFailed;
        }

        match self.store.exists(&remote_name).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(archive = %remote_name, "upload not visible in store; keeping local files");
                return CandidateOutcome::Unverified;
            }
            Err(e) => {
                warn!(archive = %remote_name, error = %e, "verification failed; keeping local files");
                return CandidateOutcome::Unverified;
            }
        }

        if let Err(e) = delete_verified(candidate, &archive).await {
            error!(folder = %candidate.name, error = %e, "cleanup after verified upload failed");
        }
        info!(folder = %candidate.name, archive = %remote_name, "folder archived");
        CandidateOutcome::Archived
    }
}

async fn remove_archive(archive: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(archive).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(archive = %archive.display(), error = %e, "could not remove local archive");
        }
    }
}

async fn delete_verified(
    candidate: &ArchiveCandidate,
    archive: &std::path::Path,
) -> Result<(), ArchivalError> {
    match tokio::fs::remove_dir_all(&candidate.path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(folder = %candidate.name, "folder already deleted");
        }
        Err(e) => return Err(e.into()),
    }
    remove_archive(archive).await;
    Ok(())
}
