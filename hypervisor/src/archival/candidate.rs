//! Trace directories on disk that may be archived.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tokio::fs;
use tracing::warn;

const PREFIX: &str = "trace-";
const UUID_LEN: usize = 36;

#[derive(Debug, Clone)]
pub struct ArchiveCandidate {
    pub path: PathBuf,
    pub name: String,
    pub task_key: String,
    pub modified: SystemTime,
}

impl ArchiveCandidate {
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.modified).unwrap_or_default()
    }
}

/// Task key encoded in `trace-{key}-{model}`. Keys are UUIDs, which contain
/// dashes themselves; anything else falls back to the first segment.
pub fn task_key_from_dir_name(name: &str) -> Option<String> {
    let rest = name.strip_prefix(PREFIX)?;
    if let Some(head) = rest.get(..UUID_LEN) {
        let tail = &rest[UUID_LEN..];
        if uuid::Uuid::parse_str(head).is_ok() && (tail.is_empty() || tail.starts_with('-')) {
            return Some(head.to_string());
        }
    }
    let segment = rest.split('-').next().unwrap_or_default();
    (!segment.is_empty()).then(|| segment.to_string())
}

/// Every `trace-*` directory directly under `data_dir`. A missing data dir
/// yields no candidates.
pub async fn enumerate(data_dir: &Path) -> std::io::Result<Vec<ArchiveCandidate>> {
    let mut entries = match fs::read_dir(data_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(data_dir = %data_dir.display(), "data directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(PREFIX) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(m) if m.is_dir() => m,
            Ok(_) => continue,
            Err(e) => {
                warn!(folder = %name, error = %e, "cannot stat trace folder");
                continue;
            }
        };
        let Some(task_key) = task_key_from_dir_name(&name) else {
            warn!(folder = %name, "unexpected trace folder name");
            continue;
        };
        let Some(modified) = modified_time(&name, &metadata) else {
            continue;
        };
        candidates.push(ArchiveCandidate {
            path: entry.path(),
            name,
            task_key,
            modified,
        });
    }
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(candidates)
}

/// `None` (logged) when the platform cannot report the folder's mtime.
fn modified_time(name: &str, metadata: &std::fs::Metadata) -> Option<SystemTime> {
    match metadata.modified() {
        Ok(modified) => Some(modified),
        Err(e) => {
            warn!(folder = %name, error = %e, "cannot read trace folder mtime");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_keys_survive_their_own_dashes() {
        let key = "0b3f8a52-4c7e-4d5e-9a61-2f0c8e7d1a90";
        assert_eq!(
            task_key_from_dir_name(&format!("trace-{key}-Qwen-Qwen2.5-VL-72B")),
            Some(key.to_string())
        );
        assert_eq!(
            task_key_from_dir_name(&format!("trace-{key}")),
            Some(key.to_string())
        );
    }

    #[test]
    fn non_uuid_names_fall_back_to_first_segment() {
        assert_eq!(task_key_from_dir_name("trace-t1-model"), Some("t1".to_string()));
        assert_eq!(task_key_from_dir_name("trace-"), None);
        assert_eq!(task_key_from_dir_name("trace--model"), None);
        assert_eq!(task_key_from_dir_name("other-t1-model"), None);
    }

    #[tokio::test]
    async fn only_trace_directories_are_listed() {
        let data = tempfile::tempdir().unwrap();
        std::fs::create_dir(data.path().join("trace-a-m")).unwrap();
        std::fs::create_dir(data.path().join("notes")).unwrap();
        std::fs::write(data.path().join("trace-b-m.tar.gz"), b"x").unwrap();

        let found = enumerate(data.path()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].task_key, "a");

        let missing = enumerate(&data.path().join("absent")).await.unwrap();
        assert!(missing.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unusable_entries_do_not_hide_the_rest() {
        let data = tempfile::tempdir().unwrap();
        std::fs::create_dir(data.path().join("trace-a-m")).unwrap();
        std::fs::create_dir(data.path().join("trace--m")).unwrap();
        std::os::unix::fs::symlink(data.path().join("gone"), data.path().join("trace-b-m")).unwrap();
        std::fs::create_dir(data.path().join("trace-c-m")).unwrap();

        let found = enumerate(data.path()).await.unwrap();
        let keys: Vec<_> = found.iter().map(|c| c.task_key.as_str()).collect();
        assert_eq!(keys, ["a", "c"]);
        assert!(found.iter().all(|c| c.modified <= SystemTime::now()));
    }
}
