//! Reference-counted lifecycle tracking for uploaded and temporary files.
//!
//! Every path the pipeline touches is acquired before use and released
//! after. What happens at zero references depends on the configured
//! strategy: `reference_counting` deletes immediately, `stream_complete`
//! leaves files to age out so a review session can still copy them. The
//! background sweeper deletes files that are both old enough and
//! unreferenced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::{
    async_utils::JoinWorker,
    config::{CleanupStrategy, FileManagementConfig},
    prelude::*,
};

#[derive(Debug)]
struct FileState {
    ref_count: usize,
    tracked_at: Instant,
}

/// Snapshot of the manager's state, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStats {
    pub tracked_files: usize,
    pub active_references: usize,
    pub oldest_file_age_seconds: f64,
}

pub struct FileLifecycleManager {
    config: FileManagementConfig,
    files: Mutex<HashMap<PathBuf, FileState>>,
}

impl FileLifecycleManager {
    pub fn new(config: FileManagementConfig) -> Self {
        Self {
            config,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Start the background sweeper. The caller owns the returned worker.
    pub fn start(self: &Arc<Self>) -> JoinWorker {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs_f64(
            self.config.cleanup_check_interval.max(0.01),
        );
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = manager.sweep();
                if removed > 0 {
                    info!(removed, "cleaned up old files");
                }
            }
        });
        JoinWorker::from_handle(handle)
    }

    /// Increment the reference count for a path.
    pub fn acquire(&self, path: &Path) {
        let mut files = self.lock();
        let state = files.entry(path.to_path_buf()).or_insert_with(|| FileState {
            ref_count: 0,
            tracked_at: Instant::now(),
        });
        state.ref_count += 1;
        debug!(path = %path.display(), refs = state.ref_count, "acquired file");
    }

    /// Decrement the reference count. Releasing an untracked path logs a
    /// warning and does nothing.
    pub fn release(&self, path: &Path) {
        let mut files = self.lock();
        let state = match files.get_mut(path) {
            Some(state) => state,
            None => {
                warn!(path = %path.display(), "attempted to release untracked file");
                return;
            }
        };
        state.ref_count = state.ref_count.saturating_sub(1);
        debug!(path = %path.display(), refs = state.ref_count, "released file");

        if state.ref_count == 0
            && self.config.cleanup_strategy == CleanupStrategy::ReferenceCounting
        {
            files.remove(path);
            drop(files);
            delete_file(path);
        }
    }

    /// Current reference count for a path.
    pub fn ref_count(&self, path: &Path) -> usize {
        self.lock().get(path).map(|state| state.ref_count).unwrap_or(0)
    }

    /// Acquire a set of paths for the duration of the returned guard.
    /// Releases happen on drop, error paths included.
    pub fn batch_guard(self: &Arc<Self>, paths: Vec<PathBuf>) -> BatchGuard {
        for path in &paths {
            self.acquire(path);
        }
        BatchGuard {
            manager: Arc::clone(self),
            paths,
        }
    }

    /// Record that streaming has completed for these paths. Files are NOT
    /// deleted here; they age out after `max_file_retention` so users can
    /// still create review sessions from the same results.
    pub fn mark_stream_complete(&self, paths: &[PathBuf]) {
        let mut files = self.lock();
        for path in paths {
            files.entry(path.clone()).or_insert_with(|| {
                debug!(path = %path.display(), "file tracked for retention");
                FileState {
                    ref_count: 0,
                    tracked_at: Instant::now(),
                }
            });
        }
    }

    /// One sweep: delete files past retention with no active references.
    pub fn sweep(&self) -> usize {
        let retention = Duration::from_secs_f64(self.config.max_file_retention.max(0.0));
        let mut to_delete = Vec::new();
        {
            let mut files = self.lock();
            let expired: Vec<PathBuf> = files
                .iter()
                .filter(|(_, state)| {
                    state.ref_count == 0 && state.tracked_at.elapsed() >= retention
                })
                .map(|(path, _)| path.clone())
                .collect();
            for path in expired {
                files.remove(&path);
                to_delete.push(path);
            }
        }
        let removed = to_delete.len();
        for path in to_delete {
            delete_file(&path);
        }
        removed
    }

    pub fn stats(&self) -> LifecycleStats {
        let files = self.lock();
        LifecycleStats {
            tracked_files: files.len(),
            active_references: files.values().map(|state| state.ref_count).sum(),
            oldest_file_age_seconds: files
                .values()
                .map(|state| state.tracked_at.elapsed().as_secs_f64())
                .fold(0.0, f64::max),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, FileState>> {
        self.files.lock().expect("lifecycle lock poisoned")
    }
}

fn delete_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "cleaned up file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => error!(path = %path.display(), %err, "error cleaning up file"),
    }
}

/// Scoped acquisition of a batch of files.
pub struct BatchGuard {
    manager: Arc<FileLifecycleManager>,
    paths: Vec<PathBuf>,
}

impl BatchGuard {
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            self.manager.release(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn manager(strategy: CleanupStrategy, retention: f64) -> Arc<FileLifecycleManager> {
        Arc::new(FileLifecycleManager::new(FileManagementConfig {
            cleanup_strategy: strategy,
            max_file_retention: retention,
            cleanup_check_interval: 0.01,
        }))
    }

    fn temp_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "contents").unwrap();
        file
    }

    #[test]
    fn acquire_release_balances_to_zero() {
        let manager = manager(CleanupStrategy::StreamComplete, 300.0);
        let path = PathBuf::from("/tmp/docstream-test-a");
        for _ in 0..3 {
            manager.acquire(&path);
        }
        assert_eq!(manager.ref_count(&path), 3);
        for _ in 0..3 {
            manager.release(&path);
        }
        assert_eq!(manager.ref_count(&path), 0);
    }

    #[test]
    fn releasing_untracked_path_is_a_no_op() {
        let manager = manager(CleanupStrategy::StreamComplete, 300.0);
        manager.release(Path::new("/tmp/never-acquired"));
        assert_eq!(manager.stats().tracked_files, 0);
    }

    #[test]
    fn reference_counting_strategy_deletes_at_zero() {
        let manager = manager(CleanupStrategy::ReferenceCounting, 300.0);
        let file = temp_file();
        let path = file.path().to_path_buf();
        manager.acquire(&path);
        manager.release(&path);
        assert!(!path.exists());
    }

    #[test]
    fn stream_complete_strategy_keeps_files_at_zero() {
        let manager = manager(CleanupStrategy::StreamComplete, 300.0);
        let file = temp_file();
        let path = file.path().to_path_buf();
        manager.acquire(&path);
        manager.release(&path);
        assert!(path.exists());
    }

    #[test]
    fn batch_guard_releases_on_drop() {
        let manager = manager(CleanupStrategy::StreamComplete, 300.0);
        let paths = vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")];
        {
            let guard = manager.batch_guard(paths.clone());
            assert_eq!(manager.ref_count(&paths[0]), 1);
            assert_eq!(guard.paths().len(), 2);
        }
        assert_eq!(manager.ref_count(&paths[0]), 0);
        assert_eq!(manager.ref_count(&paths[1]), 0);
    }

    #[test]
    fn sweep_respects_references_and_age() {
        let manager = manager(CleanupStrategy::StreamComplete, 0.0);
        let kept = temp_file();
        let removed = temp_file();

        manager.acquire(kept.path());
        manager.mark_stream_complete(&[removed.path().to_path_buf()]);

        assert_eq!(manager.sweep(), 1);
        assert!(kept.path().exists());
        assert!(!removed.path().exists());
    }

    #[tokio::test]
    async fn background_sweeper_deletes_aged_files() {
        let manager = manager(CleanupStrategy::StreamComplete, 0.0);
        let file = temp_file();
        manager.mark_stream_complete(&[file.path().to_path_buf()]);

        let worker = manager.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!file.path().exists());
        worker.abort();
        worker.join().await.unwrap();
    }
}
