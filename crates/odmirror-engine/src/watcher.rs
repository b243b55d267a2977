//! Filesystem watcher for daemon mode.
//!
//! Delivers debounced path events between full cycles. Raw notify events
//! land in a [`DebouncedChangeQueue`]; a path is reported only once it has
//! been quiet for the debounce window, so editors that write in bursts
//! trigger a single sync.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use odmirror_core::domain::errors::SyncError;

/// One observed local change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
}

/// Coalesces rapid-fire events per path.
#[derive(Debug)]
pub struct DebouncedChangeQueue {
    pending: HashMap<PathBuf, Instant>,
    delay: Duration,
}

impl DebouncedChangeQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            delay,
        }
    }

    /// Records an event, restarting the path's quiet window.
    pub fn push(&mut self, path: PathBuf) {
        self.pending.insert(path, Instant::now());
    }

    /// Drains the paths that have been quiet for the debounce window.
    pub fn settled(&mut self) -> Vec<PathBuf> {
        let now = Instant::now();
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= self.delay)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Recursive watcher over the sync root, forwarding raw events into a
/// channel the monitor loop drains.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    pub fn start(root: &Path, tx: mpsc::Sender<ChangeEvent>) -> Result<Self, SyncError> {
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    for path in event.paths {
                        // Full channel means a sync is already overdue;
                        // dropping the event is safe because the next scan
                        // rediscovers the change.
                        if tx.try_send(ChangeEvent { path }).is_err() {
                            debug!("watcher channel full; event dropped");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            }
        })
        .map_err(|e| SyncError::filesystem(
            root.display().to_string(),
            std::io::Error::other(e),
        ))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::filesystem(
                root.display().to_string(),
                std::io::Error::other(e),
            ))?;

        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debounce_holds_until_quiet() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(50));
        queue.push(PathBuf::from("/sync/a.txt"));

        // Immediately after the event the path is still "hot".
        assert!(queue.settled().is_empty());
        assert!(!queue.is_empty());

        std::thread::sleep(Duration::from_millis(60));
        let ready = queue.settled();
        assert_eq!(ready, vec![PathBuf::from("/sync/a.txt")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_repeated_events_restart_the_window() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(80));
        queue.push(PathBuf::from("/sync/a.txt"));
        std::thread::sleep(Duration::from_millis(50));
        queue.push(PathBuf::from("/sync/a.txt"));
        std::thread::sleep(Duration::from_millis(50));

        // 100 ms since the first event but only 50 ms since the second.
        assert!(queue.settled().is_empty());

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(queue.settled().len(), 1);
    }

    #[test]
    fn test_distinct_paths_settle_independently() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(30));
        queue.push(PathBuf::from("/sync/a.txt"));
        std::thread::sleep(Duration::from_millis(40));
        queue.push(PathBuf::from("/sync/b.txt"));

        let ready = queue.settled();
        assert_eq!(ready, vec![PathBuf::from("/sync/a.txt")]);
        assert!(!queue.is_empty());
    }
}
