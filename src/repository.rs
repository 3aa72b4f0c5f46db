//! Queue directory and process-wide statistics.
//!
//! The repository owns every open queue; sessions borrow shared references.
//! All sessions referring to a queue see the same instance, which is what
//! makes the reservation counting hold up.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use thiserror::Error;

use crate::queue::{PersistentQueue, QueueError};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;

/// Process-wide counters reported by STATS.
pub struct Stats {
    pub current_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub cmd_get: AtomicU64,
    pub cmd_set: AtomicU64,
    version: String,
    started_at: Instant,
}

impl Stats {
    fn new() -> Self {
        Self {
            current_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            cmd_get: AtomicU64::new(0),
            cmd_set: AtomicU64::new(0),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Per-queue numbers for the STATS report.
pub struct QueueStats {
    pub name: String,
    pub items: u64,
    pub open_transactions: i64,
}

pub struct Repository {
    data_dir: PathBuf,
    queues: RwLock<HashMap<String, Arc<PersistentQueue>>>,
    pub stats: Stats,
}

impl Repository {
    /// Create `data_dir` if absent and reopen every queue directory found
    /// inside it.
    pub fn initialize(data_dir: &Path) -> RepoResult<Self> {
        fs::create_dir_all(data_dir)?;

        let repo = Self {
            data_dir: data_dir.to_path_buf(),
            queues: RwLock::new(HashMap::new()),
            stats: Stats::new(),
        };

        for entry in fs::read_dir(data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            match PersistentQueue::open(&name, data_dir) {
                Ok(queue) => {
                    repo.write_queues().insert(name, Arc::new(queue));
                }
                Err(err) => {
                    tracing::warn!("skipping queue directory {:?}: {}", entry.path(), err);
                }
            }
        }

        Ok(repo)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Look up a queue, opening it on first reference.
    ///
    /// Returns a shared instance: every session referencing `name` sees the
    /// same queue object.
    pub fn get_queue(&self, name: &str) -> RepoResult<Arc<PersistentQueue>> {
        if let Some(queue) = self.read_queues().get(name) {
            return Ok(Arc::clone(queue));
        }

        let mut queues = self.write_queues();
        // Racing openers resolve to whoever inserted first.
        if let Some(queue) = queues.get(name) {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(PersistentQueue::open(name, &self.data_dir)?);
        queues.insert(name.to_string(), Arc::clone(&queue));
        Ok(queue)
    }

    /// Remove all items from a queue by dropping its store and reopening it
    /// empty. Reservations referencing the queue are implicitly lost.
    pub fn flush_queue(&self, name: &str) -> RepoResult<()> {
        let mut queues = self.write_queues();
        let queue = match queues.remove(name) {
            Some(queue) => queue,
            None => Arc::new(PersistentQueue::open(name, &self.data_dir)?),
        };
        queue.destroy()?;
        let fresh = Arc::new(PersistentQueue::open(name, &self.data_dir)?);
        queues.insert(name.to_string(), fresh);
        Ok(())
    }

    /// Drop a queue and remove it from the directory.
    pub fn delete_queue(&self, name: &str) -> RepoResult<()> {
        let mut queues = self.write_queues();
        let queue = match queues.remove(name) {
            Some(queue) => queue,
            None => Arc::new(PersistentQueue::open(name, &self.data_dir)?),
        };
        queue.destroy()?;
        Ok(())
    }

    /// Flush every open queue.
    pub fn flush_all_queues(&self) -> RepoResult<()> {
        for name in self.queue_names() {
            self.flush_queue(&name)?;
        }
        Ok(())
    }

    /// Close every queue; used on shutdown.
    pub fn close_all_queues(&self) {
        let mut queues = self.write_queues();
        for (name, queue) in queues.drain() {
            if let Err(err) = queue.close() {
                tracing::error!("failed to close queue {}: {}", name, err);
            }
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_queues().keys().cloned().collect();
        names.sort();
        names
    }

    /// Per-queue numbers for the STATS report, sorted by queue name.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        let queues = self.read_queues();
        let mut stats: Vec<QueueStats> = queues
            .iter()
            .map(|(name, queue)| QueueStats {
                name: name.clone(),
                items: queue.length(),
                open_transactions: queue.open_transactions(),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    fn read_queues(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<PersistentQueue>>> {
        self.queues.read().expect("repository lock poisoned")
    }

    fn write_queues(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<PersistentQueue>>> {
        self.queues.write().expect("repository lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn get_queue_returns_shared_instance() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = Repository::initialize(dir.path()).expect("initialize");

        let a = repo.get_queue("work").expect("get queue");
        let b = repo.get_queue("work").expect("get queue");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn get_queue_rejects_invalid_name() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = Repository::initialize(dir.path()).expect("initialize");

        assert!(repo.get_queue("not a name").is_err());
    }

    #[test]
    fn initialize_reopens_existing_queues() {
        let dir = tempfile::tempdir().expect("create temp dir");

        {
            let repo = Repository::initialize(dir.path()).expect("initialize");
            let q = repo.get_queue("jobs").expect("get queue");
            q.enqueue(b"payload").expect("enqueue");
            repo.close_all_queues();
        }

        let repo = Repository::initialize(dir.path()).expect("reinitialize");
        assert_eq!(repo.queue_names(), vec!["jobs".to_string()]);
        let q = repo.get_queue("jobs").expect("get queue");
        assert_eq!(q.length(), 1);
        assert_eq!(q.dequeue().expect("dequeue").value, b"payload");
    }

    #[test]
    fn flush_queue_empties_and_reopens() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = Repository::initialize(dir.path()).expect("initialize");

        let q = repo.get_queue("work").expect("get queue");
        q.enqueue(b"1").expect("enqueue");
        q.enqueue(b"2").expect("enqueue");

        repo.flush_queue("work").expect("flush");

        let q = repo.get_queue("work").expect("get queue");
        assert_eq!(q.length(), 0);
    }

    #[test]
    fn delete_queue_removes_directory_and_entry() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = Repository::initialize(dir.path()).expect("initialize");

        let q = repo.get_queue("doomed").expect("get queue");
        q.enqueue(b"x").expect("enqueue");
        let path = q.path();

        repo.delete_queue("doomed").expect("delete");
        assert!(!path.exists());
        assert!(repo.queue_names().is_empty());
    }

    #[test]
    fn flush_all_covers_every_queue() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = Repository::initialize(dir.path()).expect("initialize");

        for name in ["a", "b"] {
            let q = repo.get_queue(name).expect("get queue");
            q.enqueue(b"x").expect("enqueue");
        }

        repo.flush_all_queues().expect("flush all");
        for name in ["a", "b"] {
            assert_eq!(repo.get_queue(name).expect("get queue").length(), 0);
        }
    }

    #[test]
    fn stats_start_at_zero() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = Repository::initialize(dir.path()).expect("initialize");

        assert_eq!(repo.stats.current_connections.load(Ordering::SeqCst), 0);
        assert_eq!(repo.stats.total_connections.load(Ordering::SeqCst), 0);
        assert_eq!(repo.stats.version(), env!("CARGO_PKG_VERSION"));
    }
}
