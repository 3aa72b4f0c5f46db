//! Per-connection session state and the reservation discipline.
//!
//! A session holds at most one reservation: an item dequeued by
//! `get <queue>/open` that must be returned to its queue by `abort`, or by
//! the scoped release here, fired on every disconnect path. The session is
//! generic over its stream halves so it can run against in-memory buffers
//! in tests exactly as it runs against a TCP stream.

use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::queue::Item;
use crate::repository::Repository;

/// A reservation taken by `get <queue>/open`.
///
/// The queue name and the item move together; there is never a "holding,
/// but nothing to roll back" state. The queue is re-resolved by name at
/// release time so a flushed-and-reopened queue absorbs the rollback.
#[derive(Debug)]
pub struct Reservation {
    pub queue_name: String,
    pub item: Item,
}

pub struct Session<R: Read, W: Write> {
    pub(crate) reader: BufReader<R>,
    pub(crate) writer: BufWriter<W>,
    pub(crate) repo: Arc<Repository>,
    pub(crate) reservation: Option<Reservation>,
    finished: bool,
}

impl<R: Read, W: Write> Session<R, W> {
    pub fn new(reader: R, writer: W, repo: Arc<Repository>) -> Self {
        repo.stats.current_connections.fetch_add(1, Ordering::SeqCst);
        repo.stats.total_connections.fetch_add(1, Ordering::SeqCst);

        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            repo,
            reservation: None,
            finished: false,
        }
    }

    /// Read one CRLF-terminated command line. `None` on EOF.
    pub(crate) fn read_command_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Read `len` payload bytes plus the trailing CRLF.
    pub(crate) fn read_payload(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len + 2];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn take_reservation(&mut self) -> Option<Reservation> {
        self.reservation.take()
    }

    pub(crate) fn set_reservation(&mut self, queue_name: &str, item: Item) {
        self.reservation = Some(Reservation {
            queue_name: queue_name.to_string(),
            item,
        });
    }

    pub fn is_holding(&self) -> bool {
        self.reservation.is_some()
    }

    /// Tear the session down: roll back any held reservation and release
    /// the connection slot. Idempotent; also fired by `Drop` so that every
    /// exit path runs it.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        self.rollback_reservation();
        self.repo
            .stats
            .current_connections
            .fetch_sub(1, Ordering::SeqCst);
    }

    /// Return a held item to the head of its queue.
    fn rollback_reservation(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };

        match self.repo.get_queue(&reservation.queue_name) {
            Ok(queue) => {
                if let Err(err) = queue.prepend(&reservation.item) {
                    tracing::error!(
                        "failed to roll back item to queue {}: {}",
                        reservation.queue_name,
                        err
                    );
                }
                queue.add_open_transactions(-1);
            }
            Err(err) => {
                tracing::error!(
                    "failed to roll back reservation on queue {}: {}",
                    reservation.queue_name,
                    err
                );
            }
        }
    }
}

impl<R: Read, W: Write> Drop for Session<R, W> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn new_repo() -> (tempfile::TempDir, Arc<Repository>) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = Arc::new(Repository::initialize(dir.path()).expect("initialize"));
        (dir, repo)
    }

    fn new_session(repo: &Arc<Repository>) -> Session<Cursor<Vec<u8>>, Vec<u8>> {
        Session::new(Cursor::new(Vec::new()), Vec::new(), Arc::clone(repo))
    }

    #[test]
    fn new_and_finish_track_connections() {
        let (_dir, repo) = new_repo();

        let mut session = new_session(&repo);
        assert_eq!(repo.stats.current_connections.load(Ordering::SeqCst), 1);
        assert_eq!(repo.stats.total_connections.load(Ordering::SeqCst), 1);

        session.finish();
        assert_eq!(repo.stats.current_connections.load(Ordering::SeqCst), 0);
        assert_eq!(repo.stats.total_connections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finish_is_idempotent() {
        let (_dir, repo) = new_repo();

        let mut session = new_session(&repo);
        session.finish();
        session.finish();
        drop(session);
        assert_eq!(repo.stats.current_connections.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_rolls_back_reservation() {
        let (_dir, repo) = new_repo();
        let queue = repo.get_queue("work").expect("get queue");
        queue.enqueue(b"first").expect("enqueue");
        queue.enqueue(b"second").expect("enqueue");

        let mut session = new_session(&repo);
        let item = queue.dequeue().expect("dequeue");
        session.set_reservation("work", item);
        queue.add_open_transactions(1);
        assert_eq!(queue.length(), 1);

        drop(session);

        assert_eq!(queue.length(), 2);
        assert_eq!(queue.peek().expect("peek").value, b"first");
        assert_eq!(queue.open_transactions(), 0);
        assert_eq!(repo.stats.current_connections.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn finish_without_reservation_only_releases_slot() {
        let (_dir, repo) = new_repo();
        let queue = repo.get_queue("work").expect("get queue");
        queue.enqueue(b"only").expect("enqueue");

        let mut session = new_session(&repo);
        session.finish();

        assert_eq!(queue.length(), 1);
        assert_eq!(queue.open_transactions(), 0);
    }

    #[test]
    fn rollback_after_flush_targets_fresh_queue() {
        let (_dir, repo) = new_repo();
        let queue = repo.get_queue("work").expect("get queue");
        queue.enqueue(b"held").expect("enqueue");

        let mut session = new_session(&repo);
        let item = queue.dequeue().expect("dequeue");
        session.set_reservation("work", item);
        queue.add_open_transactions(1);

        repo.flush_queue("work").expect("flush");
        drop(session);

        // The rollback re-resolves by name and lands on the freshly
        // reopened queue: the prepend finds head at zero and is dropped,
        // while the counter on the fresh instance absorbs the decrement.
        let fresh = repo.get_queue("work").expect("get queue");
        assert_eq!(fresh.length(), 0);
        assert_eq!(fresh.open_transactions(), -1);
    }
}
