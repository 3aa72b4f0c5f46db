//! Persistent FIFO queue backed by an ordered key-value store.
//!
//! Items are keyed by dense big-endian u64 sequence numbers, so ascending
//! key order in the store is FIFO order. `head` and `tail` are derived from
//! the store's first and last keys at open time: `head + 1` is the next key
//! to dequeue, `tail + 1` the next key to assign on enqueue.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use thiserror::Error;

pub const MAX_QUEUE_NAME_LEN: usize = 100;

const ITEMS_PARTITION: &str = "items";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,

    #[error("queue name is not alphanumeric")]
    NameNotAlphanumeric,

    #[error("queue name is too long")]
    NameTooLong,

    #[error("queue head can not be less than zero")]
    HeadUnderflow,

    #[error("queue is closed")]
    Closed,

    #[error("store error: {0}")]
    Store(#[from] fjall::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// One queue entry: the assigned sequence key plus the payload bytes.
///
/// The payload is a copy of the stored bytes, never a view into store
/// internals, so holding an `Item` does not pin the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: u64,
    pub value: Vec<u8>,
}

impl Item {
    pub fn new(key: u64, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

struct Store {
    keyspace: Keyspace,
    items: PartitionHandle,
}

struct Inner {
    head: u64,
    tail: u64,
    store: Option<Store>,
}

impl Inner {
    fn store(&self) -> QueueResult<&Store> {
        self.store.as_ref().ok_or(QueueError::Closed)
    }

    fn length(&self) -> u64 {
        self.tail - self.head
    }

    fn peek(&self) -> QueueResult<Item> {
        if self.length() < 1 {
            return Err(QueueError::Empty);
        }
        let key = self.head + 1;
        match self.store()?.items.get(encode_key(key))? {
            Some(value) => Ok(Item::new(key, value.to_vec())),
            None => Err(QueueError::Empty),
        }
    }
}

/// A single named FIFO over an ordered K/V store.
///
/// Lock discipline: `peek` and `length` take the shared lock; `enqueue`,
/// `dequeue` and `prepend` take the exclusive lock. The reservation counter
/// is atomic and never blocks. Counter updates are strictly conditioned on
/// store success.
pub struct PersistentQueue {
    name: String,
    data_dir: PathBuf,
    inner: RwLock<Inner>,
    open_transactions: AtomicI64,
}

impl PersistentQueue {
    /// Open (or create) the queue store at `data_dir/name` and derive the
    /// head and tail counters from its first and last keys.
    pub fn open(name: &str, data_dir: &Path) -> QueueResult<Self> {
        validate_name(name)?;

        // Streaming workload: the backlog may vastly exceed RAM, so the
        // block cache stays off.
        let keyspace = fjall::Config::new(data_dir.join(name)).cache_size(0).open()?;
        let items = keyspace.open_partition(ITEMS_PARTITION, PartitionCreateOptions::default())?;

        let mut head = 0;
        let mut tail = 0;
        if let Some(entry) = items.iter().next() {
            let (key, _) = entry?;
            head = decode_key(&key) - 1;
        }
        if let Some(entry) = items.iter().next_back() {
            let (key, _) = entry?;
            tail = decode_key(&key);
        }

        Ok(Self {
            name: name.to_string(),
            data_dir: data_dir.to_path_buf(),
            inner: RwLock::new(Inner {
                head,
                tail,
                store: Some(Store { keyspace, items }),
            }),
            open_transactions: AtomicI64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// On-disk directory of this queue's store.
    pub fn path(&self) -> PathBuf {
        self.data_dir.join(&self.name)
    }

    pub fn head(&self) -> u64 {
        self.read_inner().head
    }

    pub fn tail(&self) -> u64 {
        self.read_inner().tail
    }

    pub fn length(&self) -> u64 {
        self.read_inner().length()
    }

    /// Append a value; it receives key `tail + 1`.
    pub fn enqueue(&self, value: &[u8]) -> QueueResult<()> {
        let mut inner = self.write_inner();
        let key = inner.tail + 1;
        inner.store()?.items.insert(encode_key(key), value)?;
        inner.tail = key;
        Ok(())
    }

    /// Remove and return the item at the head of the queue.
    pub fn dequeue(&self) -> QueueResult<Item> {
        let mut inner = self.write_inner();
        let item = inner.peek()?;
        inner.store()?.items.remove(encode_key(item.key))?;
        inner.head += 1;
        Ok(item)
    }

    /// Return the item at the head of the queue without removing it.
    pub fn peek(&self) -> QueueResult<Item> {
        self.read_inner().peek()
    }

    /// Restore a previously dequeued item to the front of the queue.
    ///
    /// Keys are dense from `head + 1` upward, so the slot at `head` is
    /// guaranteed free and prepend never collides with a live item.
    pub fn prepend(&self, item: &Item) -> QueueResult<()> {
        let mut inner = self.write_inner();
        if inner.head < 1 {
            return Err(QueueError::HeadUnderflow);
        }
        let key = inner.head;
        inner.store()?.items.insert(encode_key(key), &item.value)?;
        inner.head = key - 1;
        Ok(())
    }

    /// Adjust the count of outstanding reservations against this queue.
    pub fn add_open_transactions(&self, delta: i64) {
        self.open_transactions.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn open_transactions(&self) -> i64 {
        self.open_transactions.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.read_inner().store.is_some()
    }

    /// Close the backing store. Idempotent.
    pub fn close(&self) -> QueueResult<()> {
        let mut inner = self.write_inner();
        if let Some(store) = inner.store.take() {
            store.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(())
    }

    /// Close the backing store and remove its on-disk directory.
    pub fn destroy(&self) -> QueueResult<()> {
        self.close()?;
        match fs::remove_dir_all(self.path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("queue lock poisoned")
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("queue lock poisoned")
    }
}

fn validate_name(name: &str) -> QueueResult<()> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(QueueError::NameNotAlphanumeric);
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(QueueError::NameTooLong);
    }
    Ok(())
}

/// Keys are 8-byte big-endian so lexicographic store order is FIFO order.
fn encode_key(key: u64) -> [u8; 8] {
    key.to_be_bytes()
}

fn decode_key(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    if raw.len() == 8 {
        buf.copy_from_slice(raw);
    }
    u64::from_be_bytes(buf)
}
