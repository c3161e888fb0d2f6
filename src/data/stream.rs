use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use log::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("NOGROUP consumer group '{0}' does not exist")]
    NoGroup(String),
    #[error("upstream log unavailable: {0}")]
    Unavailable(String),
}

/// Which entries a group read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries already delivered to this consumer but never acknowledged.
    Pending,
    /// Entries never delivered to any consumer of the group.
    New,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Append-only, consumer-group readable tick log.
#[async_trait]
pub trait TickLog: Send + Sync {
    /// Creates the group positioned at the end of the log. Existing groups are left untouched.
    async fn create_group(&self, group: &str) -> Result<(), LogError>;

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, LogError>;

    async fn ack(&self, group: &str, id: &str) -> Result<(), LogError>;

    async fn append(&self, fields: Vec<(String, String)>) -> Result<String, LogError>;
}

#[derive(Debug, Default)]
struct GroupState {
    // absolute index of the next undelivered entry
    next_index: u64,
    // absolute index -> consumer holding it
    pending: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct LogInner {
    entries: VecDeque<LogEntry>,
    first_index: u64,
    groups: HashMap<String, GroupState>,
    last_ms: i64,
    seq: u64,
}

impl LogInner {
    fn end_index(&self) -> u64 {
        self.first_index + self.entries.len() as u64
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        index
            .checked_sub(self.first_index)
            .and_then(|offset| self.entries.get(offset as usize))
    }

    fn next_id(&mut self) -> String {
        let now = chrono::Utc::now().timestamp_millis();
        if now > self.last_ms {
            self.last_ms = now;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        format!("{}-{}", self.last_ms, self.seq)
    }
}

/// Single-partition in-process log with Redis-stream style consumer groups.
pub struct MemoryLog {
    inner: Mutex<LogInner>,
    appended: Notify,
    max_len: usize,
}

impl MemoryLog {
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner::default()),
            appended: Notify::new(),
            max_len: max_len.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LogInner>, LogError> {
        self.inner
            .lock()
            .map_err(|_| LogError::Unavailable("log lock poisoned".to_string()))
    }

    /// Removes a group with all of its pending state.
    pub fn drop_group(&self, group: &str) -> bool {
        self.lock()
            .map(|mut inner| inner.groups.remove(group).is_some())
            .unwrap_or(false)
    }

    pub fn pending_count(&self, group: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|inner| inner.groups.get(group).map(|g| g.pending.len()))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(
        &self,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<LogEntry>, LogError> {
        let mut inner = self.lock()?;
        let LogInner { entries, first_index, groups, .. } = &mut *inner;
        let first_index = *first_index;
        let end_index = first_index + entries.len() as u64;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| LogError::NoGroup(group.to_string()))?;

        let lookup = |index: u64| {
            index
                .checked_sub(first_index)
                .and_then(|offset| entries.get(offset as usize))
        };

        let mut batch = Vec::new();
        match cursor {
            ReadCursor::Pending => {
                // entries trimmed out of the log cannot be redelivered
                state.pending.retain(|index, _| *index >= first_index);
                for (index, owner) in state.pending.iter() {
                    if batch.len() >= count {
                        break;
                    }
                    if owner == consumer {
                        if let Some(entry) = lookup(*index) {
                            batch.push(entry.clone());
                        }
                    }
                }
            }
            ReadCursor::New => {
                state.next_index = state.next_index.max(first_index);
                while batch.len() < count && state.next_index < end_index {
                    if let Some(entry) = lookup(state.next_index) {
                        batch.push(entry.clone());
                        state.pending.insert(state.next_index, consumer.to_string());
                    }
                    state.next_index += 1;
                }
            }
        }
        Ok(batch)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl TickLog for MemoryLog {
    async fn create_group(&self, group: &str) -> Result<(), LogError> {
        let mut inner = self.lock()?;
        let end = inner.end_index();
        inner.groups.entry(group.to_string()).or_insert_with(|| {
            debug!("Created consumer group {} at index {}", group, end);
            GroupState {
                next_index: end,
                pending: BTreeMap::new(),
            }
        });
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, LogError> {
        let deadline = Instant::now() + block;
        loop {
            // register interest before looking so an append in between is not missed
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take(group, consumer, cursor, count)?;
            if !batch.is_empty() || cursor == ReadCursor::Pending || block.is_zero() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, group: &str, id: &str) -> Result<(), LogError> {
        let mut inner = self.lock()?;
        let index = inner
            .groups
            .get(group)
            .ok_or_else(|| LogError::NoGroup(group.to_string()))?
            .pending
            .keys()
            .copied()
            .find(|index| inner.entry(*index).map(|e| e.id == id).unwrap_or(false));
        if let (Some(index), Some(state)) = (index, inner.groups.get_mut(group)) {
            state.pending.remove(&index);
        }
        Ok(())
    }

    async fn append(&self, fields: Vec<(String, String)>) -> Result<String, LogError> {
        let id = {
            let mut inner = self.lock()?;
            let id = inner.next_id();
            inner.entries.push_back(LogEntry {
                id: id.clone(),
                fields: fields.into_iter().collect(),
            });
            while inner.entries.len() > self.max_len {
                inner.entries.pop_front();
                inner.first_index += 1;
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }
}
