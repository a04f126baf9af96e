//! Shared key-value, list, ranked-set and topic store.
//!
//! The store is the only resource shared between worker replicas. Every
//! operation is atomic at the store, which is what makes the claim-pop of
//! the job queue safe without in-process locks.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::domain::Severity;
use crate::error::{QfarmError, Result};

/// Operations the pipeline needs from the shared store.
#[cfg_attr(test, mockall::automock)]
pub trait Store: Send + Sync {
    /// Append a value to the tail of a list.
    fn list_push(&self, key: &str, value: Vec<u8>) -> Result<()>;
    /// Atomically remove the head of a list, `None` when it is empty.
    fn list_pop(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Read the tail of a list.
    fn list_last(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Read up to `count` values from the tail of a list, oldest first.
    fn list_last_n(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>>;
    /// Add a member to a ranked set, replacing the score of an existing member.
    fn sorted_set_add(&self, key: &str, member: Vec<u8>, score: i64) -> Result<()>;
    /// Increment the score of a member, returning the new score.
    fn sorted_set_incr(&self, key: &str, member: &str) -> Result<i64>;
    /// Members of a ranked set from the highest to the lowest score.
    fn sorted_set_rev_range(&self, key: &str) -> Result<Vec<Vec<u8>>>;
    /// Atomically increment a counter, returning the new value (first call: 1).
    fn incr(&self, key: &str) -> Result<u64>;
    /// Store a single value.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    /// Read a single value.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Publish a message, returning the number of subscribers reached.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize>;
    /// Subscribe to a topic.
    fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Vec<u8>>>;
}

/// Key layout of the persisted records.
pub mod keys {
    use super::{Path, Severity};

    /// Work list of pending repository identifiers.
    pub const QUEUE: &str = "qfarm:queue";
    /// Topic carrying content-free wake-up signals.
    pub const WAKEUP: &str = "qfarm:wakeup";
    /// Topic carrying lifecycle events.
    pub const EVENTS: &str = "events";
    /// List of every build.
    pub const ALL_BUILDS: &str = "all-builds";

    /// Builds of one repository.
    pub fn repo_builds(repo: &str) -> String {
        format!("builds:{repo}")
    }

    /// Last build number reserved for one repository.
    pub fn build_counter(repo: &str) -> String {
        format!("builds:{repo}:counter")
    }

    /// Ranked repositories of one user.
    pub fn user_repos(user: &str) -> String {
        format!("users:{user}:repos")
    }

    /// Ranked findings of one build.
    pub fn issues(repo: &str, build: u64) -> String {
        format!("issues:{repo}:{build}")
    }

    /// Ranked findings of one build filtered by severity.
    pub fn issues_by_severity(repo: &str, build: u64, severity: Severity) -> String {
        format!("issues:{repo}:{build}:{}", severity.as_str())
    }

    /// Report of one build.
    pub fn report(repo: &str, build: u64) -> String {
        format!("report:{repo}:{build}")
    }

    /// Coverage report of one build.
    pub fn coverage(repo: &str, build: u64) -> String {
        format!("coverage:{repo}:{build}")
    }

    /// Tree node of one build.
    pub fn node(repo: &str, build: u64, path: &Path) -> String {
        format!("node:{repo}:{build}:{}", path.display())
    }
}

const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Ranked {
    member: Vec<u8>,
    score: i64,
}

/// Members in insertion order plus a member-to-position index.
#[derive(Debug, Default)]
struct RankedSet {
    entries: Vec<Ranked>,
    positions: HashMap<Vec<u8>, usize>,
}

impl RankedSet {
    fn score_mut(&mut self, member: &[u8]) -> Option<&mut i64> {
        let position = *self.positions.get(member)?;
        self.entries.get_mut(position).map(|entry| &mut entry.score)
    }

    fn insert(&mut self, member: Vec<u8>, score: i64) {
        self.positions.insert(member.clone(), self.entries.len());
        self.entries.push(Ranked { member, score });
    }
}

#[derive(Debug, Default)]
struct Records {
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    ranked: HashMap<String, RankedSet>,
    counters: HashMap<String, u64>,
    values: HashMap<String, Vec<u8>>,
}

/// In-process store used by tests and single-host runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, Records>> {
        self.records
            .lock()
            .map_err(|_| QfarmError::Storage("memory store lock poisoned".to_string()))
    }

    fn topics(&self) -> Result<MutexGuard<'_, HashMap<String, broadcast::Sender<Vec<u8>>>>> {
        self.topics
            .lock()
            .map_err(|_| QfarmError::Storage("memory store topics lock poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn list_push(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.records()?
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value);
        Ok(())
    }

    fn list_pop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .records()?
            .lists
            .get_mut(key)
            .and_then(VecDeque::pop_front))
    }

    fn list_last(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .records()?
            .lists
            .get(key)
            .and_then(|list| list.back().cloned()))
    }

    fn list_last_n(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let records = self.records()?;
        let Some(list) = records.lists.get(key) else {
            return Ok(Vec::new());
        };
        let skip = list.len().saturating_sub(count);
        Ok(list.iter().skip(skip).cloned().collect())
    }

    fn sorted_set_add(&self, key: &str, member: Vec<u8>, score: i64) -> Result<()> {
        let mut records = self.records()?;
        let set = records.ranked.entry(key.to_string()).or_default();
        match set.score_mut(&member) {
            Some(current) => *current = score,
            None => set.insert(member, score),
        }
        Ok(())
    }

    fn sorted_set_incr(&self, key: &str, member: &str) -> Result<i64> {
        let mut records = self.records()?;
        let set = records.ranked.entry(key.to_string()).or_default();
        let member = member.as_bytes();
        match set.score_mut(member) {
            Some(current) => {
                *current += 1;
                Ok(*current)
            }
            None => {
                set.insert(member.to_vec(), 1);
                Ok(1)
            }
        }
    }

    fn sorted_set_rev_range(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let records = self.records()?;
        let Some(set) = records.ranked.get(key) else {
            return Ok(Vec::new());
        };
        let mut ordered = set.entries.clone();
        ordered.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.member.cmp(&a.member))
        });
        Ok(ordered.into_iter().map(|entry| entry.member).collect())
    }

    fn incr(&self, key: &str) -> Result<u64> {
        let mut records = self.records()?;
        let counter = records.counters.entry(key.to_string()).or_default();
        *counter += 1;
        Ok(*counter)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.records()?.values.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records()?.values.get(key).cloned())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize> {
        let topics = self.topics()?;
        let Some(sender) = topics.get(topic) else {
            return Ok(0);
        };
        Ok(sender.send(payload).unwrap_or(0))
    }

    fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Vec<u8>>> {
        let mut topics = self.topics()?;
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Ok(sender.subscribe())
    }
}
