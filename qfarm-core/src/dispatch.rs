//! Work list and wake-up topic shared by worker replicas.
//!
//! Producers push a repository identifier and publish an empty wake-up.
//! Every replica reacts to the wake-up by popping one item; the store pops
//! atomically, so exactly one replica wins and the others see an empty list.

use std::sync::Arc;

use log::debug;
use tokio::sync::broadcast;

use crate::error::{QfarmError, Result};
use crate::store::{Store, keys};

/// Producer and consumer side of the job list.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn Store>,
}

impl JobQueue {
    /// Queue backed by `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Validate a repository identifier and queue it.
    ///
    /// Returns the normalized identifier.
    pub fn enqueue(&self, repo: &str) -> Result<String> {
        let repo = normalize_repo(repo)?;
        self.store.list_push(keys::QUEUE, repo.as_bytes().to_vec())?;
        let reached = self.store.publish(keys::WAKEUP, Vec::new())?;
        debug!("queued {repo}, woke {reached} workers");
        Ok(repo)
    }

    /// Pop the next repository, `None` when another replica was faster.
    pub fn claim(&self) -> Result<Option<String>> {
        let Some(raw) = self.store.list_pop(keys::QUEUE)? else {
            return Ok(None);
        };
        String::from_utf8(raw)
            .map(Some)
            .map_err(|err| QfarmError::Validation(format!("queued repo is not utf-8: {err}")))
    }

    /// Subscribe to wake-up signals.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Vec<u8>>> {
        self.store.subscribe(keys::WAKEUP)
    }
}

/// Trim surrounding whitespace and trailing slashes, rejecting empty ids.
pub fn normalize_repo(repo: &str) -> Result<String> {
    let repo = repo.trim().trim_end_matches('/');
    if repo.is_empty() {
        return Err(QfarmError::Validation(
            "repository identifier must not be empty".to_string(),
        ));
    }
    Ok(repo.to_string())
}
