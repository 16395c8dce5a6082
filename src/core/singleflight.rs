// src/core/singleflight.rs

//! Coalesces concurrent calls for the same key into a single execution.

use crate::core::errors::{ChunkStoreError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::watch;

type Slot<T> = watch::Receiver<Option<Result<T>>>;

/// Runs at most one call per key at a time. Callers that arrive while a call is
/// in flight wait for it and receive a clone of its result; the next call after
/// it finishes runs again.
pub struct Controller<T> {
    calls: Mutex<HashMap<String, Slot<T>>>,
}

impl<T> Default for Controller<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<T> {
    Leader(watch::Sender<Option<Result<T>>>),
    Waiter(Slot<T>),
}

/// Unregisters the leader's key however its future ends, including cancellation.
struct LeaderGuard<'a, T> {
    calls: &'a Mutex<HashMap<String, Slot<T>>>,
    key: &'a str,
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        self.calls.lock().remove(self.key);
    }
}

impl<T: Clone> Controller<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    pub async fn execute<F, Fut>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let role = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(rx) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let guard = LeaderGuard {
                    calls: &self.calls,
                    key,
                };
                let result = f().await;
                tx.send_replace(Some(result.clone()));
                drop(guard);
                result
            }
            Role::Waiter(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(value) => value.as_ref().cloned().unwrap_or_else(|| {
                    Err(ChunkStoreError::Internal(format!("no result for {key}")))
                }),
                Err(_) => Err(ChunkStoreError::Internal(format!(
                    "in-flight call for {key} was abandoned"
                ))),
            },
        }
    }
}
