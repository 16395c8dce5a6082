// src/core/prefetch.rs

//! Best-effort background fetching of whole blocks.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Fetches one key. Errors are the callback's own business.
pub type FetchFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// A fixed pool of workers fed by a bounded queue. Requests for a key that is
/// already queued or being fetched, and requests that find the queue full, are
/// dropped.
pub struct Prefetcher {
    tx: Option<mpsc::Sender<String>>,
    busy: Arc<Mutex<HashSet<String>>>,
}

impl Prefetcher {
    /// Starts `parallelism` workers. With zero workers every `fetch` is a no-op.
    /// Workers stop on `shutdown_tx`.
    pub fn new(
        parallelism: usize,
        queue_capacity: usize,
        f: FetchFn,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Self {
        let busy = Arc::new(Mutex::new(HashSet::new()));
        if parallelism == 0 {
            return Self { tx: None, busy };
        }
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..parallelism {
            tokio::spawn(worker(
                rx.clone(),
                busy.clone(),
                f.clone(),
                shutdown_tx.subscribe(),
            ));
        }
        Self { tx: Some(tx), busy }
    }

    pub fn fetch(&self, key: String) {
        let Some(tx) = &self.tx else {
            return;
        };
        let mut busy = self.busy.lock();
        if busy.contains(&key) {
            return;
        }
        match tx.try_send(key.clone()) {
            Ok(()) => {
                busy.insert(key);
            }
            Err(_) => debug!("prefetch queue is full, skip {}", key),
        }
    }

    /// Keys queued or being fetched.
    pub fn pending(&self) -> usize {
        self.busy.lock().len()
    }
}

async fn worker(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    busy: Arc<Mutex<HashSet<String>>>,
    f: FetchFn,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let key = tokio::select! {
            key = async { rx.lock().await.recv().await } => match key {
                Some(key) => key,
                None => return,
            },
            _ = shutdown_rx.recv() => return,
        };
        f(key.clone()).await;
        busy.lock().remove(&key);
    }
}
