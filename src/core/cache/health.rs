// src/core/cache/health.rs

//! Health tracking for a cache directory.
//!
//! Each directory is `normal`, `unstable` or `down`:
//!
//! - `normal` counts I/O errors and resets the count every `normal_tick`. Reaching
//!   `io_errors_to_unstable` errors demotes the directory to `unstable`.
//! - `unstable` limits concurrent cache operations, probes the disk with a tiny
//!   canary block every `probe_interval`, and on each `unstable_tick` either
//!   promotes the directory back to `normal` (enough operations with a low error
//!   ratio), takes it `down` (unstable for longer than `max_duration_to_down`), or
//!   starts a new observation window.
//! - `down` rejects every operation. Only [`DiskHealth::reset`] leaves it.
//!
//! Every state instance owns a [`CancellationToken`]; its background tasks stop
//! when the token is cancelled, which happens before the next state is installed.

use crate::config::DiskHealthConfig;
use crate::core::errors::{ChunkStoreError, Result};
use crate::core::metrics::DISK_CACHE_STATE;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strum_macros::Display;
use tokio::runtime::Handle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DiskState {
    Normal,
    Unstable,
    Down,
}

impl DiskState {
    fn gauge_value(self) -> f64 {
        match self {
            DiskState::Normal => 0.0,
            DiskState::Unstable => 1.0,
            DiskState::Down => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    ToNormal,
    ToUnstable,
    ToDown,
}

/// The disk behind a health state machine, as seen by the unstable-state prober.
pub trait DiskProbe: Send + Sync + 'static {
    /// Writes, reads back and deletes a canary block numbered `seq`.
    fn probe(&self, seq: u64) -> Result<()>;
    /// Removes leftovers of earlier probes.
    fn clear_probes(&self);
}

/// One live state. Counters belong to the instance, so a task of a replaced state
/// can never affect its successor.
struct StateInstance {
    kind: DiskState,
    started: Instant,
    io_errs: AtomicU32,
    io_cnt: AtomicU32,
    concurrency: AtomicI64,
    cancel: CancellationToken,
}

impl StateInstance {
    fn new(kind: DiskState) -> Arc<Self> {
        Arc::new(Self {
            kind,
            started: Instant::now(),
            io_errs: AtomicU32::new(0),
            io_cnt: AtomicU32::new(0),
            concurrency: AtomicI64::new(0),
            cancel: CancellationToken::new(),
        })
    }
}

/// A slot held by an in-flight cache operation on an unstable directory.
/// Dropping it frees the slot.
pub struct OpGuard {
    state: Option<Arc<StateInstance>>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.concurrency.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

pub struct DiskHealth {
    dir: String,
    config: DiskHealthConfig,
    current: Mutex<Arc<StateInstance>>,
    prober: Weak<dyn DiskProbe>,
    handle: Handle,
    me: Weak<DiskHealth>,
}

impl DiskHealth {
    /// Creates a state machine in the `normal` state. Background tasks of every
    /// state are spawned onto `handle`.
    pub fn new(
        dir: impl Into<String>,
        config: DiskHealthConfig,
        prober: Weak<dyn DiskProbe>,
        handle: Handle,
    ) -> Arc<Self> {
        let dir = dir.into();
        DISK_CACHE_STATE
            .with_label_values(&[dir.as_str()])
            .set(DiskState::Normal.gauge_value());
        Arc::new_cyclic(|me: &Weak<DiskHealth>| {
            let initial = StateInstance::new(DiskState::Normal);
            spawn_state_tasks(&handle, me.clone(), &config, prober.clone(), &initial);
            DiskHealth {
                dir,
                config,
                current: Mutex::new(initial),
                prober,
                handle,
                me: me.clone(),
            }
        })
    }

    pub fn state(&self) -> DiskState {
        self.current.lock().kind
    }

    fn current(&self) -> Arc<StateInstance> {
        self.current.lock().clone()
    }

    /// Admits a cache operation, returning a guard that must live for its duration.
    pub fn check_op(&self) -> Result<OpGuard> {
        let state = self.current();
        match state.kind {
            DiskState::Normal => Ok(OpGuard { state: None }),
            DiskState::Down => Err(ChunkStoreError::CacheDown),
            DiskState::Unstable => {
                let limit = self.config.max_concurrency_for_unstable;
                state
                    .concurrency
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < limit).then_some(n + 1)
                    })
                    .map_err(|_| ChunkStoreError::CacheOverloaded(limit))?;
                Ok(OpGuard { state: Some(state) })
            }
        }
    }

    pub fn on_io_err(&self) {
        let state = self.current();
        match state.kind {
            DiskState::Normal => {
                let errs = state.io_errs.fetch_add(1, Ordering::AcqRel) + 1;
                if errs >= self.config.io_errors_to_unstable {
                    self.transition(&state, HealthEvent::ToUnstable);
                }
            }
            DiskState::Unstable => {
                state.io_cnt.fetch_add(1, Ordering::AcqRel);
                state.io_errs.fetch_add(1, Ordering::AcqRel);
            }
            DiskState::Down => {}
        }
    }

    pub fn on_io_succ(&self) {
        let state = self.current();
        if state.kind == DiskState::Unstable {
            state.io_cnt.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Records the outcome of a disk operation that began at `started`. Failures
    /// and operations slower than `max_io_duration` count as errors.
    pub fn record<T>(&self, started: Instant, result: &Result<T>) {
        let failed = match result {
            Ok(_) => false,
            Err(e) => e.is_io_failure(),
        };
        if failed || started.elapsed() > self.config.max_io_duration {
            self.on_io_err();
        } else if result.is_ok() {
            self.on_io_succ();
        }
    }

    /// Applies `event` to whatever state is current.
    pub fn event(&self, event: HealthEvent) {
        let state = self.current();
        self.transition(&state, event);
    }

    /// Administrative recovery: returns the directory to `normal` from any state.
    pub fn reset(&self) {
        let mut current = self.current.lock();
        let from = current.kind;
        *current = self.install(&current, DiskState::Normal);
        info!("disk cache {} state reset from {} to normal", self.dir, from);
    }

    /// Stops the background tasks of the current state.
    pub fn stop(&self) {
        self.current.lock().cancel.cancel();
    }

    /// Moves from `from` according to `event`, unless `from` is no longer the
    /// current state.
    fn transition(&self, from: &Arc<StateInstance>, event: HealthEvent) {
        let mut current = self.current.lock();
        if !Arc::ptr_eq(&current, from) {
            debug!(
                "disk cache {}: ignoring {:?} from a replaced {} state",
                self.dir, event, from.kind
            );
            return;
        }
        let next = match (current.kind, event) {
            (DiskState::Normal, HealthEvent::ToUnstable) => DiskState::Unstable,
            (DiskState::Unstable, HealthEvent::ToNormal) => DiskState::Normal,
            (DiskState::Unstable, HealthEvent::ToDown) => DiskState::Down,
            _ => return,
        };
        let prev = current.kind;
        *current = self.install(&current, next);
        if next == DiskState::Down {
            warn!(
                "disk cache {} state change from {} to {}",
                self.dir, prev, next
            );
        } else {
            info!(
                "disk cache {} state change from {} to {}",
                self.dir, prev, next
            );
        }
    }

    /// Stops `old` and builds the next state. Called with the state lock held.
    fn install(&self, old: &Arc<StateInstance>, next: DiskState) -> Arc<StateInstance> {
        old.cancel.cancel();
        if next == DiskState::Normal
            && let Some(prober) = self.prober.upgrade()
        {
            prober.clear_probes();
        }
        let instance = StateInstance::new(next);
        spawn_state_tasks(
            &self.handle,
            self.me.clone(),
            &self.config,
            self.prober.clone(),
            &instance,
        );
        DISK_CACHE_STATE
            .with_label_values(&[self.dir.as_str()])
            .set(next.gauge_value());
        instance
    }
}

impl Drop for DiskHealth {
    fn drop(&mut self) {
        self.current.get_mut().cancel.cancel();
    }
}

fn spawn_state_tasks(
    handle: &Handle,
    health: Weak<DiskHealth>,
    config: &DiskHealthConfig,
    prober: Weak<dyn DiskProbe>,
    state: &Arc<StateInstance>,
) {
    match state.kind {
        DiskState::Normal => {
            handle.spawn(normal_ticker(state.clone(), config.normal_tick));
        }
        DiskState::Unstable => {
            handle.spawn(unstable_ticker(
                health,
                state.clone(),
                config.clone(),
            ));
            handle.spawn(probe_loop(prober, state.clone(), config.probe_interval));
        }
        DiskState::Down => {}
    }
}

/// Clears the error count of a normal state every `tick`.
async fn normal_ticker(state: Arc<StateInstance>, tick: Duration) {
    let mut interval = interval_at(Instant::now() + tick, tick);
    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => return,
            _ = interval.tick() => {
                state.io_errs.store(0, Ordering::Release);
            }
        }
    }
}

/// Decides, once per tick, whether an unstable directory recovers or goes down.
async fn unstable_ticker(
    health: Weak<DiskHealth>,
    state: Arc<StateInstance>,
    config: DiskHealthConfig,
) {
    let tick = config.unstable_tick;
    let mut interval = interval_at(Instant::now() + tick, tick);
    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => return,
            _ = interval.tick() => {
                let Some(health) = health.upgrade() else { return };
                let errs = state.io_errs.load(Ordering::Acquire);
                let cnt = state.io_cnt.load(Ordering::Acquire);
                if cnt > 0
                    && cnt >= config.min_io_success_to_normal
                    && errs as f64 / cnt as f64 <= config.max_io_error_ratio_to_normal
                {
                    health.transition(&state, HealthEvent::ToNormal);
                } else if state.started.elapsed() >= config.max_duration_to_down {
                    health.transition(&state, HealthEvent::ToDown);
                } else {
                    debug!(
                        "disk cache {} still unstable: {} errors in {} operations",
                        health.dir, errs, cnt
                    );
                    state.io_errs.store(0, Ordering::Release);
                    state.io_cnt.store(0, Ordering::Release);
                }
            }
        }
    }
}

/// Probes the disk at a fixed pace, independently of real traffic.
async fn probe_loop(prober: Weak<dyn DiskProbe>, state: Arc<StateInstance>, every: Duration) {
    let mut seq = 0u64;
    loop {
        if state.cancel.is_cancelled() {
            return;
        }
        seq += 1;
        let start = Instant::now();
        let Some(target) = prober.upgrade() else { return };
        let outcome = tokio::task::spawn_blocking(move || target.probe(seq)).await;
        if state.cancel.is_cancelled() {
            return;
        }
        match outcome {
            Ok(Ok(())) => {
                state.io_cnt.fetch_add(1, Ordering::AcqRel);
            }
            Ok(Err(e)) => {
                debug!("probe {} failed: {}", seq, e);
                state.io_cnt.fetch_add(1, Ordering::AcqRel);
                state.io_errs.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => {
                warn!("probe task {} failed: {}", seq, e);
            }
        }
        let wait = every.saturating_sub(start.elapsed());
        tokio::select! {
            _ = state.cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
