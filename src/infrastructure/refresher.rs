//! Periodic refresher
//!
//! Single-shot timer that calls back into a manager to renew a
//! registration-like state (publication, subscription). The callback decides
//! whether to re-arm.

use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Callback invoked when the refresh timer fires
#[async_trait]
pub trait PeriodicProcessing: Send + Sync {
    async fn periodic_processing(&self);
}

#[derive(Default)]
struct RefreshState {
    generation: u64,
    period: Option<Duration>,
    next_fire: Option<Instant>,
    /// Pending timer
    task: Option<JoinHandle<()>>,
    /// Fire whose callback is still running, with its generation
    firing: Option<(u64, JoinHandle<()>)>,
    /// Set when the timer is stopped during a callback; blocks re-arming
    halted: bool,
}

/// Timer that renews some state every N seconds
pub struct PeriodicRefresher {
    name: &'static str,
    target: Weak<dyn PeriodicProcessing>,
    jitter: f64,
    state: Arc<Mutex<RefreshState>>,
}

impl PeriodicRefresher {
    /// The target is held weakly; a dropped manager is never called
    pub fn new(name: &'static str, target: Weak<dyn PeriodicProcessing>) -> Self {
        Self {
            name,
            target,
            jitter: 0.0,
            state: Arc::new(Mutex::new(RefreshState::default())),
        }
    }

    /// Shorten each delay by a random share in `[0, ratio)`
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        lock_state(&self.state)
    }

    /// Arm the timer at `expire_period * factor` seconds, replacing any
    /// pending timer
    pub fn start_timer(&self, expire_period: u32, factor: f64) {
        let mut delay = Duration::from_secs(expire_period as u64).mul_f64(factor.max(0.0));
        if self.jitter > 0.0 {
            let share = rand::thread_rng().gen_range(0.0..self.jitter);
            delay = delay.mul_f64(1.0 - share);
        }

        if delay.is_zero() {
            warn!("{}: refusing to arm a zero delay timer", self.name);
            return;
        }

        let mut state = self.lock();
        if state.halted {
            debug!("{}: stopped during refresh, not re-arming", self.name);
            return;
        }
        state.generation += 1;
        if let Some(previous) = state.task.take() {
            previous.abort();
        }

        let generation = state.generation;
        let shared = self.state.clone();
        let target = self.target.clone();
        let name = self.name;

        state.period = Some(delay);
        state.next_fire = Some(Instant::now() + delay);
        state.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut state = lock_state(&shared);
                if state.generation != generation {
                    return;
                }
                // Keep our handle joinable until the callback returns
                state.firing = state.task.take().map(|task| (generation, task));
                state.next_fire = None;
            }

            match target.upgrade() {
                Some(target) => {
                    debug!("{}: refresh timer fired", name);
                    target.periodic_processing().await;
                }
                None => debug!("{}: owner dropped, timer discarded", name),
            }

            let mut state = lock_state(&shared);
            if matches!(state.firing, Some((fired, _)) if fired == generation) {
                state.firing = None;
                state.halted = false;
            }
        }));

        debug!("{}: timer armed in {:?}", self.name, delay);
    }

    /// Disarm without waiting; safe to call from the refresh callback.
    ///
    /// A callback in flight can no longer re-arm the timer.
    pub fn cancel(&self) -> Option<JoinHandle<()>> {
        let mut state = self.lock();
        state.generation += 1;
        state.next_fire = None;
        if state.firing.is_some() {
            state.halted = true;
        }
        let task = state.task.take();
        if let Some(task) = &task {
            task.abort();
        }
        task
    }

    /// Cancel the pending timer and wait for it, including a callback that
    /// is still running. Must not be called while holding a lock that the
    /// callback takes.
    pub async fn stop_timer(&self) {
        let pending = self.cancel();
        let firing = self.lock().firing.take();

        if pending.is_none() && firing.is_none() {
            return;
        }
        debug!("{}: timer stopped", self.name);
        if let Some(task) = pending {
            let _ = task.await;
        }
        if let Some((_, task)) = firing {
            let _ = task.await;
        }
        self.lock().halted = false;
    }

    pub fn is_armed(&self) -> bool {
        self.lock().task.is_some()
    }

    /// Delay used by the last arm
    pub fn period(&self) -> Option<Duration> {
        self.lock().period
    }

    pub fn next_fire(&self) -> Option<Instant> {
        self.lock().next_fire
    }
}

impl Drop for PeriodicRefresher {
    fn drop(&mut self) {
        if let Some(task) = self.lock().task.take() {
            task.abort();
        }
    }
}

fn lock_state(state: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
