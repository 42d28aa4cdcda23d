//! Is-composing activity (RFC 3994)
//!
//! Turns local keystrokes into `active`/`idle` indications with two timers:
//! an idle timeout re-armed on every keystroke, and a refresh that repeats
//! `active` while the user keeps typing.

use crate::domain::instant_messaging::IsComposingInfo;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where indications go
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComposingSender: Send + Sync {
    async fn send_is_composing(&self, info: IsComposingInfo) -> crate::domain::shared::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposingState {
    Idle,
    Starting,
    Active,
}

#[derive(Default)]
struct Timer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    fn cancel(&mut self) -> Option<JoinHandle<()>> {
        self.generation += 1;
        let task = self.task.take();
        if let Some(task) = &task {
            task.abort();
        }
        task
    }
}

struct ComposingInner {
    state: ComposingState,
    idle: Timer,
    refresh: Timer,
}

#[derive(Clone, Copy)]
enum TimerKind {
    Idle,
    Refresh,
}

pub struct IsComposingManager {
    sender: Arc<dyn ComposingSender>,
    idle_timeout: Duration,
    refresh_period: u32,
    inner: Mutex<ComposingInner>,
    weak: Weak<Self>,
}

impl IsComposingManager {
    pub fn new(
        sender: Arc<dyn ComposingSender>,
        idle_timeout: Duration,
        refresh_period: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sender,
            idle_timeout,
            refresh_period,
            inner: Mutex::new(ComposingInner {
                state: ComposingState::Idle,
                idle: Timer::default(),
                refresh: Timer::default(),
            }),
            weak: weak.clone(),
        })
    }

    pub async fn state(&self) -> ComposingState {
        self.inner.lock().await.state
    }

    /// The local user typed something
    pub async fn handle_keystroke(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ComposingState::Idle => {
                inner.state = ComposingState::Starting;
                self.send(IsComposingInfo::active(self.refresh_period)).await;
                self.arm(&mut inner, TimerKind::Idle);
                self.arm(&mut inner, TimerKind::Refresh);
                inner.state = ComposingState::Active;
                debug!("Composing started");
            }
            ComposingState::Starting | ComposingState::Active => {
                self.arm(&mut inner, TimerKind::Idle);
            }
        }
    }

    /// A message went out; the peer clears its indicator on its own
    pub async fn message_sent(&self) {
        let mut inner = self.inner.lock().await;
        inner.idle.cancel();
        inner.refresh.cancel();
        inner.state = ComposingState::Idle;
    }

    /// Cancel both timers and wait for them
    pub async fn stop(&self) {
        let tasks = {
            let mut inner = self.inner.lock().await;
            inner.state = ComposingState::Idle;
            [inner.idle.cancel(), inner.refresh.cancel()]
        };
        for task in tasks.into_iter().flatten() {
            let _ = task.await;
        }
    }

    fn arm(&self, inner: &mut ComposingInner, kind: TimerKind) {
        let delay = match kind {
            TimerKind::Idle => self.idle_timeout,
            TimerKind::Refresh => Duration::from_secs(self.refresh_period as u64),
        };
        let timer = match kind {
            TimerKind::Idle => &mut inner.idle,
            TimerKind::Refresh => &mut inner.refresh,
        };
        timer.cancel();

        let generation = timer.generation;
        let weak = self.weak.clone();
        timer.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.on_timer(kind, generation).await;
            }
        }));
    }

    async fn on_timer(&self, kind: TimerKind, generation: u64) {
        let mut inner = self.inner.lock().await;
        let timer = match kind {
            TimerKind::Idle => &mut inner.idle,
            TimerKind::Refresh => &mut inner.refresh,
        };
        if timer.generation != generation {
            return;
        }
        // Our own handle; dropping it detaches this task
        timer.task = None;

        if inner.state != ComposingState::Active {
            return;
        }
        match kind {
            TimerKind::Idle => {
                debug!("Composing idle timeout");
                inner.refresh.cancel();
                inner.state = ComposingState::Idle;
                self.send(IsComposingInfo::idle()).await;
            }
            TimerKind::Refresh => {
                debug!("Composing refresh");
                self.send(IsComposingInfo::active(self.refresh_period)).await;
                self.arm(&mut inner, TimerKind::Refresh);
            }
        }
    }

    async fn send(&self, info: IsComposingInfo) {
        if let Err(e) = self.sender.send_is_composing(info).await {
            warn!("Failed to send is-composing: {}", e);
        }
    }
}

impl Drop for IsComposingManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.idle.cancel();
        inner.refresh.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instant_messaging::ComposingIndication;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<ComposingIndication>>);

    #[async_trait]
    impl ComposingSender for Recorder {
        async fn send_is_composing(&self, info: IsComposingInfo) -> crate::domain::shared::Result<()> {
            self.0.lock().unwrap().push(info.state);
            Ok(())
        }
    }

    fn manager() -> (Arc<Recorder>, Arc<IsComposingManager>) {
        let recorder = Arc::new(Recorder::default());
        let manager = IsComposingManager::new(recorder.clone(), Duration::from_secs(5), 60);
        (recorder, manager)
    }

    fn sent(recorder: &Recorder) -> Vec<ComposingIndication> {
        recorder.0.lock().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystrokes_send_single_active() {
        let (recorder, manager) = manager();

        for _ in 0..4 {
            manager.handle_keystroke().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        assert_eq!(sent(&recorder), vec![ComposingIndication::Active]);
        assert_eq!(manager.state().await, ComposingState::Active);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(
            sent(&recorder),
            vec![ComposingIndication::Active, ComposingIndication::Idle]
        );
        assert_eq!(manager.state().await, ComposingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_repeats_active() {
        let (recorder, manager) = manager();

        // Keep typing every 4s for 70s
        for _ in 0..18 {
            manager.handle_keystroke().await;
            tokio::time::sleep(Duration::from_secs(4)).await;
        }
        assert_eq!(
            sent(&recorder),
            vec![ComposingIndication::Active, ComposingIndication::Active]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_sent_cancels_without_idle() {
        let (recorder, manager) = manager();
        manager.handle_keystroke().await;
        manager.message_sent().await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(sent(&recorder), vec![ComposingIndication::Active]);
        assert_eq!(manager.state().await, ComposingState::Idle);

        manager.handle_keystroke().await;
        assert_eq!(sent(&recorder).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timers() {
        let mut sender = MockComposingSender::new();
        sender.expect_send_is_composing().times(1).returning(|_| Ok(()));
        let manager = IsComposingManager::new(Arc::new(sender), Duration::from_secs(5), 60);

        manager.handle_keystroke().await;
        manager.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(manager.state().await, ComposingState::Idle);
    }
}
