//! Periodic retrieval tasks.
//!
//! Each poll kind has at most one live task. A task ticks every
//! `interval` (the first tick one interval after start), and stops when its
//! tick reports [`TickOutcome::Done`] or its token is cancelled. Cancelling
//! never interrupts a tick already in flight; it only prevents the next one.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollKind {
    Offer,
    Answer,
    Candidates,
}

impl PollKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PollKind::Offer => "offer",
            PollKind::Answer => "answer",
            PollKind::Candidates => "candidates",
        }
    }
}

impl fmt::Display for PollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Done,
}

struct PollHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !self.task.is_finished()
    }
}

#[derive(Default)]
struct Registry {
    handles: HashMap<PollKind, PollHandle>,
    sealed: bool,
}

/// Owns the poll tasks of one session.
#[derive(Clone)]
pub struct PollScheduler {
    interval: Duration,
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        let active: Vec<PollKind> = registry
            .handles
            .iter()
            .filter(|(_, handle)| handle.is_live())
            .map(|(kind, _)| *kind)
            .collect();
        f.debug_struct("PollScheduler")
            .field("interval", &self.interval)
            .field("active", &active)
            .field("sealed", &registry.sealed)
            .finish()
    }
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts a poll of `kind` running `tick` on every interval. Returns
    /// `false` without spawning anything when a poll of that kind is already
    /// running, the scheduler has been sealed or its interval is zero.
    pub fn start<F, Fut>(&self, kind: PollKind, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickOutcome> + Send + 'static,
    {
        if self.interval.is_zero() {
            tracing::warn!(target = "pollrtc::poll", poll = %kind, "zero poll interval; not starting");
            return false;
        }
        let mut registry = self.registry.lock();
        if registry.sealed {
            tracing::debug!(target = "pollrtc::poll", poll = %kind, "scheduler sealed; not starting");
            return false;
        }
        if registry.handles.get(&kind).is_some_and(PollHandle::is_live) {
            tracing::trace!(target = "pollrtc::poll", poll = %kind, "poll already running");
            return false;
        }
        if let Some(stale) = registry.handles.remove(&kind) {
            stale.token.cancel();
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tracing::trace!(target = "pollrtc::poll", poll = %kind, await = "tick", state = "start");
                let outcome = tick().await;
                tracing::trace!(
                    target = "pollrtc::poll",
                    poll = %kind,
                    await = "tick",
                    state = "end",
                    outcome = ?outcome
                );
                if outcome == TickOutcome::Done {
                    task_token.cancel();
                    break;
                }
            }
            tracing::debug!(target = "pollrtc::poll", poll = %kind, "poll stopped");
        });
        registry.handles.insert(kind, PollHandle { token, task });
        tracing::debug!(target = "pollrtc::poll", poll = %kind, interval_ms = period.as_millis() as u64, "poll started");
        true
    }

    /// Stops the poll of `kind`, if any. Returns whether one was live.
    pub fn cancel(&self, kind: PollKind) -> bool {
        match self.registry.lock().handles.remove(&kind) {
            Some(handle) => {
                let live = handle.is_live();
                handle.token.cancel();
                live
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let mut registry = self.registry.lock();
        for (_, handle) in registry.handles.drain() {
            handle.token.cancel();
        }
    }

    /// Cancels every poll and refuses all later starts.
    pub fn seal(&self) {
        let mut registry = self.registry.lock();
        registry.sealed = true;
        for (_, handle) in registry.handles.drain() {
            handle.token.cancel();
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.registry.lock().sealed
    }

    pub fn is_active(&self, kind: PollKind) -> bool {
        self.registry
            .lock()
            .handles
            .get(&kind)
            .is_some_and(PollHandle::is_live)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tick(
        counter: &Arc<AtomicUsize>,
        done_after: usize,
    ) -> impl FnMut() -> std::future::Ready<TickOutcome> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if seen >= done_after {
                TickOutcome::Done
            } else {
                TickOutcome::Continue
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_interval() {
        let scheduler = PollScheduler::new(Duration::from_millis(1000));
        let ticks = Arc::new(AtomicUsize::new(0));
        assert!(scheduler.start(PollKind::Candidates, counting_tick(&ticks, usize::MAX)));

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        scheduler.cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn done_stops_the_poll() {
        let scheduler = PollScheduler::new(Duration::from_millis(100));
        let ticks = Arc::new(AtomicUsize::new(0));
        scheduler.start(PollKind::Answer, counting_tick(&ticks, 3));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_active(PollKind::Answer));
    }

    #[tokio::test(start_paused = true)]
    async fn starting_a_running_poll_is_a_no_op() {
        let scheduler = PollScheduler::new(Duration::from_millis(100));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        assert!(scheduler.start(PollKind::Offer, counting_tick(&first, usize::MAX)));
        assert!(!scheduler.start(PollKind::Offer, counting_tick(&second, usize::MAX)));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(first.load(Ordering::SeqCst), 3);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        scheduler.cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn seal_cancels_and_blocks_restarts() {
        let scheduler = PollScheduler::new(Duration::from_millis(100));
        let ticks = Arc::new(AtomicUsize::new(0));
        scheduler.start(PollKind::Candidates, counting_tick(&ticks, usize::MAX));
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.seal();

        assert!(!scheduler.is_active(PollKind::Candidates));
        assert!(!scheduler.start(PollKind::Candidates, counting_tick(&ticks, usize::MAX)));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_never_spawns() {
        let scheduler = PollScheduler::new(Duration::ZERO);
        let ticks = Arc::new(AtomicUsize::new(0));
        assert!(!scheduler.start(PollKind::Answer, counting_tick(&ticks, usize::MAX)));
        assert!(!scheduler.is_active(PollKind::Answer));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_poll_can_be_restarted() {
        let scheduler = PollScheduler::new(Duration::from_millis(100));
        let ticks = Arc::new(AtomicUsize::new(0));
        scheduler.start(PollKind::Candidates, counting_tick(&ticks, usize::MAX));
        assert!(scheduler.cancel(PollKind::Candidates));
        assert!(!scheduler.cancel(PollKind::Candidates));
        assert!(scheduler.start(PollKind::Candidates, counting_tick(&ticks, usize::MAX)));
        assert!(scheduler.is_active(PollKind::Candidates));
        scheduler.cancel_all();
    }
}
