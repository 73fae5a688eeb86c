//! Background polling of the three pipeline stages.
//!
//! Each stage runs in its own task with its own [`PollState`]; stages talk to
//! each other only through the store's pending flags.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::capture::Explainer;
use crate::index::IndexInferenceEngine;
use crate::rules::RuleEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// Wait after a tick that found nothing to do or failed.
    pub idle: Duration,
    /// Wait after a tick that processed work.
    pub drain: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            drain: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle(Duration),
    Draining,
}

impl PollState {
    /// State after a tick; `None` means the tick failed.
    pub fn next(processed: Option<usize>, intervals: &Intervals) -> Self {
        match processed {
            Some(n) if n > 0 => PollState::Draining,
            _ => PollState::Idle(intervals.idle),
        }
    }

    pub fn delay(&self, intervals: &Intervals) -> Duration {
        match self {
            PollState::Idle(delay) => *delay,
            PollState::Draining => intervals.drain,
        }
    }
}

/// A unit of pending work polled by the scheduler.
#[async_trait]
pub trait PollWork: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process what is pending now and report how many items were handled.
    async fn poll(&self) -> Result<usize>;
}

#[async_trait]
impl PollWork for Explainer {
    fn name(&self) -> &'static str {
        "explain"
    }

    async fn poll(&self) -> Result<usize> {
        self.explain_pending().await
    }
}

#[async_trait]
impl PollWork for RuleEngine {
    fn name(&self) -> &'static str {
        "check"
    }

    async fn poll(&self) -> Result<usize> {
        self.check_pending().await
    }
}

#[async_trait]
impl PollWork for IndexInferenceEngine {
    fn name(&self) -> &'static str {
        "index"
    }

    async fn poll(&self) -> Result<usize> {
        Ok(self.drain().await?.processed)
    }
}

/// Run one tick of `work` and compute the following state.
pub async fn tick(work: &dyn PollWork, intervals: &Intervals) -> PollState {
    let processed = match work.poll().await {
        Ok(n) => {
            debug!(task = work.name(), processed = n, "tick");
            Some(n)
        }
        Err(e) => {
            warn!(task = work.name(), error = %e, "tick failed");
            None
        }
    };
    PollState::next(processed, intervals)
}

async fn poll_loop(work: Arc<dyn PollWork>, intervals: Intervals) {
    info!(task = work.name(), "starting");
    loop {
        let state = tick(work.as_ref(), &intervals).await;
        tokio::time::sleep(state.delay(&intervals)).await;
    }
}

pub struct Scheduler {
    work: Vec<Arc<dyn PollWork>>,
    intervals: Intervals,
}

impl Scheduler {
    pub fn new(intervals: Intervals) -> Self {
        Self {
            work: Vec::new(),
            intervals,
        }
    }

    pub fn add(mut self, work: Arc<dyn PollWork>) -> Self {
        self.work.push(work);
        self
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.work.iter().map(|w| w.name()).collect()
    }

    /// Spawn one task per unit of work; returns only if a task dies.
    pub async fn run(self) -> Result<()> {
        let mut tasks = JoinSet::new();
        for work in self.work {
            tasks.spawn(poll_loop(work, self.intervals));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "scheduler task stopped");
                anyhow::bail!("scheduler task stopped: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Work double replaying scripted tick results.
    struct Scripted {
        results: Mutex<Vec<Option<usize>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut results: Vec<Option<usize>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PollWork for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn poll(&self) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.results.lock().unwrap().pop().flatten();
            next.ok_or_else(|| anyhow::anyhow!("store unavailable"))
        }
    }

    fn intervals() -> Intervals {
        Intervals {
            idle: Duration::from_secs(60),
            drain: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_state_transitions() {
        let intervals = intervals();
        assert_eq!(PollState::next(Some(3), &intervals), PollState::Draining);
        assert_eq!(
            PollState::next(Some(0), &intervals),
            PollState::Idle(Duration::from_secs(60))
        );
        assert_eq!(
            PollState::next(None, &intervals),
            PollState::Idle(Duration::from_secs(60))
        );
        assert_eq!(PollState::Draining.delay(&intervals), Duration::from_millis(100));
        assert_eq!(
            PollState::Idle(Duration::from_secs(5)).delay(&intervals),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_default_intervals() {
        assert_eq!(Intervals::default(), intervals());
    }

    #[tokio::test]
    async fn test_tick_follows_work_results() {
        let work = Scripted::new(vec![Some(30), Some(5), Some(0), None]);
        let intervals = intervals();

        assert_eq!(tick(&work, &intervals).await, PollState::Draining);
        assert_eq!(tick(&work, &intervals).await, PollState::Draining);
        assert_eq!(tick(&work, &intervals).await, PollState::Idle(intervals.idle));
        // errors back off like an empty tick
        assert_eq!(tick(&work, &intervals).await, PollState::Idle(intervals.idle));
        assert_eq!(work.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_scheduler_polls_every_task() {
        let a = Arc::new(Scripted::new(vec![Some(1); 100]));
        let b = Arc::new(Scripted::new(vec![Some(0); 100]));
        let scheduler = Scheduler::new(Intervals {
            idle: Duration::from_millis(5),
            drain: Duration::from_millis(1),
        })
        .add(a.clone())
        .add(b.clone());
        assert_eq!(scheduler.task_names(), vec!["scripted", "scripted"]);

        let _ = tokio::time::timeout(Duration::from_millis(100), scheduler.run()).await;
        assert!(a.calls.load(Ordering::SeqCst) >= 2);
        assert!(b.calls.load(Ordering::SeqCst) >= 2);
    }
}
