use crate::events::SourceId;
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Wake this long before a deadline and finish the wait in short steps
const COARSE_MARGIN: Duration = Duration::from_secs(2);
const FINE_STEP: Duration = Duration::from_millis(400);
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Something the scheduler can ask to run one poll cycle for a source
pub trait PollTarget: Send + Sync {
    fn poll<'a>(&'a self, id: SourceId) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// When the first poll of a new schedule happens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStart {
    /// Poll right away, then once per period
    Immediate,
    /// Wait one full period before the first poll
    AfterInterval,
}

struct ScheduledTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// One cancellable periodic timer per polling source
///
/// Each timer runs as its own task. Deadlines sit on a fixed grid measured
/// from the schedule's start, so time spent inside a poll cycle does not push
/// later polls back. A grid point that has already passed when a cycle ends
/// is skipped rather than polled late.
pub struct RefreshScheduler {
    runtime: Handle,
    tasks: Mutex<HashMap<SourceId, ScheduledTask>>,
}

impl RefreshScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling `id` every `period`, replacing any existing schedule
    ///
    /// # Arguments
    ///
    /// * `id` - Source to poll
    /// * `period` - Interval between polls; clamped to at least one second
    /// * `start` - Whether the first poll happens now or after one period
    /// * `target` - Poll target; the timer stops once it has been dropped
    pub fn schedule(
        &self,
        id: SourceId,
        period: Duration,
        start: ScheduleStart,
        target: Weak<dyn PollTarget>,
    ) {
        let period = period.max(MIN_PERIOD);
        let token = CancellationToken::new();
        let handle = self
            .runtime
            .spawn(run_schedule(id, period, start, target, token.clone()));

        let previous = self.lock().insert(id, ScheduledTask { token, handle });
        if let Some(previous) = previous {
            stop(previous);
        }
        debug!("{}: Scheduled every {}s", id, period.as_secs());
    }

    /// Stop the timer for `id`
    ///
    /// Once this returns no further poll is started for `id`; a poll already
    /// in progress is aborted at its next suspension point.
    ///
    /// # Returns
    ///
    /// `true` if a timer was registered for `id`
    pub fn cancel(&self, id: SourceId) -> bool {
        match self.lock().remove(&id) {
            Some(task) => {
                stop(task);
                debug!("{}: Schedule cancelled", id);
                true
            }
            None => false,
        }
    }

    /// Whether `id` has a live timer
    pub fn is_scheduled(&self, id: SourceId) -> bool {
        self.lock()
            .get(&id)
            .is_some_and(|task| !task.handle.is_finished())
    }

    pub fn scheduled_ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self
            .lock()
            .iter()
            .filter(|(_, task)| !task.handle.is_finished())
            .map(|(&id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    /// Stop every timer
    pub fn cancel_all(&self) {
        let tasks: Vec<ScheduledTask> = self.lock().drain().map(|(_, task)| task).collect();
        let count = tasks.len();
        tasks.into_iter().for_each(stop);
        debug!("Cancelled {} schedule(s)", count);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SourceId, ScheduledTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn stop(task: ScheduledTask) {
    task.token.cancel();
    task.handle.abort();
}

async fn run_schedule(
    id: SourceId,
    period: Duration,
    start: ScheduleStart,
    target: Weak<dyn PollTarget>,
    token: CancellationToken,
) {
    let mut deadline = match start {
        ScheduleStart::Immediate => Instant::now(),
        ScheduleStart::AfterInterval => Instant::now() + period,
    };

    loop {
        if !wait_until(deadline, &token).await {
            return;
        }
        let Some(target) = target.upgrade() else {
            debug!("{}: Poll target dropped, stopping schedule", id);
            return;
        };

        tokio::select! {
            _ = token.cancelled() => return,
            _ = target.poll(id) => {}
        }
        drop(target);

        deadline = next_deadline(deadline, period, Instant::now());
    }
}

/// First grid point after `now`, stepping from `previous` by `period`
fn next_deadline(previous: Instant, period: Duration, now: Instant) -> Instant {
    let mut next = previous + period;
    while next <= now {
        next += period;
    }
    next
}

/// Sleep until `deadline`, coarsely then in short steps
///
/// # Returns
///
/// `false` if the token was cancelled before the deadline
async fn wait_until(deadline: Instant, token: &CancellationToken) -> bool {
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }

        let remaining = deadline - now;
        let nap = if remaining > COARSE_MARGIN {
            remaining - COARSE_MARGIN
        } else {
            FINE_STEP.min(remaining)
        };

        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(nap) => {}
        }
    }
}
