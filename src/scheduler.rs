use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant, MissedTickBehavior};

pub type ExecutorFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
pub type Executor = Arc<dyn Fn() -> ExecutorFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ScheduledPass {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub failed: bool,
}

/// In-process trigger for the batch sync.
///
/// Passes run one at a time on a single task. Requests made while a pass is running
/// collapse into one follow-up pass.
#[derive(Clone)]
pub struct SyncScheduler {
    notify: Arc<Notify>,
    executor: Arc<RwLock<Option<Executor>>>,
    last_pass: Arc<Mutex<Option<ScheduledPass>>>,
    interval: Option<Duration>,
}

impl SyncScheduler {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            executor: Arc::new(RwLock::new(None)),
            last_pass: Arc::new(Mutex::new(None)),
            interval,
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        let mut writer = match self.executor.write() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        *writer = Some(executor);
    }

    pub fn request_run(&self) {
        self.notify.notify_one();
    }

    pub async fn last_pass(&self) -> Option<ScheduledPass> {
        self.last_pass.lock().await.clone()
    }

    pub fn start(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        });
    }

    async fn run_loop(self) {
        let mut ticker = self.interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            match ticker.as_mut() {
                Some(ticker) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = ticker.tick() => {}
                    }
                }
                None => self.notify.notified().await,
            }

            let started_at = Utc::now();
            let failed = self.execute().await;
            if failed {
                tracing::warn!("scheduled sync pass finished with failures");
            }
            let mut last = self.last_pass.lock().await;
            *last = Some(ScheduledPass {
                started_at,
                finished_at: Utc::now(),
                failed,
            });
        }
    }

    async fn execute(&self) -> bool {
        let executor = match self.executor.read() {
            Ok(reader) => reader.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match executor {
            Some(executor) => executor().await,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutorFuture, SyncScheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;
    use tokio::time::{timeout, Duration};

    fn counting_scheduler(interval: Option<Duration>) -> (SyncScheduler, Arc<AtomicUsize>, Arc<Notify>) {
        let scheduler = SyncScheduler::new(interval);
        let calls = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());
        let (calls_in, done_in) = (calls.clone(), done.clone());
        scheduler.set_executor(Arc::new(move || -> ExecutorFuture {
            let calls = calls_in.clone();
            let done = done_in.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                done.notify_one();
                false
            })
        }));
        (scheduler, calls, done)
    }

    #[tokio::test]
    async fn requested_run_executes_and_is_recorded() {
        let (scheduler, calls, done) = counting_scheduler(None);
        scheduler.start();
        scheduler.request_run();

        timeout(Duration::from_secs(2), done.notified()).await.expect("pass ran");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let pass = scheduler.last_pass().await.expect("pass recorded");
        assert!(!pass.failed);
        assert!(pass.finished_at >= pass.started_at);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_triggers_without_request() {
        let (scheduler, calls, done) = counting_scheduler(Some(Duration::from_secs(60)));
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        timeout(Duration::from_secs(120), done.notified()).await.expect("interval pass");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_executor_counts_as_failure() {
        let scheduler = SyncScheduler::new(None);
        assert!(scheduler.execute().await);
    }
}
