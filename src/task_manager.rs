use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct TaskInfo {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub status: TaskStatus,
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// What a background job reports back to the manager.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TaskOutcome {
    Done,
    Failed,
}

/// Stop flag shared between the manager, its jobs and the external tools
/// those jobs launch.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Shared {
    info: Mutex<TaskInfo>,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TaskInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) {
        let mut info = self.lock();
        info.pending += 1;
        if info.status == TaskStatus::Idle {
            info.status = TaskStatus::Running;
        }
    }

    fn finish(&self, outcome: Option<TaskOutcome>) {
        let mut info = self.lock();
        info.pending = info.pending.saturating_sub(1);
        match outcome {
            Some(TaskOutcome::Done) => info.completed += 1,
            Some(TaskOutcome::Failed) => info.failed += 1,
            None => info.cancelled += 1,
        }
        if info.pending == 0 {
            if info.status == TaskStatus::Running {
                info.status = TaskStatus::Idle;
            }
            self.idle.notify_all();
        }
    }
}

/// Bounded worker pool for preview generation and rescans.
///
/// The pool runs at most `workers` jobs at once; anything submitted beyond
/// that waits in rayon's injector queue until a worker frees up.
pub struct TaskManager {
    pool: rayon::ThreadPool,
    shared: Arc<Shared>,
    cancel: CancelToken,
}

impl TaskManager {
    /// `workers == 0` sizes the pool to the number of available cores.
    pub fn new(workers: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            workers
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("preview-worker-{}", i))
            .build()?;

        debug!("Task manager started with {} workers", workers);

        Ok(Self {
            pool,
            shared: Arc::new(Shared {
                info: Mutex::new(TaskInfo::default()),
                idle: Condvar::new(),
            }),
            cancel: CancelToken::new(),
        })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queues `job` on the pool. Jobs that start after `stop` are skipped and
    /// counted as cancelled.
    pub fn spawn<F>(&self, label: impl Into<String>, job: F)
    where
        F: FnOnce(&CancelToken) -> TaskOutcome + Send + 'static,
    {
        let label = label.into();
        let shared = Arc::clone(&self.shared);
        let token = self.cancel.clone();

        shared.begin();
        self.pool.spawn(move || {
            if token.is_cancelled() {
                debug!("Skipping cancelled task: {}", label);
                shared.finish(None);
                return;
            }

            let outcome = match catch_unwind(AssertUnwindSafe(|| job(&token))) {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!("Task panicked: {}", label);
                    TaskOutcome::Failed
                }
            };
            shared.finish(Some(outcome));
        });
    }

    pub fn stop(&self) {
        warn!("Stopping background tasks");
        self.cancel.cancel();
        let mut info = self.shared.lock();
        info.status = TaskStatus::Stopped;
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn get_info(&self) -> TaskInfo {
        self.shared.lock().clone()
    }

    /// Blocks until every queued job has finished.
    pub fn wait_idle(&self) {
        let mut info = self.shared.lock();
        while info.pending > 0 {
            info = self
                .shared
                .idle
                .wait(info)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like `wait_idle` but gives up after `timeout`. Returns true if idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut info = self.shared.lock();
        while info.pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .idle
                .wait_timeout(info, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            info = guard;
        }
        true
    }
}
