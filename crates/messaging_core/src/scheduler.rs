use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::debug;

pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into the boxed form `Scheduler::register` takes.
pub fn job<F, Fut>(tick: F) -> JobFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(tick()))
}

struct Job {
    interval_tx: watch::Sender<Duration>,
    task: JoinHandle<()>,
}

/// The one owner of every recurring timer in the system.
///
/// Components register named jobs; the adaptive controller retunes the
/// whole set under a single lock so a mode change never races independent
/// intervals. Retuning restarts the affected timer without touching the
/// job itself.
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, Job>>,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a recurring job, replacing any previous job of the same
    /// name.
    pub async fn register(&self, name: &str, every: Duration, tick: JobFn) {
        let (interval_tx, mut interval_rx) = watch::channel(every);

        let task_name = name.to_string();
        let task = tokio::spawn(async move {
            loop {
                let every = *interval_rx.borrow();
                tokio::select! {
                    _ = tokio::time::sleep(every) => {
                        tick().await;
                    }
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        debug!(job = %task_name, "scheduler: interval retuned");
                    }
                }
            }
        });

        let mut jobs = self.jobs.lock().await;
        if let Some(previous) = jobs.insert(name.to_string(), Job { interval_tx, task }) {
            previous.task.abort();
        }
    }

    pub async fn retune(&self, name: &str, every: Duration) -> bool {
        let jobs = self.jobs.lock().await;
        match jobs.get(name) {
            Some(job) => job.interval_tx.send(every).is_ok(),
            None => false,
        }
    }

    /// Applies a set of interval changes under one lock acquisition.
    pub async fn retune_many(&self, updates: &[(&str, Duration)]) {
        let jobs = self.jobs.lock().await;
        for (name, every) in updates {
            if let Some(job) = jobs.get(*name) {
                let _ = job.interval_tx.send(*every);
            }
        }
    }

    pub async fn cancel(&self, name: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.remove(name) {
            Some(job) => {
                job.task.abort();
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let mut jobs = self.jobs.lock().await;
        for (_, job) in jobs.drain() {
            job.task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/scheduler_tests.rs"]
mod tests;
