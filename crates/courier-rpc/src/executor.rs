// Runs response callbacks away from the consumer task.
use std::panic::{AssertUnwindSafe, catch_unwind};
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-task executor for response callbacks.
///
/// Jobs run one at a time in submission order, so the responses of a stream
/// reach their callback in the order the listener received them. A panicking
/// callback is logged and does not stop the executor.
#[derive(Debug, Clone)]
pub struct CallbackExecutor {
    jobs: mpsc::UnboundedSender<Job>,
}

impl CallbackExecutor {
    /// Spawn the executor task on the current runtime. It exits once every
    /// handle has been dropped.
    pub fn spawn() -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    metrics::counter!("courier_rpc_callback_panics_total").increment(1);
                    tracing::error!("response callback panicked");
                }
            }
        });
        Self { jobs }
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if self.jobs.send(Box::new(job)).is_err() {
            tracing::warn!("callback executor stopped; dropping callback");
        }
    }
}
