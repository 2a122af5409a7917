//! Fire-and-forget write dispatch.
//!
//! A fixed pool of worker tasks drains a bounded queue. Submitting never
//! waits: when the queue is full or shut down the job is dropped and a
//! warning is logged. Each job runs behind a panic-capturing boundary, so
//! neither its errors nor its panics reach the submitter or stop the worker.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, debug, error, warn};

use crate::config::DispatchConfig;
use crate::error::StashResult;

/// Identifies a job in log output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobLabel {
    /// Namespace of the item being written.
    pub namespace: String,
    /// Name of the item being written.
    pub name: String,
    /// Key of the item being written.
    pub key: String,
}

struct Job {
    label: JobLabel,
    work: BoxFuture<'static, StashResult<()>>,
}

/// Bounded queue plus fixed worker pool.
pub struct Dispatcher {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dispatch: Dispatch,
}

impl Dispatcher {
    /// Start `config.workers` workers on the current tokio runtime.
    ///
    /// Worker log events go to `dispatch`.
    #[must_use]
    pub fn start(config: &DispatchConfig, dispatch: Dispatch) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(worker(worker_id, receiver).with_subscriber(dispatch.clone()))
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            dispatch,
        }
    }

    /// Queue `work` without waiting. Returns whether it was accepted.
    pub fn submit<F>(&self, label: JobLabel, work: F) -> bool
    where
        F: Future<Output = StashResult<()>> + Send + 'static,
    {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            self.drop_job(&label, "dispatcher is shut down");
            return false;
        };

        match sender.try_send(Job {
            label,
            work: work.boxed(),
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                self.drop_job(&job.label, "write queue is full");
                false
            },
            Err(TrySendError::Closed(job)) => {
                self.drop_job(&job.label, "dispatcher is shut down");
                false
            },
        }
    }

    /// Stop accepting jobs, let workers finish what is queued, and wait for them.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::dispatcher::with_default(&self.dispatch, || {
                    error!(error = %e, "dispatch worker ended abnormally");
                });
            }
        }
    }

    fn drop_job(&self, label: &JobLabel, reason: &str) {
        tracing::dispatcher::with_default(&self.dispatch, || {
            warn!(
                namespace = %label.namespace,
                name = %label.name,
                key = %label.key,
                reason,
                "dropping async put"
            );
        });
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

async fn worker(worker_id: usize, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            debug!(worker_id, "dispatch worker exiting");
            return;
        };
        run_isolated(job).await;
    }
}

async fn run_isolated(job: Job) {
    let Job { label, work } = job;
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(())) => {
            debug!(namespace = %label.namespace, key = %label.key, "async put stored");
        },
        Ok(Err(e)) => {
            error!(
                namespace = %label.namespace,
                name = %label.name,
                key = %label.key,
                error = %e,
                "async put failed"
            );
        },
        Err(payload) => {
            error!(
                namespace = %label.namespace,
                name = %label.name,
                key = %label.key,
                panic = %panic_message(payload.as_ref()),
                "async put panicked"
            );
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
