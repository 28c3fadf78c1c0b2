//! Progress refresh for in-flight tasks, one-shot or in the background.

use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::decode;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::task::Task;
use crate::transport::timestamp_ms;

/// Trait for receiving progress updates.
///
/// All methods have default no-op implementations.
pub trait TaskObserver: Send + Sync {
    /// Called with the updated copy of each refreshed task.
    fn on_task_updated(&self, _task: &Task) {}

    /// Called when a background refresh fails.
    fn on_poll_error(&self, _error: &Error) {}
}

/// Observer that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObserver;

impl TaskObserver for NoObserver {}

impl<F> TaskObserver for F
where
    F: Fn(&Task) + Send + Sync,
{
    fn on_task_updated(&self, task: &Task) {
        self(task);
    }
}

/// Handle to a running background poller.
#[derive(Debug)]
pub struct PollerHandle {
    trigger: Arc<Notify>,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Requests a refresh now instead of at the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stops the poller and waits for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            warn!("poller exited abnormally: {e}");
        }
    }
}

impl Session {
    /// Refreshes every cached normal, downloading task from one progress
    /// snapshot and returns the updated copies. Snapshot entries for tasks
    /// not in the cache are ignored.
    ///
    /// # Errors
    ///
    /// [`Error::NoTasksInProgress`] when nothing is in flight (no request is
    /// made), transport errors, or [`Error::InvalidResponse`].
    pub async fn process_tasks<O: TaskObserver + ?Sized>(&self, observer: &O) -> Result<Vec<Task>> {
        let mut in_flight: Vec<Task> = self
            .cache()
            .snapshot()
            .into_iter()
            .filter(Task::in_flight)
            .collect();
        if in_flight.is_empty() {
            return Err(Error::NoTasksInProgress);
        }
        in_flight.sort_by(|a, b| a.id.cmp(&b.id));

        let join = |bt: Option<bool>| {
            in_flight
                .iter()
                .filter(|t| bt.is_none_or(|bt| t.is_bt() == bt))
                .map(|t| t.id.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("list", &join(None))
            .append_pair("nm_list", &join(Some(false)))
            .append_pair("bt_list", &join(Some(true)))
            .append_pair("uid", &self.uid())
            .append_pair("interfrom", "task")
            .finish();
        let body = self
            .post_text(&self.config.endpoints.task_process(timestamp_ms()), form)
            .await?;
        let snapshot = decode::progress_snapshot(&body)?;
        debug!(
            "progress: {} records, {} downloading, {} waiting",
            snapshot.records.len(),
            snapshot.queue.downloading_num,
            snapshot.queue.waiting_num
        );

        let mut updated = Vec::with_capacity(snapshot.records.len());
        for record in &snapshot.records {
            match self.cache().update(&record.id, |t| t.apply_progress(record)) {
                Some(task) => {
                    observer.on_task_updated(&task);
                    updated.push(task);
                }
                None => debug!("progress for unknown task {}", record.id),
            }
        }
        Ok(updated)
    }

    /// Starts a background poller that refreshes progress every
    /// `poll_interval` and whenever [`PollerHandle::trigger`] is called.
    ///
    /// With an empty cache the in-flight listing is read first. A failed
    /// timed refresh is retried once after `poll_error_backoff`.
    pub fn spawn_poller<O: TaskObserver + 'static>(self: &Arc<Self>, observer: O) -> PollerHandle {
        let session = Arc::clone(self);
        let trigger = Arc::new(Notify::new());
        let shutdown = self.transport.shutdown_token().child_token();
        let interval = self.config.poll_interval;
        let backoff = self.config.poll_error_backoff;

        let wake = Arc::clone(&trigger);
        let token = shutdown.clone();
        let join = tokio::spawn(async move {
            if session.cache().is_empty()
                && let Err(e) = session.get_incompleted_tasks().await
            {
                warn!("initial listing failed: {e}");
            }
            loop {
                let timed = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = wake.notified() => false,
                    () = tokio::time::sleep(interval) => true,
                };
                match session.process_tasks(&observer).await {
                    Ok(_) | Err(Error::NoTasksInProgress) => {}
                    Err(Error::Cancelled) => break,
                    Err(e) => {
                        error!("error in process_tasks: {e}");
                        observer.on_poll_error(&e);
                        if timed {
                            tokio::select! {
                                () = token.cancelled() => break,
                                () = tokio::time::sleep(backoff) => wake.notify_one(),
                            }
                        }
                    }
                }
            }
            debug!("poller stopped");
        });

        PollerHandle {
            trigger,
            shutdown,
            join,
        }
    }
}
