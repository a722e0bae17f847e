use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use autopg_core::{EventSubscription, Platform, PlatformError, WorkloadStarted};

use crate::reconciler::Reconciler;

/// Feeds workloads to the reconciler: everything that exists at startup, then every
/// workload that starts afterwards.
///
/// One subscribe attempt is made before the startup scan, so a workload starting while the
/// scan runs is seen by at least one of the two. The scan runs even when that attempt
/// fails; the subscription is then retried with backoff from the scan start time. After a
/// stream failure the subscription is reopened from the last event seen; there is no
/// second full scan.
pub struct Watcher {
    platform: Arc<dyn Platform>,
    reconciler: Arc<Reconciler>,
    backoff: Duration,
}

impl Watcher {
    pub fn new(platform: Arc<dyn Platform>, reconciler: Arc<Reconciler>, backoff: Duration) -> Self {
        Self {
            platform,
            reconciler,
            backoff,
        }
    }

    /// Runs until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut since = unix_now();

        let mut pending = self.try_subscribe(since, &cancel).await;
        if cancel.is_cancelled() {
            return;
        }

        tracing::info!("watcher: scanning existing workloads");
        self.scan(&cancel).await;

        'watch: loop {
            let mut events = match pending.take() {
                Some(events) => events,
                None => match self.subscribe(since, &cancel).await {
                    Some(events) => events,
                    None => break,
                },
            };

            tracing::info!("watcher: waiting for workload start events");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'watch,
                    next = events.next() => next,
                };

                match next {
                    Some(Ok(started)) => {
                        since = started.time.or(since);
                        self.handle_started(&started, &cancel).await;
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, backoff = ?self.backoff, "event stream failed; reconnecting");
                        break;
                    }
                    None => {
                        tracing::warn!(backoff = ?self.backoff, "event stream ended; reconnecting");
                        break;
                    }
                }
            }

            drop(events);

            if !self.sleep(&cancel).await {
                break;
            }
        }

        tracing::info!("watcher: stopped");
    }

    /// Processes every workload the platform currently reports.
    #[tracing::instrument(name = "watcher::scan", skip_all)]
    pub async fn scan(&self, cancel: &CancellationToken) {
        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            listed = self.platform.list_workloads() => listed,
        };

        let workloads = match listed {
            Ok(workloads) => workloads,
            Err(err) => {
                tracing::error!(error = %err, "could not list workloads; continuing with events only");
                return;
            }
        };

        tracing::debug!(count = workloads.len(), "listed workloads");

        for workload in workloads {
            if cancel.is_cancelled() {
                return;
            }

            self.reconciler.process_workload(&workload, cancel).await;
        }
    }

    // Labels come from a fresh inspect rather than the event payload.
    async fn handle_started(&self, started: &WorkloadStarted, cancel: &CancellationToken) {
        let inspected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            inspected = self.platform.inspect_workload(&started.id) => inspected,
        };

        let workload = match inspected {
            Ok(workload) => workload,
            Err(PlatformError::NotFound(id)) => {
                tracing::debug!(workload = %id, "started workload is already gone");
                return;
            }
            Err(err) => {
                tracing::warn!(workload = %started.id, error = %err, "could not inspect started workload");
                return;
            }
        };

        self.reconciler.process_workload(&workload, cancel).await;
    }

    // Retries until a subscription is open. None means cancelled.
    async fn subscribe(
        &self,
        since: Option<i64>,
        cancel: &CancellationToken,
    ) -> Option<EventSubscription> {
        loop {
            if let Some(events) = self.try_subscribe(since, cancel).await {
                return Some(events);
            }

            if !self.sleep(cancel).await {
                return None;
            }
        }
    }

    // A single attempt. None on failure or cancellation.
    async fn try_subscribe(
        &self,
        since: Option<i64>,
        cancel: &CancellationToken,
    ) -> Option<EventSubscription> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = self.platform.subscribe_started(since) => result,
        };

        match result {
            Ok(events) => Some(events),
            Err(err) => {
                tracing::warn!(error = %err, backoff = ?self.backoff, "could not subscribe to workload events");
                None
            }
        }
    }

    // false when cancelled before the backoff elapsed
    async fn sleep(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.backoff) => true,
        }
    }
}

fn unix_now() -> Option<i64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|elapsed| i64::try_from(elapsed.as_secs()).ok())
}
