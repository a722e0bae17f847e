use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::{mpsc, Notify};

use autopg_core::{EventSubscription, Platform, PlatformError, Workload, WorkloadStarted};

type EventSender = mpsc::UnboundedSender<Result<WorkloadStarted, PlatformError>>;

#[derive(Debug, Default)]
pub struct MemoryPlatform {
    workloads: Mutex<BTreeMap<String, Workload>>,
    subscribers: Mutex<Vec<EventSender>>,
    label_updates: Mutex<Vec<(String, HashMap<String, String>)>>,
    subscriptions_since: Mutex<Vec<Option<i64>>>,

    labels_read_only: AtomicBool,
    stalled_lookups: AtomicBool,
    failing_subscribes: AtomicUsize,

    list_count: AtomicUsize,
    subscription_count: AtomicUsize,
    subscribed: Notify,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a workload without emitting a start event, as if it existed before startup.
    pub fn insert_workload(&self, workload: Workload) {
        locked(&self.workloads).insert(workload.id.clone(), workload);
    }

    /// Adds (or replaces) a workload and emits a start event to every live subscriber.
    pub fn start_workload(&self, workload: Workload) {
        let id = workload.id.clone();

        self.insert_workload(workload);
        self.broadcast(WorkloadStarted { id, time: None });
    }

    /// Like [`MemoryPlatform::start_workload`], with the event stamped at `time` (unix seconds).
    pub fn start_workload_at(&self, workload: Workload, time: i64) {
        let id = workload.id.clone();

        self.insert_workload(workload);
        self.broadcast(WorkloadStarted {
            id,
            time: Some(time),
        });
    }

    /// Emits a start event for an id the platform does not know about.
    pub fn emit_start(&self, id: &str) {
        self.broadcast(WorkloadStarted {
            id: id.to_string(),
            time: None,
        });
    }

    fn broadcast(&self, event: WorkloadStarted) {
        locked(&self.subscribers).retain(|sender| sender.send(Ok(event.clone())).is_ok());
    }

    /// Delivers an error to every live subscription and ends them.
    pub fn fail_subscriptions(&self, message: &str) {
        let subscribers = std::mem::take(&mut *locked(&self.subscribers));

        for sender in subscribers {
            let _ = sender.send(Err(PlatformError::api(message.to_string())));
        }
    }

    /// Ends every live subscription without an error.
    pub fn close_subscriptions(&self) {
        locked(&self.subscribers).clear();
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    pub fn set_labels_read_only(&self, read_only: bool) {
        self.labels_read_only.store(read_only, Ordering::SeqCst);
    }

    /// Makes listing and inspecting hang forever, like a daemon that stopped answering.
    pub fn stall_lookups(&self, stalled: bool) {
        self.stalled_lookups.store(stalled, Ordering::SeqCst);
    }

    pub fn workload(&self, id: &str) -> Option<Workload> {
        locked(&self.workloads).get(id).cloned()
    }

    pub fn label_updates(&self) -> Vec<(String, HashMap<String, String>)> {
        locked(&self.label_updates).clone()
    }

    pub fn list_count(&self) -> usize {
        self.list_count.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscription_count.load(Ordering::SeqCst)
    }

    /// The replay point of every subscription opened so far, in order.
    pub fn subscriptions_since(&self) -> Vec<Option<i64>> {
        locked(&self.subscriptions_since).clone()
    }

    async fn stall_if_requested(&self) {
        if self.stalled_lookups.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    /// Waits until at least `count` subscriptions have been opened in total.
    pub async fn wait_for_subscriptions(&self, count: usize) {
        loop {
            let notified = self.subscribed.notified();
            if self.subscription_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn list_workloads(&self) -> Result<Vec<Workload>, PlatformError> {
        self.list_count.fetch_add(1, Ordering::SeqCst);
        self.stall_if_requested().await;

        Ok(locked(&self.workloads).values().cloned().collect())
    }

    async fn inspect_workload(&self, id: &str) -> Result<Workload, PlatformError> {
        self.stall_if_requested().await;

        self.workload(id)
            .ok_or_else(|| PlatformError::NotFound(id.to_string()))
    }

    async fn subscribe_started(
        &self,
        since: Option<i64>,
    ) -> Result<EventSubscription, PlatformError> {
        let failing = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();

        if failing {
            return Err(PlatformError::api("event endpoint unavailable"));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        locked(&self.subscribers).push(sender);
        locked(&self.subscriptions_since).push(since);

        self.subscription_count.fetch_add(1, Ordering::SeqCst);
        self.subscribed.notify_waiters();

        let events = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        });

        Ok(events.boxed())
    }

    async fn update_labels(
        &self,
        id: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), PlatformError> {
        if self.labels_read_only.load(Ordering::SeqCst) {
            return Err(PlatformError::Unsupported("label updates"));
        }

        let mut workloads = locked(&self.workloads);
        let workload = workloads
            .get_mut(id)
            .ok_or_else(|| PlatformError::NotFound(id.to_string()))?;

        workload.labels = labels.clone();
        locked(&self.label_updates).push((id.to_string(), labels.clone()));

        Ok(())
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
