use std::{collections::HashMap, error::Error as StdError};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::model::Workload;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("workload {0} not found")]
    NotFound(String),

    #[error("platform does not support {0}")]
    Unsupported(&'static str),

    #[error("platform api error: {0}")]
    Api(#[source] Box<dyn StdError + Send + Sync>),
}

impl PlatformError {
    pub fn api<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        PlatformError::Api(err.into())
    }
}

/// A workload reported as started by the platform's event feed. Only the identity
/// is trusted; labels are re-read with [`Platform::inspect_workload`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkloadStarted {
    pub id: String,
    /// Unix timestamp (seconds) of the event, when the platform reports one.
    pub time: Option<i64>,
}

/// Live feed of start events. Dropping the stream ends the subscription; errors are
/// yielded in-band and the subscription is expected to be reopened afterwards.
pub type EventSubscription = BoxStream<'static, Result<WorkloadStarted, PlatformError>>;

#[async_trait]
pub trait Platform: Send + Sync {
    /// Every workload the platform knows about, running or stopped.
    async fn list_workloads(&self) -> Result<Vec<Workload>, PlatformError>;

    async fn inspect_workload(&self, id: &str) -> Result<Workload, PlatformError>;

    /// Subscribes to workload start events, replaying events from `since` (unix seconds)
    /// when given.
    async fn subscribe_started(&self, since: Option<i64>)
        -> Result<EventSubscription, PlatformError>;

    /// Replaces the labels of a workload. Platforms that cannot mutate labels return
    /// [`PlatformError::Unsupported`].
    async fn update_labels(
        &self,
        id: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), PlatformError>;
}
