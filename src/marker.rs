use std::sync::Arc;

use autopg_core::{is_marked, marker_key, marker_value, Platform, PlatformError};

/// What happened when recording that a target was provisioned for a workload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MarkOutcome {
    Marked,
    AlreadyMarked,
    /// The platform cannot store labels on a running workload. The next observation
    /// converges again, which is harmless.
    Unsupported,
    Failed,
}

/// Writes the `<prefix>provisioned.<target>` label. The label only ever goes to "true";
/// nothing here clears it.
pub struct StateMarker {
    platform: Arc<dyn Platform>,
    label_prefix: String,
}

impl StateMarker {
    pub fn new(platform: Arc<dyn Platform>, label_prefix: impl Into<String>) -> Self {
        Self {
            platform,
            label_prefix: label_prefix.into(),
        }
    }

    #[tracing::instrument(name = "marker::mark_satisfied", skip(self))]
    pub async fn mark_satisfied(&self, workload_id: &str, db_target: &str) -> MarkOutcome {
        let mut workload = match self.platform.inspect_workload(workload_id).await {
            Ok(workload) => workload,
            Err(err) => {
                tracing::warn!(error = %err, "could not read workload before marking it provisioned");
                return MarkOutcome::Failed;
            }
        };

        if is_marked(&self.label_prefix, &workload.labels, db_target) {
            return MarkOutcome::AlreadyMarked;
        }

        workload.labels.insert(
            marker_key(&self.label_prefix, db_target),
            marker_value().to_string(),
        );

        match self
            .platform
            .update_labels(workload_id, &workload.labels)
            .await
        {
            Ok(()) => {
                tracing::debug!("workload marked as provisioned");
                MarkOutcome::Marked
            }
            Err(PlatformError::Unsupported(what)) => {
                tracing::warn!(
                    "platform does not support {}; target will be converged again on the next observation",
                    what
                );
                MarkOutcome::Unsupported
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not mark workload as provisioned");
                MarkOutcome::Failed
            }
        }
    }
}
