// Reconciler decides, per workload and per target it mentions, whether this instance should
// provision anything, and drives convergence and marking when it should.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use autopg_core::{
    is_marked, scan_labels, AdminStore, CredentialResolver, Field, LabelScan, Platform, Settings,
    Workload,
};

use crate::{
    convergence::{Converger, ProvisionError},
    marker::{MarkOutcome, StateMarker},
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisionOutcome {
    /// No admin credentials for the target in this instance. Another instance may own it.
    Unauthorized,
    AlreadyProvisioned,
    Incomplete { missing: Vec<Field> },
    Provisioned { marker: MarkOutcome },
    Failed { reason: String },
    Cancelled,
}

pub struct Reconciler {
    resolver: CredentialResolver,
    converger: Converger,
    marker: StateMarker,
    label_prefix: String,
}

impl Reconciler {
    pub fn new(
        settings: Arc<Settings>,
        platform: Arc<dyn Platform>,
        store: Arc<dyn AdminStore>,
    ) -> Self {
        let label_prefix = settings.label_prefix.clone();

        Self {
            converger: Converger::new(store, settings.connect_retry),
            marker: StateMarker::new(platform, label_prefix.clone()),
            resolver: CredentialResolver::new(settings),
            label_prefix,
        }
    }

    /// Processes every target the workload's labels mention, one after another.
    #[tracing::instrument(
        name = "reconciler::process_workload",
        skip_all,
        fields(workload = %workload.short_id(), name = workload.name.as_deref().unwrap_or(""))
    )]
    pub async fn process_workload(
        &self,
        workload: &Workload,
        cancel: &CancellationToken,
    ) -> Vec<(String, ProvisionOutcome)> {
        let scan = scan_labels(&self.label_prefix, &workload.labels);

        let mut outcomes = Vec::new();
        for db_target in scan.mentioned() {
            if cancel.is_cancelled() {
                outcomes.push((db_target.to_string(), ProvisionOutcome::Cancelled));
                continue;
            }

            let outcome = self
                .process_target(workload, &scan, db_target, cancel)
                .await;
            outcomes.push((db_target.to_string(), outcome));
        }

        outcomes
    }

    #[tracing::instrument(name = "reconciler::process_target", skip(self, workload, scan, cancel))]
    async fn process_target(
        &self,
        workload: &Workload,
        scan: &LabelScan,
        db_target: &str,
        cancel: &CancellationToken,
    ) -> ProvisionOutcome {
        let credential = match self.resolver.resolve(db_target) {
            Some(credential) => credential,
            None => {
                tracing::debug!("no admin credentials for target; skipping");
                return ProvisionOutcome::Unauthorized;
            }
        };

        if is_marked(&self.label_prefix, &workload.labels, db_target) {
            tracing::info!("already provisioned; skipping");
            return ProvisionOutcome::AlreadyProvisioned;
        }

        let request = match scan.request(db_target) {
            Some(request) => request,
            None => {
                let missing = scan.missing_fields(db_target).to_vec();
                let names: Vec<String> = missing.iter().map(Field::to_string).collect();

                tracing::warn!(missing = %names.join(","), "incomplete labels; skipping");
                return ProvisionOutcome::Incomplete { missing };
            }
        };

        tracing::info!(
            address = %credential.address(),
            database = %request.database,
            user = %request.user,
            "provisioning"
        );

        match self.converger.converge(&credential, request, cancel).await {
            Ok(()) => {
                // an unwritten marker only means converging again on the next observation
                let marker = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => MarkOutcome::Failed,
                    marker = self.marker.mark_satisfied(&workload.id, db_target) => marker,
                };
                tracing::info!(database = %request.database, user = %request.user, "provisioned");

                ProvisionOutcome::Provisioned { marker }
            }
            Err(ProvisionError::Cancelled) => {
                tracing::debug!("provisioning cancelled");
                ProvisionOutcome::Cancelled
            }
            Err(err) => {
                tracing::error!(error = %err, "provisioning failed");
                ProvisionOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use autopg_core::test::{get_settings_vars_fixture, get_workload_fixture};
    use autopg_memory::{MemoryAdminStore, MemoryPlatform};

    use super::*;

    struct ReconcilerFixture {
        platform: Arc<MemoryPlatform>,
        store: MemoryAdminStore,
        reconciler: Reconciler,
    }

    fn create_reconciler_fixture(vars: Vec<(String, String)>) -> ReconcilerFixture {
        let settings = Arc::new(Settings::from_vars(vars).unwrap());
        let platform = Arc::new(MemoryPlatform::new());
        let store = MemoryAdminStore::new();

        let reconciler = Reconciler::new(
            settings,
            Arc::clone(&platform) as Arc<dyn Platform>,
            Arc::new(store.clone()),
        );

        ReconcilerFixture {
            platform,
            store,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_provisions_and_marks() {
        let fixture = create_reconciler_fixture(get_settings_vars_fixture(None));
        let workload = get_workload_fixture(None);
        fixture.platform.insert_workload(workload.clone());

        let outcomes = fixture
            .reconciler
            .process_workload(&workload, &CancellationToken::new())
            .await;

        assert_eq!(
            outcomes,
            vec![(
                "pg1".to_owned(),
                ProvisionOutcome::Provisioned {
                    marker: MarkOutcome::Marked
                }
            )]
        );
        assert_eq!(fixture.store.snapshot().databases["appdb"], "appuser");
        assert_eq!(
            fixture.platform.workload(&workload.id).unwrap().labels["autopg.provisioned.pg1"],
            "true"
        );
    }

    #[tokio::test]
    async fn test_unauthorized_target_is_never_touched() {
        let fixture = create_reconciler_fixture(get_settings_vars_fixture(Some("other")));
        let workload = get_workload_fixture(None);
        fixture.platform.insert_workload(workload.clone());

        let outcomes = fixture
            .reconciler
            .process_workload(&workload, &CancellationToken::new())
            .await;

        assert_eq!(
            outcomes,
            vec![("pg1".to_owned(), ProvisionOutcome::Unauthorized)]
        );
        assert_eq!(fixture.store.connect_attempts(), 0);
        assert!(fixture.platform.label_updates().is_empty());
    }

    #[tokio::test]
    async fn test_marked_target_is_skipped() {
        let fixture = create_reconciler_fixture(get_settings_vars_fixture(None));
        let mut workload = get_workload_fixture(None);
        workload
            .labels
            .insert("autopg.provisioned.pg1".to_owned(), "true".to_owned());

        let outcomes = fixture
            .reconciler
            .process_workload(&workload, &CancellationToken::new())
            .await;

        assert_eq!(
            outcomes,
            vec![("pg1".to_owned(), ProvisionOutcome::AlreadyProvisioned)]
        );
        assert_eq!(fixture.store.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_incomplete_labels_are_reported() {
        let fixture = create_reconciler_fixture(get_settings_vars_fixture(None));
        let workload = Workload {
            id: "4f2a9c1d7e3b".to_owned(),
            name: None,
            labels: HashMap::from([("autopg.pg1.db".to_owned(), "appdb".to_owned())]),
        };

        let outcomes = fixture
            .reconciler
            .process_workload(&workload, &CancellationToken::new())
            .await;

        assert_eq!(
            outcomes,
            vec![(
                "pg1".to_owned(),
                ProvisionOutcome::Incomplete {
                    missing: vec![Field::User, Field::Password]
                }
            )]
        );
        assert_eq!(fixture.store.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_unlabelled_workload_is_ignored() {
        let fixture = create_reconciler_fixture(get_settings_vars_fixture(None));
        let workload = Workload {
            id: "4f2a9c1d7e3b".to_owned(),
            name: Some("/nginx".to_owned()),
            labels: HashMap::from([("maintainer".to_owned(), "ops".to_owned())]),
        };

        let outcomes = fixture
            .reconciler
            .process_workload(&workload, &CancellationToken::new())
            .await;

        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_each_target_is_independent() {
        let mut vars = get_settings_vars_fixture(None);
        vars.push(("AUTOPG_PG2_HOST".to_owned(), "other.internal".to_owned()));
        vars.push(("AUTOPG_PG2_ADMIN".to_owned(), "postgres".to_owned()));
        vars.push(("AUTOPG_PG2_ADMIN_PASS".to_owned(), "pw".to_owned()));

        let fixture = create_reconciler_fixture(vars);
        let mut workload = get_workload_fixture(None);
        workload
            .labels
            .insert("autopg.pg2.db".to_owned(), "reports".to_owned());
        fixture.platform.insert_workload(workload.clone());

        let outcomes = fixture
            .reconciler
            .process_workload(&workload, &CancellationToken::new())
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes[0],
            (ref target, ProvisionOutcome::Provisioned { .. }) if target == "pg1"
        ));
        assert!(matches!(
            outcomes[1],
            (ref target, ProvisionOutcome::Incomplete { .. }) if target == "pg2"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_while_marking_keeps_the_database() {
        let fixture = create_reconciler_fixture(get_settings_vars_fixture(None));
        let workload = get_workload_fixture(None);
        fixture.platform.insert_workload(workload.clone());
        fixture.platform.stall_lookups(true);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let outcomes = tokio::time::timeout(
            Duration::from_secs(2),
            fixture.reconciler.process_workload(&workload, &cancel),
        )
        .await
        .expect("marking kept waiting on the platform");

        assert_eq!(
            outcomes,
            vec![(
                "pg1".to_owned(),
                ProvisionOutcome::Provisioned {
                    marker: MarkOutcome::Failed
                }
            )]
        );
        assert_eq!(fixture.store.snapshot().databases["appdb"], "appuser");
        assert!(fixture.platform.label_updates().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_without_marking() {
        let fixture = create_reconciler_fixture(get_settings_vars_fixture(None));
        let workload = get_workload_fixture(None);
        fixture.platform.insert_workload(workload.clone());
        fixture.store.refuse_connections(100);

        let outcomes = fixture
            .reconciler
            .process_workload(&workload, &CancellationToken::new())
            .await;

        match &outcomes[0].1 {
            ProvisionOutcome::Failed { reason } => {
                assert!(reason.starts_with("could not connect to postgres.internal:5432 after 3 attempts"))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fixture.store.connect_attempts(), 3);
        assert!(fixture.platform.label_updates().is_empty());
    }
}
