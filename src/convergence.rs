// Converger drives one provisioning request to completion against a database server:
// role, then database, then grant. Every step is safe to repeat, so the whole sequence
// can be re-run after a crash, a lost marker, or alongside another instance doing the same.

use std::{fmt, sync::Arc};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use autopg_core::{
    AdminCredential, AdminSession, AdminStore, ProvisionRequest, RetryPolicy, StoreError,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    EnsureRole,
    CheckDatabase,
    CreateDatabase,
    Grant,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            Step::EnsureRole => "ensure role",
            Step::CheckDatabase => "check database",
            Step::CreateDatabase => "create database",
            Step::Grant => "grant privileges",
        };

        f.write_str(step)
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("could not connect to {address} after {attempts} attempts: {source}")]
    Connectivity {
        address: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("provisioning failed at {step}: {source}")]
    Step {
        step: Step,
        #[source]
        source: StoreError,
    },

    #[error("provisioning cancelled")]
    Cancelled,
}

impl ProvisionError {
    fn at(step: Step) -> impl FnOnce(StoreError) -> ProvisionError {
        move |source| ProvisionError::Step { step, source }
    }
}

pub struct Converger {
    store: Arc<dyn AdminStore>,
    retry: RetryPolicy,
}

impl Converger {
    pub fn new(store: Arc<dyn AdminStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    #[tracing::instrument(
        name = "converge",
        skip_all,
        fields(
            db_target = %request.target,
            database = %request.database,
            user = %request.user,
        )
    )]
    pub async fn converge(
        &self,
        credential: &AdminCredential,
        request: &ProvisionRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let session = self.connect_with_retry(credential, cancel).await?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
            result = Self::apply(session.as_ref(), request) => result,
        };
        session.close().await;

        result
    }

    async fn apply(
        session: &dyn AdminSession,
        request: &ProvisionRequest,
    ) -> Result<(), ProvisionError> {
        session
            .ensure_role(&request.user, &request.password)
            .await
            .map_err(ProvisionError::at(Step::EnsureRole))?;

        let exists = session
            .database_exists(&request.database)
            .await
            .map_err(ProvisionError::at(Step::CheckDatabase))?;

        if exists {
            tracing::debug!("database already exists");
        } else {
            match session
                .create_database(&request.database, &request.user)
                .await
            {
                Ok(()) => tracing::debug!("database created"),
                Err(err) if err.is_already_exists() => {
                    tracing::info!("database was created concurrently; continuing")
                }
                Err(source) => {
                    return Err(ProvisionError::Step {
                        step: Step::CreateDatabase,
                        source,
                    })
                }
            }
        }

        // grants may have drifted or never been applied, so always reapply
        session
            .grant_all(&request.database, &request.user)
            .await
            .map_err(ProvisionError::at(Step::Grant))?;

        Ok(())
    }

    /// Opens an admin session, retrying per the retry policy. Both the attempts and the
    /// waits between them stop early when `cancel` fires.
    pub async fn connect_with_retry(
        &self,
        credential: &AdminCredential,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn AdminSession>, ProvisionError> {
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }

            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                result = self.store.connect(credential) => result,
            };

            let err = match result {
                Ok(session) => return Ok(session),
                Err(err) => err,
            };

            if attempts >= self.retry.max_attempts {
                return Err(ProvisionError::Connectivity {
                    address: credential.address(),
                    attempts,
                    source: err,
                });
            }

            tracing::debug!(
                attempt = attempts,
                max_attempts = self.retry.max_attempts,
                error = %err,
                "admin connection failed; retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                _ = tokio::time::sleep(self.retry.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use autopg_core::test::{get_credential_fixture, get_request_fixture};
    use autopg_memory::MemoryAdminStore;

    use super::*;

    const RETRY: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        interval: Duration::from_secs(1),
    };

    fn create_converger_fixture(store: &MemoryAdminStore) -> Converger {
        Converger::new(Arc::new(store.clone()), RETRY)
    }

    #[tokio::test]
    async fn test_fresh_provision() {
        let store = MemoryAdminStore::new();
        let converger = create_converger_fixture(&store);

        converger
            .converge(
                &get_credential_fixture(None),
                &get_request_fixture(None),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.roles["appuser"], "secret");
        assert_eq!(snapshot.databases["appdb"], "appuser");
        assert!(snapshot
            .grants
            .contains(&("appdb".to_string(), "appuser".to_string())));
    }

    #[tokio::test]
    async fn test_converge_is_idempotent() {
        let store = MemoryAdminStore::new();
        let converger = create_converger_fixture(&store);
        let credential = get_credential_fixture(None);
        let request = get_request_fixture(None);
        let cancel = CancellationToken::new();

        converger
            .converge(&credential, &request, &cancel)
            .await
            .unwrap();
        let first = store.snapshot();

        converger
            .converge(&credential, &request, &cancel)
            .await
            .unwrap();

        assert_eq!(store.snapshot(), first);
        assert_eq!(store.create_database_calls(), 1);
        // the grant is reapplied even though the database already existed
        assert_eq!(store.grant_calls(), 2);
    }

    #[tokio::test]
    async fn test_lost_creation_race_is_success() {
        let store = MemoryAdminStore::new();
        let converger = create_converger_fixture(&store);
        let credential = get_credential_fixture(None);
        let request = get_request_fixture(None);
        let cancel = CancellationToken::new();

        converger
            .converge(&credential, &request, &cancel)
            .await
            .unwrap();

        // the next existence check misses the database another instance just created
        store.report_stale_existence(1);

        converger
            .converge(&credential, &request, &cancel)
            .await
            .unwrap();

        assert_eq!(store.create_database_calls(), 2);
        assert_eq!(store.snapshot().databases.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_duplicates_converge() {
        let store = MemoryAdminStore::new();
        let first = create_converger_fixture(&store);
        let second = create_converger_fixture(&store);
        let credential = get_credential_fixture(None);
        let request = get_request_fixture(None);
        let cancel = CancellationToken::new();

        store.report_stale_existence(2);

        let (a, b) = tokio::join!(
            first.converge(&credential, &request, &cancel),
            second.converge(&credential, &request, &cancel),
        );

        a.unwrap();
        b.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.roles.len(), 1);
        assert_eq!(snapshot.databases["appdb"], "appuser");
        assert_eq!(snapshot.grants.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_retries_until_reachable() {
        let store = MemoryAdminStore::new();
        let converger = create_converger_fixture(&store);

        store.refuse_connections(2);

        converger
            .converge(
                &get_credential_fixture(None),
                &get_request_fixture(None),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(store.connect_attempts(), 3);
        assert_eq!(store.snapshot().databases.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_retry_budget_is_bounded() {
        let store = MemoryAdminStore::new();
        let converger = create_converger_fixture(&store);

        store.refuse_connections(10);

        let started = tokio::time::Instant::now();
        let err = converger
            .converge(
                &get_credential_fixture(None),
                &get_request_fixture(None),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            ProvisionError::Connectivity {
                address, attempts, ..
            } => {
                assert_eq!(address, "postgres.internal:5432");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert_eq!(store.connect_attempts(), 3);
        // two waits between three attempts
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(store.snapshot().roles.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retrying() {
        let store = MemoryAdminStore::new();
        let converger = Converger::new(
            Arc::new(store.clone()),
            RetryPolicy {
                max_attempts: 30,
                interval: Duration::from_secs(1),
            },
        );

        store.refuse_connections(100);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            canceller.cancel();
        });

        let err = converger
            .converge(
                &get_credential_fixture(None),
                &get_request_fixture(None),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Cancelled));
        assert_eq!(store.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_a_hung_statement() {
        let store = MemoryAdminStore::new();
        let converger = create_converger_fixture(&store);

        store.stall_grants(true);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            converger.converge(
                &get_credential_fixture(None),
                &get_request_fixture(None),
                &cancel,
            ),
        )
        .await
        .expect("converge kept waiting on the grant");

        assert!(matches!(result, Err(ProvisionError::Cancelled)));
        assert_eq!(store.grant_calls(), 1);
        assert_eq!(store.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_connects() {
        let store = MemoryAdminStore::new();
        let converger = create_converger_fixture(&store);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = converger
            .converge(
                &get_credential_fixture(None),
                &get_request_fixture(None),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Cancelled));
        assert_eq!(store.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_step_failure_aborts() {
        let store = MemoryAdminStore::new();
        let converger = create_converger_fixture(&store);

        store.fail_grants(Some("permission denied for database appdb"));

        let err = converger
            .converge(
                &get_credential_fixture(None),
                &get_request_fixture(None),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::Step {
                step: Step::Grant,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "provisioning failed at grant privileges: statement failed: permission denied for database appdb"
        );
    }
}
