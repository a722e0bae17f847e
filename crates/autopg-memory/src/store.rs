use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use autopg_core::{AdminCredential, AdminSession, AdminStore, StoreError};

/// Server state as seen through the memory store.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoreSnapshot {
    /// role name -> password
    pub roles: BTreeMap<String, String>,
    /// database name -> owner
    pub databases: BTreeMap<String, String>,
    /// (database, user)
    pub grants: BTreeSet<(String, String)>,
}

#[derive(Debug, Default)]
struct StoreState {
    snapshot: StoreSnapshot,

    connect_attempts: u32,
    create_database_calls: u32,
    grant_calls: u32,
    closed_sessions: u32,

    refused_connections: u32,
    stale_existence_checks: u32,
    failing_grants: Option<String>,
    stalled_grants: bool,
}

/// An in-memory stand-in for a database server that records what convergence did to it.
#[derive(Clone, Debug, Default)]
pub struct MemoryAdminStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryAdminStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.locked().snapshot.clone()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.locked().connect_attempts
    }

    pub fn create_database_calls(&self) -> u32 {
        self.locked().create_database_calls
    }

    pub fn grant_calls(&self) -> u32 {
        self.locked().grant_calls
    }

    pub fn closed_sessions(&self) -> u32 {
        self.locked().closed_sessions
    }

    /// Refuses the next `count` connection attempts, like a server still starting up.
    pub fn refuse_connections(&self, count: u32) {
        self.locked().refused_connections = count;
    }

    /// Makes the next `count` existence checks report the database as absent even when it
    /// exists, reproducing another instance winning the creation race after our check.
    pub fn report_stale_existence(&self, count: u32) {
        self.locked().stale_existence_checks = count;
    }

    pub fn fail_grants(&self, message: Option<&str>) {
        self.locked().failing_grants = message.map(str::to_string);
    }

    /// Makes grants hang forever, like a statement stuck behind a lock on the server.
    pub fn stall_grants(&self, stalled: bool) {
        self.locked().stalled_grants = stalled;
    }

    fn locked(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AdminStore for MemoryAdminStore {
    async fn connect(
        &self,
        credential: &AdminCredential,
    ) -> Result<Box<dyn AdminSession>, StoreError> {
        let mut state = self.locked();
        state.connect_attempts += 1;

        if state.refused_connections > 0 {
            state.refused_connections -= 1;

            return Err(StoreError::Connect {
                address: credential.address(),
                source: "connection refused".into(),
            });
        }

        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<StoreState>>,
}

impl MemorySession {
    fn locked(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AdminSession for MemorySession {
    async fn ensure_role(&self, user: &str, password: &str) -> Result<(), StoreError> {
        self.locked()
            .snapshot
            .roles
            .entry(user.to_string())
            .or_insert_with(|| password.to_string());

        Ok(())
    }

    async fn database_exists(&self, database: &str) -> Result<bool, StoreError> {
        let mut state = self.locked();

        if state.stale_existence_checks > 0 {
            state.stale_existence_checks -= 1;
            return Ok(false);
        }

        Ok(state.snapshot.databases.contains_key(database))
    }

    async fn create_database(&self, database: &str, owner: &str) -> Result<(), StoreError> {
        let mut state = self.locked();
        state.create_database_calls += 1;

        if state.snapshot.databases.contains_key(database) {
            return Err(StoreError::AlreadyExists {
                object: format!("database {}", database),
            });
        }

        if !state.snapshot.roles.contains_key(owner) {
            return Err(StoreError::statement(format!(
                "role \"{}\" does not exist",
                owner
            )));
        }

        state
            .snapshot
            .databases
            .insert(database.to_string(), owner.to_string());

        Ok(())
    }

    async fn grant_all(&self, database: &str, user: &str) -> Result<(), StoreError> {
        let stalled = {
            let mut state = self.locked();
            state.grant_calls += 1;
            state.stalled_grants
        };

        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.locked();

        if let Some(message) = &state.failing_grants {
            return Err(StoreError::statement(message.clone()));
        }

        if !state.snapshot.databases.contains_key(database) {
            return Err(StoreError::statement(format!(
                "database \"{}\" does not exist",
                database
            )));
        }

        state
            .snapshot
            .grants
            .insert((database.to_string(), user.to_string()));

        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.locked().closed_sessions += 1;
    }
}
