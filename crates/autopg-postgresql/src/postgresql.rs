use async_trait::async_trait;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    Executor, PgPool,
};
use std::time::Duration;

use autopg_core::{
    quote_identifier, quote_literal, AdminCredential, AdminSession, AdminStore, SslMode,
    StoreError,
};

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

// SQLSTATE codes that mean a concurrent CREATE DATABASE got there first.
const DUPLICATE_DATABASE: &str = "42P04";
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug)]
pub struct PostgresqlAdminStore {
    pub acquire_timeout: Duration,
}

impl Default for PostgresqlAdminStore {
    fn default() -> Self {
        Self {
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl PostgresqlAdminStore {
    fn connect_options(credential: &AdminCredential) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&credential.host)
            .port(credential.port)
            .username(&credential.admin_user)
            .password(&credential.admin_password)
            .ssl_mode(Self::ssl_mode(credential.ssl_mode));

        match &credential.admin_database {
            Some(database) => options.database(database),
            None => options,
        }
    }

    fn ssl_mode(mode: SslMode) -> PgSslMode {
        match mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Allow => PgSslMode::Allow,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

#[async_trait]
impl AdminStore for PostgresqlAdminStore {
    #[tracing::instrument(name = "postgresql::connect", skip_all, fields(address = %credential.address()))]
    async fn connect(
        &self,
        credential: &AdminCredential,
    ) -> Result<Box<dyn AdminSession>, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(Self::connect_options(credential))
            .await
            .map_err(|err| StoreError::Connect {
                address: credential.address(),
                source: Box::new(err),
            })?;

        Ok(Box::new(PostgresqlSession { pool }))
    }
}

#[derive(Debug)]
pub struct PostgresqlSession {
    pool: PgPool,
}

#[async_trait]
impl AdminSession for PostgresqlSession {
    #[tracing::instrument(name = "postgresql::ensure_role", skip_all, fields(user = %user))]
    async fn ensure_role(&self, user: &str, password: &str) -> Result<(), StoreError> {
        let statement = role_statement(user, password);

        // no bind parameters, so this goes over the simple query protocol
        self.pool
            .execute(statement.as_str())
            .await
            .map_err(StoreError::statement)?;

        Ok(())
    }

    #[tracing::instrument(name = "postgresql::database_exists", skip_all, fields(database = %database))]
    async fn database_exists(&self, database: &str) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, i32>("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(database)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::statement)?;

        Ok(exists.is_some())
    }

    #[tracing::instrument(name = "postgresql::create_database", skip_all, fields(database = %database, owner = %owner))]
    async fn create_database(&self, database: &str, owner: &str) -> Result<(), StoreError> {
        let statement = format!(
            "CREATE DATABASE {} OWNER {}",
            quote_identifier(database),
            quote_identifier(owner)
        );

        match self.pool.execute(statement.as_str()).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if is_duplicate_database(err.code().as_deref()) => {
                Err(StoreError::AlreadyExists {
                    object: format!("database {}", database),
                })
            }
            Err(err) => Err(StoreError::statement(err)),
        }
    }

    #[tracing::instrument(name = "postgresql::grant_all", skip_all, fields(database = %database, user = %user))]
    async fn grant_all(&self, database: &str, user: &str) -> Result<(), StoreError> {
        let statement = format!(
            "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
            quote_identifier(database),
            quote_identifier(user)
        );

        self.pool
            .execute(statement.as_str())
            .await
            .map_err(StoreError::statement)?;

        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.pool.close().await;
    }
}

fn is_duplicate_database(code: Option<&str>) -> bool {
    matches!(code, Some(DUPLICATE_DATABASE) | Some(UNIQUE_VIOLATION))
}

/// Builds the anonymous block that creates a login role only when it is missing.
///
/// A second instance creating the same role between the check and the CREATE raises
/// duplicate_object (or unique_violation on the catalog); the block absorbs both so
/// racing instances all succeed.
pub fn role_statement(user: &str, password: &str) -> String {
    let body = format!(
        "BEGIN \
         IF NOT EXISTS (SELECT FROM pg_catalog.pg_roles WHERE rolname = {name}) THEN \
         BEGIN \
         CREATE ROLE {role} WITH LOGIN PASSWORD {password}; \
         EXCEPTION WHEN duplicate_object OR unique_violation THEN NULL; \
         END; \
         END IF; \
         END",
        name = quote_literal(user),
        role = quote_identifier(user),
        password = quote_literal(password),
    );

    let tag = dollar_quote_tag(&body);

    format!("DO {tag}{body}{tag}", tag = tag, body = body)
}

// The body is dollar-quoted, so the tag must not occur anywhere inside it.
fn dollar_quote_tag(body: &str) -> String {
    let mut tag = "$autopg$".to_string();
    let mut suffix = 0;

    while body.contains(&tag) {
        suffix += 1;
        tag = format!("$autopg{}$", suffix);
    }

    tag
}
