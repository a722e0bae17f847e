use std::error::Error as StdError;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::AdminCredential;

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: BoxError,
    },

    /// The object was created concurrently by someone else. Callers that only need
    /// the object to exist treat this as success.
    #[error("{object} already exists")]
    AlreadyExists { object: String },

    #[error("statement failed: {source}")]
    Statement {
        #[source]
        source: BoxError,
    },
}

impl StoreError {
    pub fn statement<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        StoreError::Statement { source: err.into() }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

/// Opens administrative sessions against a database server.
#[async_trait]
pub trait AdminStore: Send + Sync {
    async fn connect(
        &self,
        credential: &AdminCredential,
    ) -> Result<Box<dyn AdminSession>, StoreError>;
}

/// The primitives convergence is built from. Each one is safe to repeat.
#[async_trait]
pub trait AdminSession: Send + Sync {
    /// Creates a login role with the given password unless a role with that name exists.
    async fn ensure_role(&self, user: &str, password: &str) -> Result<(), StoreError>;

    async fn database_exists(&self, database: &str) -> Result<bool, StoreError>;

    /// Creates `database` owned by `owner`. A lost creation race must surface as
    /// [`StoreError::AlreadyExists`].
    async fn create_database(&self, database: &str, owner: &str) -> Result<(), StoreError>;

    async fn grant_all(&self, database: &str, user: &str) -> Result<(), StoreError>;

    async fn close(self: Box<Self>);
}

/// Quotes an SQL identifier, doubling embedded double quotes.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Quotes an SQL string literal, doubling embedded single quotes.
pub fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}
