mod postgresql;

pub use postgresql::{role_statement, PostgresqlAdminStore, PostgresqlSession};
