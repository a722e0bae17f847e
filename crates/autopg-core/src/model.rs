use std::{collections::HashMap, fmt};

use crate::settings::SslMode;

pub const DEFAULT_PORT: u16 = 5432;

const SHORT_ID_LEN: usize = 12;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Workload {
    pub id: String,
    pub name: Option<String>,
    pub labels: HashMap<String, String>,
}

impl Workload {
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(SHORT_ID_LEN) {
            Some((end, _)) => &self.id[..end],
            None => &self.id,
        }
    }
}

/// One of the three label fields that make up a provisioning request.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Field {
    Database,
    User,
    Password,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::Database, Field::User, Field::Password];

    pub fn parse(suffix: &str) -> Option<Self> {
        match suffix {
            "db" => Some(Field::Database),
            "user" => Some(Field::User),
            "pass" => Some(Field::Password),
            _ => None,
        }
    }

    pub fn label_suffix(&self) -> &'static str {
        match self {
            Field::Database => "db",
            Field::User => "user",
            Field::Password => "pass",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_suffix())
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct ProvisionRequest {
    pub target: String,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for ProvisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionRequest")
            .field("target", &self.target)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Administrative connection parameters for one target, resolved from process configuration.
#[derive(Clone, Eq, PartialEq)]
pub struct AdminCredential {
    pub target: String,
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub admin_password: String,
    pub admin_database: Option<String>,
    pub ssl_mode: SslMode,
}

impl AdminCredential {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredential")
            .field("target", &self.target)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("admin_user", &self.admin_user)
            .field("admin_password", &"<redacted>")
            .field("admin_database", &self.admin_database)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}
