use std::sync::Arc;

use crate::{
    model::{AdminCredential, DEFAULT_PORT},
    settings::{Settings, SslMode, ENV_PREFIX},
};

/// Maps a target name onto its configuration namespace: upper-cased, with every
/// character outside `[A-Z0-9]` replaced by `_`.
pub fn target_namespace(target: &str) -> String {
    target
        .chars()
        .map(|c| {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() || upper.is_ascii_digit() {
                upper
            } else {
                '_'
            }
        })
        .collect()
}

pub fn config_key(target: &str, field: &str) -> String {
    format!("{}{}_{}", ENV_PREFIX, target_namespace(target), field)
}

/// Resolves admin credentials for targets from the startup configuration snapshot.
///
/// Resolution fails closed: a target whose host, admin user or admin password is
/// missing is treated as not owned by this instance, even if the other fields are set.
#[derive(Clone, Debug)]
pub struct CredentialResolver {
    settings: Arc<Settings>,
}

impl CredentialResolver {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub fn resolve(&self, target: &str) -> Option<AdminCredential> {
        let host = self.settings.var(&config_key(target, "HOST"))?;
        let admin_user = self.settings.var(&config_key(target, "ADMIN"))?;
        let admin_password = self.settings.var(&config_key(target, "ADMIN_PASS"))?;

        let port = match self.settings.var(&config_key(target, "PORT")) {
            Some(port) => match port.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    tracing::warn!(
                        db_target = %target,
                        port = %port,
                        "invalid admin port; ignoring target"
                    );
                    return None;
                }
            },
            None => DEFAULT_PORT,
        };

        let ssl_mode = match self.settings.var(&config_key(target, "SSLMODE")) {
            Some(mode) => match mode.parse::<SslMode>() {
                Ok(mode) => mode,
                Err(err) => {
                    tracing::warn!(db_target = %target, "{}; ignoring target", err);
                    return None;
                }
            },
            None => SslMode::default(),
        };

        let admin_database = self
            .settings
            .var(&config_key(target, "ADMIN_DB"))
            .map(str::to_string);

        Some(AdminCredential {
            target: target.to_string(),
            host: host.to_string(),
            port,
            admin_user: admin_user.to_string(),
            admin_password: admin_password.to_string(),
            admin_database,
            ssl_mode,
        })
    }
}
