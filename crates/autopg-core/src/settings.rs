use std::{
    collections::HashMap,
    env,
    ffi::OsString,
    fmt,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

use crate::labels::DEFAULT_LABEL_PREFIX;

pub const ENV_PREFIX: &str = "AUTOPG_";

const LABEL_PREFIX_KEY: &str = "AUTOPG_LABEL_PREFIX";
const CONNECT_ATTEMPTS_KEY: &str = "AUTOPG_CONNECT_ATTEMPTS";
const CONNECT_INTERVAL_KEY: &str = "AUTOPG_CONNECT_INTERVAL_MS";
const RECONNECT_BACKOFF_KEY: &str = "AUTOPG_RECONNECT_BACKOFF_MS";
const JAEGER_KEY: &str = "AUTOPG_JAEGER";

const DEFAULT_CONNECT_ATTEMPTS: u32 = 30;
const DEFAULT_CONNECT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error, Eq, PartialEq)]
pub enum SettingsError {
    #[error("{key} must not be empty")]
    Empty { key: &'static str },
    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("{key} is not valid unicode")]
    NotUnicode { key: String },
}

/// Bounded retry for opening the admin connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_CONNECT_ATTEMPTS,
            interval: DEFAULT_CONNECT_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SslMode {
    #[default]
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl FromStr for SslMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            _ => Err(format!("unknown ssl mode {}", value)),
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        };

        f.write_str(mode)
    }
}

/// Process configuration, captured once at startup and never re-read.
///
/// Only `AUTOPG_*` variables are retained; per-target credentials are looked up from
/// this snapshot by [`crate::CredentialResolver`].
#[derive(Clone)]
pub struct Settings {
    pub label_prefix: String,
    pub connect_retry: RetryPolicy,
    pub reconnect_backoff: Duration,
    pub jaeger: bool,

    vars: HashMap<String, String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_vars(namespaced_vars(env::vars_os())?)
    }

    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();

        let label_prefix = match vars.get(LABEL_PREFIX_KEY) {
            Some(prefix) if prefix.is_empty() => {
                return Err(SettingsError::Empty {
                    key: LABEL_PREFIX_KEY,
                })
            }
            Some(prefix) => prefix.clone(),
            None => DEFAULT_LABEL_PREFIX.to_string(),
        };

        let max_attempts = parse_or(&vars, CONNECT_ATTEMPTS_KEY, DEFAULT_CONNECT_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(SettingsError::Invalid {
                key: CONNECT_ATTEMPTS_KEY,
                value: "0".to_string(),
                reason: "at least one attempt is required",
            });
        }

        let interval = parse_millis_or(&vars, CONNECT_INTERVAL_KEY, DEFAULT_CONNECT_INTERVAL)?;
        let reconnect_backoff =
            parse_millis_or(&vars, RECONNECT_BACKOFF_KEY, DEFAULT_RECONNECT_BACKOFF)?;
        let jaeger = parse_or(&vars, JAEGER_KEY, false)?;

        Ok(Self {
            label_prefix,
            connect_retry: RetryPolicy {
                max_attempts,
                interval,
            },
            reconnect_backoff,
            jaeger,
            vars,
        })
    }

    /// Returns the value of `key`, treating an empty value as absent.
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.vars.keys().collect();
        keys.sort();

        f.debug_struct("Settings")
            .field("label_prefix", &self.label_prefix)
            .field("connect_retry", &self.connect_retry)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .field("jaeger", &self.jaeger)
            .field("keys", &keys)
            .finish()
    }
}

/// Keeps the `AUTOPG_*` entries of a raw environment. Variables outside the namespace are
/// skipped whatever their encoding.
fn namespaced_vars<I>(vars: I) -> Result<Vec<(String, String)>, SettingsError>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut namespaced = Vec::new();

    for (key, value) in vars {
        let key = match key.into_string() {
            Ok(key) => key,
            Err(key) => {
                let lossy = key.to_string_lossy();
                if lossy.starts_with(ENV_PREFIX) {
                    return Err(SettingsError::NotUnicode {
                        key: lossy.into_owned(),
                    });
                }
                continue;
            }
        };

        if !key.starts_with(ENV_PREFIX) {
            continue;
        }

        match value.into_string() {
            Ok(value) => namespaced.push((key, value)),
            Err(_) => return Err(SettingsError::NotUnicode { key }),
        }
    }

    Ok(namespaced)
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, SettingsError> {
    match vars.get(key).filter(|value| !value.is_empty()) {
        Some(value) => value.trim().parse().map_err(|_| SettingsError::Invalid {
            key,
            value: value.clone(),
            reason: "could not be parsed",
        }),
        None => Ok(default),
    }
}

fn parse_millis_or(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, SettingsError> {
    let default_millis = default.as_millis() as u64;

    parse_or(vars, key, default_millis).map(Duration::from_millis)
}
