mod credentials;
mod labels;
mod model;
mod platform;
mod settings;
mod store;

pub mod test;

pub use credentials::{config_key, target_namespace, CredentialResolver};
pub use labels::{
    is_marked, marker_key, marker_value, scan_labels, LabelScan, DEFAULT_LABEL_PREFIX,
};
pub use model::{AdminCredential, Field, ProvisionRequest, Workload, DEFAULT_PORT};
pub use platform::{EventSubscription, Platform, PlatformError, WorkloadStarted};
pub use settings::{RetryPolicy, Settings, SettingsError, SslMode};
pub use store::{quote_identifier, quote_literal, AdminSession, AdminStore, StoreError};
