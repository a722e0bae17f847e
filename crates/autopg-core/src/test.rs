use std::collections::HashMap;

use crate::{
    model::{AdminCredential, ProvisionRequest, Workload},
    settings::SslMode,
};

pub fn get_credential_fixture(target: Option<&str>) -> AdminCredential {
    AdminCredential {
        target: target.unwrap_or("pg1").to_string(),
        host: "postgres.internal".to_owned(),
        port: 5432,
        admin_user: "postgres".to_owned(),
        admin_password: "s3cr3t-admin".to_owned(),
        admin_database: None,
        ssl_mode: SslMode::Disable,
    }
}

pub fn get_request_fixture(target: Option<&str>) -> ProvisionRequest {
    ProvisionRequest {
        target: target.unwrap_or("pg1").to_string(),
        database: "appdb".to_owned(),
        user: "appuser".to_owned(),
        password: "secret".to_owned(),
    }
}

pub fn get_request_labels_fixture(target: Option<&str>) -> HashMap<String, String> {
    let request = get_request_fixture(target);

    HashMap::from([
        (format!("autopg.{}.db", request.target), request.database),
        (format!("autopg.{}.user", request.target), request.user),
        (format!("autopg.{}.pass", request.target), request.password),
    ])
}

pub fn get_workload_fixture(id: Option<&str>) -> Workload {
    Workload {
        id: id
            .unwrap_or("9b1f3c7d2e4a6b8c0d1e2f3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c8d9e0f1a2b3c")
            .to_string(),
        name: Some("/app-fixture".to_owned()),
        labels: get_request_labels_fixture(None),
    }
}

pub fn get_settings_vars_fixture(target: Option<&str>) -> Vec<(String, String)> {
    let credential = get_credential_fixture(target);
    let namespace = crate::credentials::target_namespace(&credential.target);

    vec![
        (format!("AUTOPG_{}_HOST", namespace), credential.host),
        (format!("AUTOPG_{}_ADMIN", namespace), credential.admin_user),
        (
            format!("AUTOPG_{}_ADMIN_PASS", namespace),
            credential.admin_password,
        ),
        ("AUTOPG_CONNECT_ATTEMPTS".to_owned(), "3".to_owned()),
        ("AUTOPG_CONNECT_INTERVAL_MS".to_owned(), "10".to_owned()),
        ("AUTOPG_RECONNECT_BACKOFF_MS".to_owned(), "20".to_owned()),
    ]
}
