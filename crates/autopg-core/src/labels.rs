// Provisioning requests are declared as workload labels:
//
//   <prefix><target>.db    database to create
//   <prefix><target>.user  role that owns it
//   <prefix><target>.pass  password for the role
//
// and satisfied requests are recorded under <prefix>provisioned.<target>.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::model::{Field, ProvisionRequest};

pub const DEFAULT_LABEL_PREFIX: &str = "autopg.";

const PROVISIONED_SEGMENT: &str = "provisioned.";
const MARKER_VALUE: &str = "true";

/// Result of scanning one workload's labels.
///
/// A target is *mentioned* as soon as one of its fields is present. Only mentions
/// with every field present and non-empty become requests; the rest keep the list
/// of fields they lack so the skip can be logged precisely.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabelScan {
    mentioned: BTreeSet<String>,
    requests: BTreeMap<String, ProvisionRequest>,
    missing: BTreeMap<String, Vec<Field>>,
}

impl LabelScan {
    pub fn mentioned(&self) -> impl Iterator<Item = &str> {
        self.mentioned.iter().map(String::as_str)
    }

    pub fn request(&self, target: &str) -> Option<&ProvisionRequest> {
        self.requests.get(target)
    }

    /// Fields absent or empty for a mentioned target. Empty for complete or unknown targets.
    pub fn missing_fields(&self, target: &str) -> &[Field] {
        self.missing
            .get(target)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

pub fn scan_labels(prefix: &str, labels: &HashMap<String, String>) -> LabelScan {
    let marker_prefix = format!("{}{}", prefix, PROVISIONED_SEGMENT);
    let mut fields_by_target: BTreeMap<&str, BTreeMap<Field, &str>> = BTreeMap::new();

    for (key, value) in labels {
        if key.starts_with(&marker_prefix) {
            continue;
        }

        let rest = match key.strip_prefix(prefix) {
            Some(rest) => rest,
            None => continue,
        };

        let (target, suffix) = match rest.split_once('.') {
            Some(parts) => parts,
            None => continue,
        };

        if target.is_empty() {
            continue;
        }

        let field = match Field::parse(suffix) {
            Some(field) => field,
            None => continue,
        };

        fields_by_target
            .entry(target)
            .or_default()
            .insert(field, value.as_str());
    }

    let mut scan = LabelScan::default();

    for (target, fields) in fields_by_target {
        scan.mentioned.insert(target.to_string());

        let missing: Vec<Field> = Field::ALL
            .into_iter()
            .filter(|field| fields.get(field).map_or(true, |value| value.is_empty()))
            .collect();

        if !missing.is_empty() {
            scan.missing.insert(target.to_string(), missing);
            continue;
        }

        let value = |field: Field| fields.get(&field).copied().unwrap_or_default().to_string();

        scan.requests.insert(
            target.to_string(),
            ProvisionRequest {
                target: target.to_string(),
                database: value(Field::Database),
                user: value(Field::User),
                password: value(Field::Password),
            },
        );
    }

    scan
}

pub fn marker_key(prefix: &str, target: &str) -> String {
    format!("{}{}{}", prefix, PROVISIONED_SEGMENT, target)
}

pub fn marker_value() -> &'static str {
    MARKER_VALUE
}

pub fn is_marked(prefix: &str, labels: &HashMap<String, String>, target: &str) -> bool {
    labels
        .get(&marker_key(prefix, target))
        .map_or(false, |value| value == MARKER_VALUE)
}
