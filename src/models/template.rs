use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ObjectKey;

/// Reusable Kubernetes manifest applications are instantiated from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub owner: String,
    pub name: String,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub display_name: String,
    pub description: String,
    pub version: String,
    /// Multi-document YAML
    pub manifest: String,
}

impl Template {
    pub fn new(owner: &str, name: &str, manifest: &str) -> Self {
        let now = Utc::now();
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            created_time: now,
            updated_time: now,
            display_name: name.to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            manifest: manifest.to_string(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.owner, &self.name)
    }
}
