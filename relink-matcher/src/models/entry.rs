//! Entry record: one external-source row to be matched

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One record from an external dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Primary name used for knowledge-base search and name scoring
    pub display_name: String,
    /// Comparison-key → value map consumed by the scoring rules,
    /// e.g. `{"date_of_birth": "1961-01-26"}`
    pub attributes: BTreeMap<String, String>,
    /// Opaque identifier of the source row, if the caller has one
    pub external_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entry {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|v| v.as_str())
    }
}
