//! Core domain model for incremental tracker synchronization.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "tsync-core";

/// Watermark materialized for a (project, record type) pair that has never synced.
pub const EPOCH_WATERMARK: &str = "1970-01-01 00:00";

/// Minute-granularity format understood by the tracker's query language.
pub const WATERMARK_FORMAT: &str = "%Y-%m-%d %H:%M";

pub const BLACKLIST_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

pub const AUTH_FAILURE_REASON: &str = "Authentication failure";

/// One `{instance, project}` pair from the credentials document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectTarget {
    pub instance: String,
    pub project: String,
}

/// Credentials document: a single username/token pair shared by every listed project.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub token: String,
    #[serde(default)]
    pub projects: Vec<ProjectTarget>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .field("projects", &self.projects)
            .finish()
    }
}

/// A record exactly as returned by the search endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(rename = "self", default)]
    pub url: Option<String>,
    #[serde(default)]
    pub fields: JsonValue,
}

impl RawRecord {
    /// Top-level fields re-keyed by display name, falling back to the field id
    /// when the `names` expansion has no entry for it.
    pub fn named_fields<'a>(
        &'a self,
        names: &BTreeMap<String, String>,
    ) -> BTreeMap<String, &'a JsonValue> {
        let Some(fields) = self.fields.as_object() else {
            return BTreeMap::new();
        };
        fields
            .iter()
            .map(|(field_id, value)| {
                let name = names.get(field_id).cloned().unwrap_or_else(|| field_id.clone());
                (name, value)
            })
            .collect()
    }
}

/// A record category within a project, with its advisory allowed-field set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordType {
    pub id: String,
    pub name: String,
    pub allowed_fields: BTreeSet<String>,
}

/// Tabular form of one record: column name to cell value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlattenedRow {
    columns: BTreeMap<String, JsonValue>,
}

impl FlattenedRow {
    pub const ID: &'static str = "id";
    pub const KEY: &'static str = "key";
    pub const API_URL: &'static str = "api_url";

    /// Starts a row carrying the identity columns every row must have.
    pub fn for_record(record: &RawRecord) -> Self {
        let mut columns = BTreeMap::new();
        columns.insert(Self::ID.to_string(), optional_text(record.id.as_deref()));
        columns.insert(Self::KEY.to_string(), optional_text(record.key.as_deref()));
        columns.insert(Self::API_URL.to_string(), optional_text(record.url.as_deref()));
        Self { columns }
    }

    pub fn from_columns(columns: BTreeMap<String, JsonValue>) -> Self {
        Self { columns }
    }

    pub fn insert(&mut self, column: impl Into<String>, value: JsonValue) {
        self.columns.insert(column.into(), value);
    }

    /// Overlays `other` onto this row; keys from `other` win.
    pub fn overlay(&mut self, other: BTreeMap<String, JsonValue>) {
        self.columns.extend(other);
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.columns.get(column)
    }

    /// Textual id, or `None` when the id cell is missing or null.
    pub fn id(&self) -> Option<String> {
        match self.columns.get(Self::ID)? {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn columns(&self) -> &BTreeMap<String, JsonValue> {
        &self.columns
    }

    pub fn into_columns(self) -> BTreeMap<String, JsonValue> {
        self.columns
    }
}

fn optional_text(value: Option<&str>) -> JsonValue {
    value.map_or(JsonValue::Null, |v| JsonValue::String(v.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub instance: String,
    pub reason: Option<String>,
    pub blacklisted_at: String,
}

impl BlacklistEntry {
    pub fn auth_failure(instance: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            instance: instance.into(),
            reason: Some(AUTH_FAILURE_REASON.to_string()),
            blacklisted_at: at.format(BLACKLIST_TIMESTAMP_FORMAT).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkEntry {
    pub project_key: String,
    pub record_type: String,
    pub last_sync_time: String,
}

pub fn format_watermark(at: DateTime<Local>) -> String {
    at.format(WATERMARK_FORMAT).to_string()
}

/// Blacklist membership is compared on the lowercased instance name.
pub fn instance_key(instance: &str) -> String {
    instance.trim().to_lowercase()
}

/// Lifecycle of one (project, record type) pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Fetching,
    Transforming,
    Upserting,
    WatermarkAdvanced,
    Skipped,
    Empty,
    Failed,
}
