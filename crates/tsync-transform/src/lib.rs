//! Record flattening, column reduction and composite-field translation.

use std::collections::BTreeMap;

use serde_json::{Number, Value as JsonValue};
use tracing::{debug, warn};
use tsync_core::{FlattenedRow, RawRecord};

pub const CRATE_NAME: &str = "tsync-transform";

pub const TIME_IN_STATUS_FIELD: &str = "[CHART] Time in Status";
pub const FLAGGED_FIELD: &str = "Flagged";
pub const ISSUE_TYPE_FIELD: &str = "Issue Type";
pub const SPRINT_FIELD: &str = "Sprint";

/// Column used for values whose flattened key has no usable first segment.
pub const PLACEHOLDER_COLUMN: &str = "unnamed_field";

/// Status id to display name for one project.
pub type StatusCatalog = BTreeMap<String, String>;

/// Leaf value of a flattened record.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
}

impl Scalar {
    fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => Some(Scalar::Null),
            JsonValue::Bool(b) => Some(Scalar::Bool(*b)),
            JsonValue::Number(n) => Some(Scalar::Number(n.clone())),
            JsonValue::String(s) => Some(Scalar::Text(s.clone())),
            JsonValue::Array(_) | JsonValue::Object(_) => None,
        }
    }

    /// Text form used when a scalar array is joined into one cell.
    pub fn render(&self) -> String {
        match self {
            Scalar::Null => "null".to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }
}

impl From<Scalar> for JsonValue {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Null => JsonValue::Null,
            Scalar::Bool(b) => JsonValue::Bool(b),
            Scalar::Number(n) => JsonValue::Number(n),
            Scalar::Text(s) => JsonValue::String(s),
        }
    }
}

/// Flattens a nested value into `(dotted path, scalar)` pairs in document order.
///
/// Objects extend the path with `.member`; arrays of scalars collapse into one
/// comma-joined text value; arrays holding any object or array extend the
/// path with `.index`. Empty objects and arrays contribute nothing.
pub fn flatten(value: &JsonValue) -> Vec<(String, Scalar)> {
    let mut out = Vec::new();
    walk(value, String::new(), &mut out);
    out
}

fn walk(value: &JsonValue, prefix: String, out: &mut Vec<(String, Scalar)>) {
    match value {
        JsonValue::Object(members) => {
            for (name, member) in members {
                walk(member, format!("{prefix}{name}."), out);
            }
        }
        JsonValue::Array(items) if items.is_empty() => {}
        JsonValue::Array(items) => {
            let scalars: Option<Vec<Scalar>> = items.iter().map(Scalar::from_json).collect();
            match scalars {
                Some(scalars) => {
                    let joined = scalars.iter().map(Scalar::render).collect::<Vec<_>>().join(",");
                    out.push((strip_separator(prefix), Scalar::Text(joined)));
                }
                None => {
                    for (index, item) in items.iter().enumerate() {
                        walk(item, format!("{prefix}{index}."), out);
                    }
                }
            }
        }
        scalar => {
            if let Some(scalar) = Scalar::from_json(scalar) {
                out.push((strip_separator(prefix), scalar));
            }
        }
    }
}

fn strip_separator(mut path: String) -> String {
    if path.ends_with('.') {
        path.pop();
    }
    path
}

/// Keeps ASCII letters, digits and whitespace, turns spaces into underscores, lowercases.
pub fn normalize_field_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .map(|c| if c == ' ' { '_' } else { c.to_ascii_lowercase() })
        .collect()
}

/// Reduces flattened keys to columns named after their normalized first segment.
///
/// Keys sharing a first segment collapse onto one column and the last one in
/// iteration order wins, so `status.name` followed by `status.id` leaves the id.
pub fn collapse_columns(pairs: Vec<(String, Scalar)>) -> BTreeMap<String, JsonValue> {
    let mut columns = BTreeMap::new();
    for (path, value) in pairs {
        let first = path.split('.').next().unwrap_or_default();
        let column = if first.is_empty() {
            warn!(path = %path, "flattened key has no field name; using placeholder column");
            PLACEHOLDER_COLUMN.to_string()
        } else {
            let normalized = normalize_field_name(first);
            if normalized.is_empty() {
                warn!(field = first, "field name normalizes to nothing; using placeholder column");
                PLACEHOLDER_COLUMN.to_string()
            } else {
                normalized
            }
        };
        columns.insert(column, value.into());
    }
    columns
}

/// Derived columns for the composite fields the tracker encodes in one value.
///
/// `named` maps display names to raw values; fields outside the translated set
/// produce nothing here and reach the row only through flattening.
pub fn translate_fields(
    named: &BTreeMap<String, &JsonValue>,
    catalog: &StatusCatalog,
) -> BTreeMap<String, JsonValue> {
    let mut out = BTreeMap::new();

    if let Some(value) = named.get(TIME_IN_STATUS_FIELD) {
        translate_time_in_status(value, catalog, &mut out);
    }

    if let Some(value) = named.get(FLAGGED_FIELD) {
        let flagged = match value {
            JsonValue::Array(items) if !items.is_empty() => {
                let marker = items[0].get("value").and_then(JsonValue::as_str);
                JsonValue::Bool(marker == Some("Impediment"))
            }
            _ => JsonValue::Null,
        };
        out.insert("flagged".to_string(), flagged);
    }

    if let Some(value) = named.get(ISSUE_TYPE_FIELD) {
        let name = value.get("name").cloned().unwrap_or(JsonValue::Null);
        out.insert("issue_type".to_string(), name);
    }

    if let Some(value) = named.get(SPRINT_FIELD) {
        translate_sprints(value, &mut out);
    }

    out
}

fn status_column(status_id: &str, catalog: &StatusCatalog) -> String {
    match catalog.get(status_id).map(|name| normalize_field_name(name)) {
        Some(name) if !name.is_empty() => format!("time_in_{name}"),
        _ => format!("time_in_status_{status_id}"),
    }
}

fn translate_time_in_status(
    value: &JsonValue,
    catalog: &StatusCatalog,
    out: &mut BTreeMap<String, JsonValue>,
) {
    let chart_column = normalize_field_name(TIME_IN_STATUS_FIELD);

    let Some(raw) = value.as_str() else {
        if !value.is_null() {
            warn!(field = TIME_IN_STATUS_FIELD, "expected text value; treating as empty");
        }
        for status_id in catalog.keys() {
            out.insert(status_column(status_id, catalog), JsonValue::Null);
        }
        out.insert(chart_column, JsonValue::Null);
        return;
    };

    let cleaned: String = raw.chars().filter(|c| *c != '*' && *c != '_').collect();
    for segment in cleaned.split('|') {
        let parts: Vec<&str> = segment.split(':').collect();
        let [status_id, _, status_time] = parts.as_slice() else {
            debug!(segment, "skipping malformed time-in-status segment");
            continue;
        };
        out.insert(
            status_column(status_id, catalog),
            JsonValue::String(status_time.to_string()),
        );
    }

    // Several ids may share a display name; a value already written for that column stays.
    for status_id in catalog.keys() {
        out.entry(status_column(status_id, catalog)).or_insert(JsonValue::Null);
    }
    out.insert(chart_column, JsonValue::String(cleaned));
}

fn translate_sprints(value: &JsonValue, out: &mut BTreeMap<String, JsonValue>) {
    let Some(sprints) = value.as_array() else {
        out.insert("sprint_ids".to_string(), JsonValue::Null);
        out.insert("sprint_names".to_string(), JsonValue::Null);
        out.insert("active_sprint".to_string(), JsonValue::Bool(false));
        out.insert("multiple_sprints".to_string(), JsonValue::Bool(false));
        out.insert("slotted_for_future_sprints".to_string(), JsonValue::Bool(false));
        return;
    };

    let ids = sprints
        .iter()
        .filter_map(|s| s.get("id").filter(|id| !id.is_null()).cloned())
        .collect();
    let names = sprints
        .iter()
        .filter_map(|s| s.get("name").and_then(JsonValue::as_str))
        .collect::<Vec<_>>()
        .join(",");
    let in_state = |state: &str| {
        sprints
            .iter()
            .any(|s| s.get("state").and_then(JsonValue::as_str) == Some(state))
    };

    out.insert("sprint_ids".to_string(), JsonValue::Array(ids));
    out.insert("sprint_names".to_string(), JsonValue::String(names));
    out.insert("active_sprint".to_string(), JsonValue::Bool(in_state("active")));
    out.insert("multiple_sprints".to_string(), JsonValue::Bool(sprints.len() > 1));
    out.insert("slotted_for_future_sprints".to_string(), JsonValue::Bool(in_state("future")));
}

/// Turns fetched records of one project into rows ready for the sink.
#[derive(Debug, Clone, Copy)]
pub struct RecordTransformer<'a> {
    catalog: &'a StatusCatalog,
}

impl<'a> RecordTransformer<'a> {
    pub fn new(catalog: &'a StatusCatalog) -> Self {
        Self { catalog }
    }

    pub fn transform(&self, record: &RawRecord, names: &BTreeMap<String, String>) -> FlattenedRow {
        let mut row = FlattenedRow::for_record(record);
        if !record.fields.is_null() {
            row.overlay(collapse_columns(flatten(&record.fields)));
        }
        row.overlay(translate_fields(&record.named_fields(names), self.catalog));
        row
    }

    pub fn transform_all(
        &self,
        records: &[RawRecord],
        names: &BTreeMap<String, String>,
    ) -> Vec<FlattenedRow> {
        records.iter().map(|r| self.transform(r, names)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(pairs: Vec<(String, Scalar)>) -> BTreeMap<String, JsonValue> {
        pairs.into_iter().map(|(k, v)| (k, v.into())).collect()
    }

    fn named(value: &JsonValue) -> BTreeMap<String, &JsonValue> {
        value
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v))
            .collect()
    }

    #[test]
    fn nested_objects_extend_the_path() {
        assert_eq!(
            as_map(flatten(&json!({"a": {"b": 1}}))),
            BTreeMap::from([("a.b".to_string(), json!(1))])
        );
    }

    #[test]
    fn scalar_arrays_join_with_commas() {
        assert_eq!(
            as_map(flatten(&json!({"a": [1, 2, 3]}))),
            BTreeMap::from([("a".to_string(), json!("1,2,3"))])
        );
        assert_eq!(
            as_map(flatten(&json!({"labels": ["ops", true, null, 1.5]}))),
            BTreeMap::from([("labels".to_string(), json!("ops,true,null,1.5"))])
        );
    }

    #[test]
    fn object_arrays_index_each_element() {
        assert_eq!(
            as_map(flatten(&json!({"a": [{"b": 1}, {"b": 2}]}))),
            BTreeMap::from([("a.0.b".to_string(), json!(1)), ("a.1.b".to_string(), json!(2))])
        );
    }

    #[test]
    fn mixed_arrays_recurse_into_every_element() {
        let flat = flatten(&json!({"a": [1, {"b": 2}]}));
        assert_eq!(
            flat,
            vec![
                ("a.0".to_string(), Scalar::Number(1.into())),
                ("a.1.b".to_string(), Scalar::Number(2.into())),
            ]
        );
    }

    #[test]
    fn empty_containers_are_dropped() {
        assert!(flatten(&json!({"a": {}, "b": []})).is_empty());
        assert_eq!(
            as_map(flatten(&json!({"a": null}))),
            BTreeMap::from([("a".to_string(), JsonValue::Null)])
        );
    }

    #[test]
    fn flatten_keeps_document_order() {
        let flat = flatten(&json!({"zeta": 1, "alpha": {"y": 2, "x": 3}}));
        let paths: Vec<_> = flat.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["zeta", "alpha.y", "alpha.x"]);
    }

    #[test]
    fn normalization_strips_punctuation_and_lowercases() {
        assert_eq!(normalize_field_name("Story Points"), "story_points");
        assert_eq!(normalize_field_name("[CHART] Time in Status"), "chart_time_in_status");
        assert_eq!(normalize_field_name("customfield_10020"), "customfield10020");
        assert_eq!(normalize_field_name("\u{03a3} Time Spent"), "_time_spent");
    }

    // Surprising but intended: sibling keys collapse onto one column, last write wins.
    #[test]
    fn sibling_keys_collapse_last_write_wins() {
        let columns = collapse_columns(flatten(&json!({"status": {"name": "Open", "id": "1"}})));
        assert_eq!(columns.len(), 1);
        assert_eq!(columns["status"], json!("1"));

        let columns = collapse_columns(flatten(&json!({"status": {"id": "1", "name": "Open"}})));
        assert_eq!(columns["status"], json!("Open"));
    }

    #[test]
    fn unusable_field_names_land_on_placeholder() {
        let columns = collapse_columns(vec![
            (".b".to_string(), Scalar::Number(1.into())),
            ("\u{03a3}".to_string(), Scalar::Text("x".into())),
        ]);
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[PLACEHOLDER_COLUMN], json!("x"));
    }

    #[test]
    fn null_sprint_yields_false_flags() {
        let fields = json!({"Sprint": null});
        let out = translate_fields(&named(&fields), &StatusCatalog::new());
        assert_eq!(out["sprint_ids"], JsonValue::Null);
        assert_eq!(out["sprint_names"], JsonValue::Null);
        assert_eq!(out["active_sprint"], json!(false));
        assert_eq!(out["multiple_sprints"], json!(false));
        assert_eq!(out["slotted_for_future_sprints"], json!(false));
    }

    #[test]
    fn single_active_sprint() {
        let fields = json!({"Sprint": [{"id": 1, "name": "S1", "state": "active"}]});
        let out = translate_fields(&named(&fields), &StatusCatalog::new());
        assert_eq!(out["sprint_ids"], json!([1]));
        assert_eq!(out["sprint_names"], json!("S1"));
        assert_eq!(out["active_sprint"], json!(true));
        assert_eq!(out["multiple_sprints"], json!(false));
        assert_eq!(out["slotted_for_future_sprints"], json!(false));
    }

    #[test]
    fn multiple_sprints_with_future_slot() {
        let fields = json!({"Sprint": [
            {"id": 1, "name": "S1", "state": "closed"},
            {"id": null, "name": "S2", "state": "future"}
        ]});
        let out = translate_fields(&named(&fields), &StatusCatalog::new());
        assert_eq!(out["sprint_ids"], json!([1]));
        assert_eq!(out["sprint_names"], json!("S1,S2"));
        assert_eq!(out["active_sprint"], json!(false));
        assert_eq!(out["multiple_sprints"], json!(true));
        assert_eq!(out["slotted_for_future_sprints"], json!(true));
    }

    #[test]
    fn flagged_reads_first_option() {
        let catalog = StatusCatalog::new();
        let flagged = json!({"Flagged": [{"value": "Impediment"}]});
        assert_eq!(translate_fields(&named(&flagged), &catalog)["flagged"], json!(true));

        let other = json!({"Flagged": [{"value": "Something"}]});
        assert_eq!(translate_fields(&named(&other), &catalog)["flagged"], json!(false));

        let empty = json!({"Flagged": []});
        assert_eq!(translate_fields(&named(&empty), &catalog)["flagged"], JsonValue::Null);

        let null = json!({"Flagged": null});
        assert_eq!(translate_fields(&named(&null), &catalog)["flagged"], JsonValue::Null);
    }

    #[test]
    fn issue_type_name_is_null_safe() {
        let catalog = StatusCatalog::new();
        let set = json!({"Issue Type": {"id": "10001", "name": "Task"}});
        assert_eq!(translate_fields(&named(&set), &catalog)["issue_type"], json!("Task"));
        let null = json!({"Issue Type": null});
        assert_eq!(translate_fields(&named(&null), &catalog)["issue_type"], JsonValue::Null);
    }

    #[test]
    fn time_in_status_uses_catalog_and_fills_missing_statuses() {
        let catalog = StatusCatalog::from([
            ("10000".to_string(), "In Progress".to_string()),
            ("5".to_string(), "Closed".to_string()),
        ]);
        let fields = json!({"[CHART] Time in Status": "10000_*:*1_*:*3600000_*|*3_*:*2_*:*120"});
        let out = translate_fields(&named(&fields), &catalog);

        assert_eq!(out["time_in_in_progress"], json!("3600000"));
        assert_eq!(out["time_in_status_3"], json!("120"));
        assert_eq!(out["time_in_closed"], JsonValue::Null);
        assert_eq!(out["chart_time_in_status"], json!("10000:1:3600000|3:2:120"));
    }

    #[test]
    fn shared_status_name_keeps_the_recorded_time() {
        let catalog = StatusCatalog::from([
            ("10001".to_string(), "Done".to_string()),
            ("10050".to_string(), "Done".to_string()),
        ]);
        let fields = json!({"[CHART] Time in Status": "10001_*:*1_*:*7200000"});
        let out = translate_fields(&named(&fields), &catalog);

        assert_eq!(out["time_in_done"], json!("7200000"));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn null_time_in_status_nulls_every_known_status() {
        let catalog = StatusCatalog::from([("5".to_string(), "Closed".to_string())]);
        let fields = json!({"[CHART] Time in Status": null});
        let out = translate_fields(&named(&fields), &catalog);
        assert_eq!(out.len(), 2);
        assert_eq!(out["time_in_closed"], JsonValue::Null);
        assert_eq!(out["chart_time_in_status"], JsonValue::Null);
    }

    #[test]
    fn untranslated_fields_produce_nothing() {
        let fields = json!({"Summary": "x", "Labels": ["a"]});
        assert!(translate_fields(&named(&fields), &StatusCatalog::new()).is_empty());
    }

    #[test]
    fn transformer_overlays_translation_on_flattened_row() {
        let record: RawRecord = serde_json::from_value(json!({
            "id": "10001",
            "key": "OPS-1",
            "self": "https://acme.atlassian.net/rest/api/2/issue/10001",
            "fields": {
                "summary": "Broken build",
                "issuetype": {"id": "3", "name": "Task"},
                "customfield_10020": [{"id": 7, "name": "S7", "state": "active"}],
                "status": {"name": "Open", "id": "1"}
            }
        }))
        .unwrap();
        let names = BTreeMap::from([
            ("issuetype".to_string(), "Issue Type".to_string()),
            ("customfield_10020".to_string(), "Sprint".to_string()),
        ]);
        let catalog = StatusCatalog::new();

        let row = RecordTransformer::new(&catalog).transform(&record, &names);

        assert_eq!(row.id().as_deref(), Some("10001"));
        assert_eq!(row.get("key"), Some(&json!("OPS-1")));
        assert_eq!(row.get("summary"), Some(&json!("Broken build")));
        assert_eq!(row.get("issuetype"), Some(&json!("Task")));
        assert_eq!(row.get("issue_type"), Some(&json!("Task")));
        assert_eq!(row.get("customfield10020"), Some(&json!("active")));
        assert_eq!(row.get("sprint_ids"), Some(&json!([7])));
        assert_eq!(row.get("active_sprint"), Some(&json!(true)));
        assert_eq!(row.get("status"), Some(&json!("1")));
    }
}
