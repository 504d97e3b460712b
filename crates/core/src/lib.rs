//! Tabula core types: rows, field schema, per-row status.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Stable identifier for a row, used across all three stores.
pub type ItemKey = String;

/// Name of the identity field every persisted row carries.
pub const ID_FIELD: &str = "ID";

/// Placeholder-key prefix for blank rows inserted inline at the bottom of a
/// list, as opposed to rows created through a list-level add action.
pub const NEW_ROW_KEY_PREFIX: &str = "new-row-";

pub fn is_new_row_key(key: &str) -> bool {
    key.starts_with(NEW_ROW_KEY_PREFIX)
}

/// Companion raw-value slot for a field (`"Title"` -> `"Title."`).
pub fn raw_slot(field_name: &str) -> String {
    format!("{field_name}.")
}

/// A row: a flat mapping from field name to JSON field value.
///
/// A field `F` may carry a companion raw slot under the key `F.` (see
/// [`raw_slot`]); Boolean fields address theirs as `F.value` instead
/// ([`FieldDescriptor::raw_slot_name`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListRow {
    #[serde(flatten)]
    pub fields: BTreeMap<String, Json>,
}

impl ListRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// The identity field as a key. Numeric identities are rendered in
    /// decimal so they key the stores the same way the wire renders them.
    pub fn key(&self) -> Option<ItemKey> {
        match self.fields.get(ID_FIELD) {
            Some(Json::String(s)) => Some(s.clone()),
            Some(Json::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn get(&self, field_name: &str) -> Option<&Json> {
        self.fields.get(field_name)
    }

    pub fn set(&mut self, field_name: impl Into<String>, value: Json) {
        self.fields.insert(field_name.into(), value);
    }

    /// Derive a new row with one field replaced. Store-owned rows are never
    /// mutated in place; edits flow through copies handed back to the store.
    pub fn with_field(&self, field_name: impl Into<String>, value: Json) -> Self {
        let mut row = self.clone();
        row.set(field_name, value);
        row
    }

    /// Overlay another row's fields onto this one (spread semantics: fields
    /// absent from `other` are kept).
    pub fn merge_from(&mut self, other: &ListRow) {
        for (name, value) in &other.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }
}

/// Closed set of field types that drive payload value encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    User,
    Thumbnail,
    DateTime,
    Boolean,
    Other,
}

/// Static schema entry for one field. Owned by the schema layer; the engine
/// and stores only read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub real_field_name: String,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    pub fn new(real_field_name: impl Into<String>, kind: FieldKind) -> Self {
        Self { real_field_name: real_field_name.into(), kind }
    }

    /// Raw companion slot for this field. Boolean raw values live under
    /// `F.value` rather than `F.`.
    pub fn raw_slot_name(&self) -> String {
        match self.kind {
            FieldKind::Boolean => format!("{}.value", self.real_field_name),
            _ => raw_slot(&self.real_field_name),
        }
    }
}

/// Raw/display value pair, as produced by field editors and by the
/// field-value resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: Json,
    pub raw_value: Option<Json>,
}

impl FieldValue {
    pub fn new(value: Json) -> Self {
        Self { value, raw_value: None }
    }

    pub fn with_raw(value: Json, raw_value: Json) -> Self {
        Self { value, raw_value: Some(raw_value) }
    }

    /// The form the validation API expects: raw when present, display
    /// otherwise.
    pub fn effective_raw(&self) -> Json {
        self.raw_value.clone().unwrap_or_else(|| self.value.clone())
    }
}

/// Transient per-row status.
///
/// Invariant: `has_error` iff `fields_with_errors` is non-empty. Entries are
/// created on first edit attempt and deleted once a row converges (no
/// errors, no pending update).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemStatus {
    pub is_updating: bool,
    pub has_error: bool,
    pub fields_with_errors: BTreeMap<String, String>,
}

impl ItemStatus {
    /// Status for a settled row with the given error map; `has_error` is
    /// derived from the map so the invariant holds by construction.
    pub fn with_errors(fields_with_errors: BTreeMap<String, String>) -> Self {
        Self { is_updating: false, has_error: !fields_with_errors.is_empty(), fields_with_errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_key_renders_numbers_as_decimal() {
        let mut row = ListRow::new();
        row.set(ID_FIELD, json!(5));
        assert_eq!(row.key().as_deref(), Some("5"));

        row.set(ID_FIELD, json!("abc"));
        assert_eq!(row.key().as_deref(), Some("abc"));

        row.set(ID_FIELD, json!(null));
        assert_eq!(row.key(), None);
    }

    #[test]
    fn merge_from_overlays_without_dropping() {
        let mut row = ListRow::new();
        row.set("Title", json!("x"));
        row.set("Owner", json!("a"));

        let mut echoed = ListRow::new();
        echoed.set("Title", json!("y"));

        row.merge_from(&echoed);
        assert_eq!(row.get("Title"), Some(&json!("y")));
        assert_eq!(row.get("Owner"), Some(&json!("a")));
    }

    #[test]
    fn raw_slot_naming_follows_boolean_convention() {
        let title = FieldDescriptor::new("Title", FieldKind::Other);
        assert_eq!(title.raw_slot_name(), "Title.");

        let done = FieldDescriptor::new("Done", FieldKind::Boolean);
        assert_eq!(done.raw_slot_name(), "Done.value");
    }

    #[test]
    fn effective_raw_prefers_raw_form() {
        let v = FieldValue::with_raw(json!("Jan 1, 2024"), json!("2024-01-01"));
        assert_eq!(v.effective_raw(), json!("2024-01-01"));

        let v = FieldValue::new(json!("y"));
        assert_eq!(v.effective_raw(), json!("y"));
    }

    #[test]
    fn status_invariant_holds_by_construction() {
        let empty = ItemStatus::with_errors(BTreeMap::new());
        assert!(!empty.has_error);

        let mut errors = BTreeMap::new();
        errors.insert("Title".to_string(), "required".to_string());
        let erroring = ItemStatus::with_errors(errors);
        assert!(erroring.has_error);
        assert!(!erroring.is_updating);
    }

    #[test]
    fn new_row_keys_are_recognized() {
        assert!(is_new_row_key("new-row-42"));
        assert!(!is_new_row_key("42"));
    }
}
