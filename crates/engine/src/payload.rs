//! Outbound payload construction: per-kind field value encoding.

use anyhow::{bail, Context, Result};
use serde_json::Value as Json;
use smallvec::SmallVec;
use tabula_api::{FieldUpdate, FieldUpdates, FieldValueResolver};
use tabula_core::{FieldDescriptor, FieldKind, ListRow};

fn max_payload_fields() -> usize {
    std::env::var("TABULA_MAX_PAYLOAD_FIELDS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1024)
}

/// `Key` must carry the entry's email for the backend to resolve the user;
/// the whole array is JSON-packed into a string for transmission.
fn pack_users(users: &[Json]) -> Result<Json> {
    let packed: Vec<Json> = users
        .iter()
        .map(|user| match user {
            Json::Object(map) => {
                let mut entry = map.clone();
                if let Some(email) = entry.get("email").cloned() {
                    entry.insert("Key".to_string(), email);
                }
                Json::Object(entry)
            }
            other => other.clone(),
        })
        .collect();
    let text = serde_json::to_string(&packed).context("packing user entries")?;
    Ok(Json::String(text))
}

fn pack_json(value: &Json) -> Result<Json> {
    let text = serde_json::to_string(value).context("packing field value")?;
    Ok(Json::String(text))
}

/// Encode one untouched field of `item` for transmission, following its
/// schema kind: User arrays are packed with resolvable keys, Thumbnail
/// values are packed unless already a string, DateTime values pass through,
/// everything else is re-derived through the resolver (raw preferred).
fn encode_field(
    field: &FieldDescriptor,
    item: &ListRow,
    resolver: &dyn FieldValueResolver,
) -> Result<Json> {
    let current = item.get(&field.real_field_name).cloned().unwrap_or(Json::Null);
    if current.is_null() {
        return Ok(current);
    }
    let encoded = if let (FieldKind::User, Json::Array(users)) = (field.kind, &current) {
        pack_users(users)?
    } else if field.kind == FieldKind::Thumbnail && !current.is_string() {
        pack_json(&current)?
    } else if field.kind != FieldKind::DateTime {
        resolver.resolve(field, item).effective_raw()
    } else {
        current
    };
    Ok(encoded)
}

/// Build the outbound entries for `fields`. `override_value` substitutes the
/// committed raw form for the one field whose edit has not landed on the row
/// yet.
pub(crate) fn build_field_updates(
    item: &ListRow,
    fields: &[FieldDescriptor],
    override_value: Option<(&str, &Json)>,
    resolver: &dyn FieldValueResolver,
) -> Result<FieldUpdates> {
    let limit = max_payload_fields();
    if fields.len() > limit {
        bail!("payload too large ({} fields, limit {})", fields.len(), limit);
    }
    let mut updates: FieldUpdates = SmallVec::with_capacity(fields.len());
    for field in fields {
        let value = match override_value {
            Some((name, raw)) if name == field.real_field_name => (*raw).clone(),
            _ => encode_field(field, item, resolver)?,
        };
        updates.push(FieldUpdate::new(field.real_field_name.clone(), value));
    }
    Ok(updates)
}
