//! Tabula mutation & reconciliation engine.
//!
//! Takes user edits to one or many rows, decides whether a remote validation
//! round trip is required, submits the minimal-but-correct payload, and
//! merges the per-field outcome back into the stores without losing
//! in-flight edits or clearing unrelated errors.

#![forbid(unsafe_code)]

mod payload;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use smallvec::{smallvec, SmallVec};
use tabula_api::{
    ApiError, ApiResult, DeleteClient, DeleteContext, DeleteFailure, DeleteTarget, DeletionType,
    FieldUpdate, FieldUpdates, FieldValueResolver, ItemUpdate, UpdateResult, ValidationClient,
    NEW_IDENTITY_FIELD,
};
use tabula_core::{
    is_new_row_key, raw_slot, FieldDescriptor, FieldValue, ItemKey, ItemStatus, ListRow, ID_FIELD,
    NEW_ROW_KEY_PREFIX,
};
use tabula_store::{ItemStatusStore, ItemStore, SelectionStore, StatusUpdate};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SRC_UPDATE: &str = "engine.update_field";
const SRC_BATCH: &str = "engine.update_batch";
const SRC_LOCAL: &str = "engine.local_edit";
const SRC_RECONCILE: &str = "engine.reconcile";
const SRC_CREATE: &str = "engine.create";
const SRC_CREATE_NEW_ROW: &str = "engine.create.new_row";
const SRC_CREATE_LIST_ADD: &str = "engine.create.list_add";
const SRC_DELETE: &str = "engine.delete";

/// Identifies the list this engine mutates.
#[derive(Debug, Clone, Default)]
pub struct ListContext {
    pub list_url: String,
    pub list_id: String,
    pub parent_key: String,
}

/// Placeholder key for a blank row inserted inline, before the backend
/// assigns a real identity.
pub fn new_row_key() -> ItemKey {
    format!("{}{}", NEW_ROW_KEY_PREFIX, Uuid::new_v4())
}

/// One server response folded back into store state.
struct ReconcileEntry {
    item_key: ItemKey,
    outcomes: Vec<FieldUpdate>,
    list_row: ListRow,
    value_before_save: Option<FieldValue>,
    field: Option<FieldDescriptor>,
}

/// Orchestrates single-field updates, batch updates, row creation, and
/// deletes across the three stores and the remote collaborators.
pub struct Engine {
    ctx: ListContext,
    items: Arc<ItemStore>,
    statuses: Arc<ItemStatusStore>,
    selection: Arc<SelectionStore>,
    validator: Arc<dyn ValidationClient>,
    deleter: Arc<dyn DeleteClient>,
    resolver: Arc<dyn FieldValueResolver>,
    /// Per-key request sequence. Every edit entry point bumps it; a
    /// resolution holding a stale token is dropped so it cannot overwrite a
    /// newer edit.
    seq: Mutex<FxHashMap<ItemKey, u64>>,
}

impl Engine {
    pub fn new(
        ctx: ListContext,
        items: Arc<ItemStore>,
        statuses: Arc<ItemStatusStore>,
        selection: Arc<SelectionStore>,
        validator: Arc<dyn ValidationClient>,
        deleter: Arc<dyn DeleteClient>,
        resolver: Arc<dyn FieldValueResolver>,
    ) -> Self {
        Self {
            ctx,
            items,
            statuses,
            selection,
            validator,
            deleter,
            resolver,
            seq: Mutex::new(FxHashMap::default()),
        }
    }

    /// Validate one edited field of a row.
    ///
    /// A clean row gets a single-entry payload. An erroring row is edited
    /// locally only — unless the target is the sole remaining erroring
    /// field, in which case every field is resubmitted so cross-field rules
    /// are re-checked and unrelated visible state is not wiped. Resolves
    /// with `None` when no remote call was made.
    pub async fn update_field(
        &self,
        item: &ListRow,
        target: &FieldDescriptor,
        new_value: FieldValue,
        all_fields: &[FieldDescriptor],
    ) -> ApiResult<Option<UpdateResult>> {
        let item_key = self
            .items
            .item_key(item)
            .ok_or_else(|| ApiError::NotFound("row has no identity".into()))?;
        let raw = new_value.effective_raw();

        let old_status = self.statuses.get_status(&item_key);
        let has_error = old_status.as_ref().map(|s| s.has_error).unwrap_or(false);

        let mut should_request = true;
        let mut use_all_fields = false;
        if has_error {
            should_request = false;
            if let Some(status) = &old_status {
                let errors = &status.fields_with_errors;
                if errors.len() == 1 && errors.contains_key(&target.real_field_name) {
                    use_all_fields = true;
                    should_request = true;
                }
            }
        }

        if !should_request {
            self.apply_local_edits(&item_key, item, &[(target, new_value)]);
            self.bump_seq(&item_key);
            return Ok(None);
        }

        let updates: FieldUpdates = if use_all_fields {
            payload::build_field_updates(
                item,
                all_fields,
                Some((target.real_field_name.as_str(), &raw)),
                self.resolver.as_ref(),
            )
            .map_err(|e| ApiError::Internal(e.to_string()))?
        } else {
            smallvec![FieldUpdate::new(target.real_field_name.clone(), raw)]
        };

        let mut marked = old_status.unwrap_or_default();
        marked.is_updating = true;
        self.statuses
            .update_statuses(SRC_UPDATE, vec![StatusUpdate::new(item_key.clone(), marked)]);

        let token = self.bump_seq(&item_key);
        let t0 = Instant::now();
        counter!("update_attempts", 1u64);
        info!(item = %item_key, field = %target.real_field_name, all_fields = use_all_fields, "engine: update start");

        let result = match self
            .validator
            .validate_update(&self.ctx.list_url, &item_key, updates, false, None)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                counter!("update_err", 1u64);
                self.clear_updating(std::slice::from_ref(&item_key));
                warn!(item = %item_key, error = %e, "engine: update failed");
                return Err(e);
            }
        };

        histogram!("update_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("update_ok", 1u64);

        if self.seq_current(&item_key) != token {
            counter!("stale_responses_total", 1u64);
            warn!(item = %item_key, "engine: dropping stale update response");
            self.clear_updating(std::slice::from_ref(&item_key));
            return Ok(Some(result));
        }

        self.reconcile(vec![ReconcileEntry {
            item_key,
            outcomes: result.form_values.clone(),
            list_row: result.list_row.clone(),
            value_before_save: Some(new_value),
            field: Some(target.clone()),
        }]);

        Ok(Some(result))
    }

    /// Validate edits to the same field set across several rows.
    ///
    /// The remote-or-local decision is made per row: rows whose erroring
    /// fields are not all covered by the edit get local-only updates; rows
    /// whose erroring fields are all covered get an all-fields payload;
    /// clean rows get a payload of just the edited fields. The remote subset
    /// goes out in one batch call. Resolves with the remote results (empty
    /// when every row was handled locally).
    pub async fn update_batch(
        &self,
        items: &[ListRow],
        fields: &[FieldDescriptor],
        all_fields: &[FieldDescriptor],
    ) -> ApiResult<Vec<UpdateResult>> {
        let mut marking: Vec<StatusUpdate> = Vec::new();
        let mut remote: Vec<ItemUpdate> = Vec::new();

        for item in items {
            let Some(item_key) = self.items.item_key(item) else {
                warn!("engine: skipping batch row without identity");
                continue;
            };
            let old_status = self.statuses.get_status(&item_key);
            let has_error = old_status.as_ref().map(|s| s.has_error).unwrap_or(false);

            let mut fields_to_send = fields;
            let mut remote_bound = true;
            if has_error {
                let errors = old_status
                    .as_ref()
                    .map(|s| s.fields_with_errors.clone())
                    .unwrap_or_default();
                let edited_error_fields = fields
                    .iter()
                    .filter(|f| errors.contains_key(&f.real_field_name))
                    .count();
                if errors.len() == edited_error_fields {
                    // Last erroring fields are being edited: revalidate all.
                    fields_to_send = all_fields;
                } else {
                    remote_bound = false;
                }
            }

            if !remote_bound {
                let edits: Vec<(&FieldDescriptor, FieldValue)> = fields
                    .iter()
                    .map(|field| {
                        let current =
                            item.get(&field.real_field_name).cloned().unwrap_or(Json::Null);
                        (field, FieldValue::new(current))
                    })
                    .collect();
                self.apply_local_edits(&item_key, item, &edits);
                self.bump_seq(&item_key);
                continue;
            }

            let updates = payload::build_field_updates(
                item,
                fields_to_send,
                None,
                self.resolver.as_ref(),
            )
            .map_err(|e| ApiError::Internal(e.to_string()))?;

            let mut marked = old_status.unwrap_or_default();
            marked.is_updating = true;
            marking.push(StatusUpdate::new(item_key.clone(), marked));
            remote.push(ItemUpdate {
                item_id: item_key,
                form_values: updates,
                new_document: false,
                check_in_comment: None,
            });
        }

        // One status flush for the whole batch, before dispatch.
        self.statuses.update_statuses(SRC_BATCH, marking);

        if remote.is_empty() {
            return Ok(Vec::new());
        }

        let dispatched: Vec<ItemKey> = remote.iter().map(|u| u.item_id.clone()).collect();
        let mut tokens: FxHashMap<ItemKey, u64> = FxHashMap::default();
        for key in &dispatched {
            tokens.insert(key.clone(), self.bump_seq(key));
        }

        let t0 = Instant::now();
        counter!("batch_attempts", 1u64);
        info!(count = remote.len(), "engine: batch update start");

        let results = match self
            .validator
            .validate_update_batch(&self.ctx.list_url, remote)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                counter!("batch_err", 1u64);
                self.clear_updating(&dispatched);
                warn!(error = %e, "engine: batch update failed");
                return Err(e);
            }
        };

        histogram!("batch_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("batch_ok", 1u64);

        let entries: Vec<ReconcileEntry> = results
            .iter()
            .filter_map(|result| {
                let Some(key) = result.list_row.key() else {
                    warn!("engine: batch result row without identity");
                    return None;
                };
                if let Some(token) = tokens.get(&key) {
                    if self.seq_current(&key) != *token {
                        counter!("stale_responses_total", 1u64);
                        warn!(item = %key, "engine: dropping stale batch entry");
                        return None;
                    }
                }
                Some(ReconcileEntry {
                    item_key: key,
                    outcomes: result.form_values.clone(),
                    list_row: result.list_row.clone(),
                    value_before_save: None,
                    field: None,
                })
            })
            .collect();
        self.reconcile(entries);

        Ok(results)
    }

    /// Create a new row from a placeholder-keyed item.
    ///
    /// The creation response is not shaped for direct consumption, so once
    /// the server-assigned identity is known a follow-up validation with an
    /// empty update set fetches a render-shaped row, which is appended
    /// through the new-item path.
    pub async fn create_item(&self, item: &ListRow) -> ApiResult<()> {
        let temp_key = self
            .items
            .item_key(item)
            .ok_or_else(|| ApiError::NotFound("row has no identity".into()))?;

        let mut updates: FieldUpdates = SmallVec::with_capacity(item.fields.len());
        for (name, value) in &item.fields {
            if name != ID_FIELD {
                updates.push(FieldUpdate::new(name.clone(), value.clone()));
            }
        }

        self.statuses.update_statuses(
            SRC_CREATE,
            vec![StatusUpdate::new(
                temp_key.clone(),
                ItemStatus { is_updating: true, ..ItemStatus::default() },
            )],
        );

        let t0 = Instant::now();
        counter!("create_attempts", 1u64);
        info!(item = %temp_key, fields = updates.len(), "engine: create start");

        let created = match self
            .validator
            .validate_create(&self.ctx.list_url, &temp_key, updates, false, None)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                counter!("create_err", 1u64);
                self.clear_updating(std::slice::from_ref(&temp_key));
                warn!(item = %temp_key, error = %e, "engine: create failed");
                return Err(e);
            }
        };

        let new_id = created
            .form_values
            .iter()
            .find(|outcome| outcome.field_name == NEW_IDENTITY_FIELD)
            .and_then(|outcome| match &outcome.field_value {
                Json::String(s) => Some(s.clone()),
                Json::Number(n) => Some(n.to_string()),
                _ => None,
            });

        let Some(new_id) = new_id else {
            counter!("create_err", 1u64);
            self.clear_updating(std::slice::from_ref(&temp_key));
            warn!(item = %temp_key, "engine: create response carried no identity");
            return Err(ApiError::Internal("create response carried no identity".into()));
        };

        let fetched = match self
            .validator
            .validate_update(&self.ctx.list_url, &new_id, SmallVec::new(), false, None)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                counter!("create_err", 1u64);
                self.clear_updating(std::slice::from_ref(&temp_key));
                warn!(item = %new_id, error = %e, "engine: created row fetch failed");
                return Err(e);
            }
        };

        let source = if is_new_row_key(&temp_key) { SRC_CREATE_NEW_ROW } else { SRC_CREATE_LIST_ADD };
        self.items.add_new_items(source, vec![fetched.list_row]);
        self.statuses.delete_statuses(std::slice::from_ref(&temp_key));

        histogram!("create_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("create_ok", 1u64);
        info!(item = %new_id, "engine: create ok");
        Ok(())
    }

    /// Delete rows through the remote delete collaborator.
    ///
    /// On full success every requested key is removed from the item,
    /// selection, and status stores. On failure, items the failure report
    /// lists without an error were still deleted and are removed the same
    /// way; the raw failure is returned either way so the caller can drive
    /// error UX.
    pub async fn delete_items(&self, items: &[ListRow]) -> Result<Vec<ItemKey>, DeleteFailure> {
        let targets: Vec<DeleteTarget> = items
            .iter()
            .filter_map(|item| match self.items.item_key(item) {
                Some(key) => Some(DeleteTarget { key, properties: item.clone() }),
                None => {
                    warn!("engine: skipping delete row without identity");
                    None
                }
            })
            .collect();
        let keys: Vec<ItemKey> = targets.iter().map(|t| t.key.clone()).collect();

        let ctx = DeleteContext {
            items: targets,
            deletion_type: DeletionType::Recycle,
            list_id: self.ctx.list_id.clone(),
            parent_key: self.ctx.parent_key.clone(),
        };

        info!(count = keys.len(), "engine: delete start");
        match self.deleter.delete(ctx).await {
            Ok(_) => {
                counter!("delete_ok", 1u64);
                self.process_deleted(&keys);
                Ok(keys)
            }
            Err(failure) => {
                // Items reported without an error were deleted despite the
                // overall failure.
                if let Some(results) = &failure.items {
                    let deleted: Vec<ItemKey> = results
                        .iter()
                        .filter(|r| r.error.is_none())
                        .map(|r| r.key.clone())
                        .collect();
                    if !deleted.is_empty() {
                        counter!("delete_partial_total", 1u64);
                        self.process_deleted(&deleted);
                    }
                }
                warn!(error = %failure, "engine: delete failed");
                Err(failure)
            }
        }
    }

    fn process_deleted(&self, keys: &[ItemKey]) {
        self.items.delete_items(SRC_DELETE, keys);
        self.selection.remove(SRC_DELETE, keys);
        self.statuses.delete_statuses(keys);
        self.forget_seq(keys);
        debug!(count = keys.len(), "engine: rows removed");
    }

    /// Fold server responses back into store state: one status-update batch,
    /// one status-delete batch, one item-collection update batch.
    fn reconcile(&self, entries: Vec<ReconcileEntry>) {
        let mut status_updates: Vec<StatusUpdate> = Vec::new();
        let mut status_deletes: Vec<ItemKey> = Vec::new();
        let mut rows: Vec<ListRow> = Vec::new();

        for entry in entries {
            // Read current store state at resolution time, not a snapshot
            // captured at call time.
            let Some(mut row) = self.items.get_item(&entry.item_key) else {
                counter!("reconcile_missing_total", 1u64);
                warn!(item = %entry.item_key, "engine: row missing from store; skipping entry");
                status_deletes.push(entry.item_key);
                continue;
            };
            let mut errors = self
                .statuses
                .get_status(&entry.item_key)
                .map(|s| s.fields_with_errors)
                .unwrap_or_default();

            for outcome in &entry.outcomes {
                fold_outcome(
                    &mut row,
                    outcome,
                    &mut errors,
                    entry.value_before_save.as_ref(),
                    entry.field.as_ref(),
                );
            }

            if errors.is_empty() {
                // The server is authoritative once the row is clean.
                row.merge_from(&entry.list_row);
                status_deletes.push(entry.item_key);
            } else {
                // The echoed row reflects the rejected state; keep the local
                // values the user last committed.
                status_updates
                    .push(StatusUpdate::new(entry.item_key, ItemStatus::with_errors(errors)));
            }
            rows.push(row);
        }

        self.statuses.update_statuses(SRC_RECONCILE, status_updates);
        self.statuses.delete_statuses(&status_deletes);
        self.items.update_items(SRC_RECONCILE, rows);
    }

    /// Apply edits without a network round trip: used while other fields of
    /// the row still have unresolved errors. Clearing the edited field's own
    /// error is unconditional — validity is confirmed only once the last
    /// error is cleared and a real round trip runs.
    fn apply_local_edits(
        &self,
        item_key: &str,
        item: &ListRow,
        edits: &[(&FieldDescriptor, FieldValue)],
    ) {
        let old_status = self.statuses.get_status(item_key).unwrap_or_default();
        let mut errors = old_status.fields_with_errors;
        let mut row = item.clone();
        for (target, new_value) in edits {
            errors.remove(&target.real_field_name);
            row.set(target.real_field_name.clone(), new_value.value.clone());
            row.set(raw_slot(&target.real_field_name), new_value.effective_raw());
        }

        let status = ItemStatus {
            is_updating: old_status.is_updating,
            has_error: !errors.is_empty(),
            fields_with_errors: errors,
        };
        self.statuses
            .update_statuses(SRC_LOCAL, vec![StatusUpdate::new(item_key.to_string(), status)]);
        self.items.update_items(SRC_LOCAL, vec![row]);
        debug!(item = %item_key, count = edits.len(), "engine: local edit applied");
    }

    /// Drop the in-flight flag after a failed or superseded round trip.
    /// Converged entries (no errors, not updating) are removed outright.
    fn clear_updating(&self, keys: &[ItemKey]) {
        let mut updates: Vec<StatusUpdate> = Vec::new();
        let mut deletes: Vec<ItemKey> = Vec::new();
        for key in keys {
            if let Some(mut status) = self.statuses.get_status(key) {
                status.is_updating = false;
                if status.has_error {
                    updates.push(StatusUpdate::new(key.clone(), status));
                } else {
                    deletes.push(key.clone());
                }
            }
        }
        self.statuses.update_statuses(SRC_RECONCILE, updates);
        self.statuses.delete_statuses(&deletes);
    }

    fn bump_seq(&self, key: &str) -> u64 {
        let mut seq = self.seq.lock().unwrap();
        let counter = seq.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn seq_current(&self, key: &str) -> u64 {
        self.seq.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    fn forget_seq(&self, keys: &[ItemKey]) {
        let mut seq = self.seq.lock().unwrap();
        for key in keys {
            seq.remove(key);
        }
    }
}

/// Fold one per-field outcome into the row and error map. Returns nothing;
/// the final error map decides the row's status.
fn fold_outcome(
    row: &mut ListRow,
    outcome: &FieldUpdate,
    errors: &mut BTreeMap<String, String>,
    value_before_save: Option<&FieldValue>,
    field: Option<&FieldDescriptor>,
) {
    // The round trip is trusted for validity, not value: a single targeted
    // edit keeps the committed pre-save value rather than the echoed one,
    // which may not be shaped for display.
    if let (Some(before), Some(field)) = (value_before_save, field) {
        if field.real_field_name == outcome.field_name {
            row.set(field.real_field_name.clone(), before.value.clone());
            if let Some(raw) = &before.raw_value {
                row.set(field.raw_slot_name(), raw.clone());
            }
        }
    }

    if outcome.has_exception {
        errors.insert(outcome.field_name.clone(), outcome.error_message.clone());
    } else {
        errors.remove(&outcome.field_name);
    }
}
