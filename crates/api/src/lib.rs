//! Tabula collaborator contracts.
//!
//! This crate defines the wire shapes and traits the engine depends on: the
//! remote validation and delete transports and the field-value resolver.
//! Implementations can be in-process mocks (below) or real transports wired
//! by the host application.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;
use tabula_core::{FieldDescriptor, FieldValue, ItemKey, ListRow};

/// API errors suitable for transport across a process boundary later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Outcome field carrying a created row's server-assigned identity.
pub const NEW_IDENTITY_FIELD: &str = "Id";

/// One entry of an outbound mutation request, and equally one per-field
/// outcome of a mutation result. Outbound entries carry no verdict
/// (`HasException: false`, empty message); result entries carry the verdict,
/// and the create path reads the new identity out of an outcome's
/// `FieldValue`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FieldUpdate {
    pub field_name: String,
    #[serde(default)]
    pub field_value: Json,
    pub has_exception: bool,
    pub error_message: String,
}

impl FieldUpdate {
    /// Outbound request entry.
    pub fn new(field_name: impl Into<String>, field_value: Json) -> Self {
        Self {
            field_name: field_name.into(),
            field_value,
            has_exception: false,
            error_message: String::new(),
        }
    }

    /// Clean outcome for a field (mock/test helper).
    pub fn accepted(field_name: impl Into<String>) -> Self {
        Self::new(field_name, Json::Null)
    }

    /// Failed outcome for a field (mock/test helper).
    pub fn rejected(field_name: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            field_value: Json::Null,
            has_exception: true,
            error_message: error_message.into(),
        }
    }
}

/// Outbound payload list. Single-entry payloads are the common case.
pub type FieldUpdates = SmallVec<[FieldUpdate; 2]>;

/// Per-item mutation result: the authoritative row plus ordered per-field
/// outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    #[serde(rename = "listRow")]
    pub list_row: ListRow,
    #[serde(rename = "listFormValues")]
    pub form_values: Vec<FieldUpdate>,
}

/// One entry of a batch validation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub item_id: ItemKey,
    pub form_values: FieldUpdates,
    pub new_document: bool,
    pub check_in_comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionType {
    Recycle,
    Permanent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteTarget {
    pub key: ItemKey,
    pub properties: ListRow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteContext {
    pub items: Vec<DeleteTarget>,
    pub deletion_type: DeletionType,
    pub list_id: String,
    pub parent_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteItemResult {
    pub key: ItemKey,
    #[serde(default)]
    pub error: Option<String>,
}

/// Structured rejection from the delete collaborator. `items` enumerates
/// per-item results when the backend provides them; an item listed without
/// an error was deleted despite the overall failure.
#[derive(Debug, Clone, Default, thiserror::Error, Serialize, Deserialize)]
#[error("delete failed: {message}")]
pub struct DeleteFailure {
    pub message: String,
    pub items: Option<Vec<DeleteItemResult>>,
}

impl DeleteFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), items: None }
    }

    /// Parse the collaborator's raw rejection payload, which nests per-item
    /// results under `data.items`.
    pub fn from_payload(message: impl Into<String>, payload: &Json) -> Self {
        let items = payload
            .get("data")
            .and_then(|d| d.get("items"))
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        Self { message: message.into(), items }
    }
}

/// Remote validation transport.
#[async_trait::async_trait]
pub trait ValidationClient: Send + Sync {
    /// Validate-and-apply a field-update payload for one row.
    async fn validate_update(
        &self,
        list_url: &str,
        item_id: &str,
        updates: FieldUpdates,
        new_document: bool,
        check_in_comment: Option<&str>,
    ) -> ApiResult<UpdateResult>;

    /// Validate-and-create a new row from a field payload.
    async fn validate_create(
        &self,
        list_url: &str,
        item_id: &str,
        updates: FieldUpdates,
        new_document: bool,
        check_in_comment: Option<&str>,
    ) -> ApiResult<UpdateResult>;

    /// Validate-and-apply payloads for several rows in one round trip.
    async fn validate_update_batch(
        &self,
        list_url: &str,
        items: Vec<ItemUpdate>,
    ) -> ApiResult<Vec<UpdateResult>>;
}

/// Remote delete transport. Resolves with the deleted keys, rejects with a
/// structured failure that may still report per-item successes.
#[async_trait::async_trait]
pub trait DeleteClient: Send + Sync {
    async fn delete(&self, ctx: DeleteContext) -> Result<Vec<ItemKey>, DeleteFailure>;
}

/// Resolves the canonical raw/display pair for a field of a row. Used to
/// rebuild all-fields payloads for fields the user did not touch.
pub trait FieldValueResolver: Send + Sync {
    fn resolve(&self, field: &FieldDescriptor, item: &ListRow) -> FieldValue;
}

/// Default resolver: display value from the field slot, raw value from the
/// companion slot when present.
pub struct StoredValueResolver;

impl FieldValueResolver for StoredValueResolver {
    fn resolve(&self, field: &FieldDescriptor, item: &ListRow) -> FieldValue {
        let value = item.get(&field.real_field_name).cloned().unwrap_or(Json::Null);
        match item.get(&field.raw_slot_name()) {
            Some(raw) => FieldValue::with_raw(value, raw.clone()),
            None => FieldValue::new(value),
        }
    }
}

// ----------------- Mock implementations -----------------

/// One call made against [`MockValidationClient`].
#[derive(Debug, Clone)]
pub enum RecordedCall {
    Update {
        list_url: String,
        item_id: ItemKey,
        updates: Vec<FieldUpdate>,
        new_document: bool,
    },
    Create {
        list_url: String,
        item_id: ItemKey,
        updates: Vec<FieldUpdate>,
    },
    Batch {
        list_url: String,
        items: Vec<ItemUpdate>,
    },
}

/// Scripted in-memory validation client for tests. Responses are consumed in
/// FIFO order; calls are recorded for payload assertions; `gate()` parks the
/// next call until released, for deterministic interleaving tests.
#[derive(Default)]
pub struct MockValidationClient {
    responses: Mutex<VecDeque<ApiResult<UpdateResult>>>,
    batch_responses: Mutex<VecDeque<ApiResult<Vec<UpdateResult>>>>,
    calls: Mutex<Vec<RecordedCall>>,
    gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
}

impl MockValidationClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: ApiResult<UpdateResult>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_batch_response(&self, response: ApiResult<Vec<UpdateResult>>) {
        self.batch_responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Park the next call on a gate; the returned handle releases it.
    pub fn gate(&self) -> Arc<tokio::sync::Notify> {
        let gate = Arc::new(tokio::sync::Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    async fn wait_gate(&self) {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn next_response(&self) -> ApiResult<UpdateResult> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::Internal("mock: no scripted response".into())))
    }

    fn next_batch_response(&self) -> ApiResult<Vec<UpdateResult>> {
        self.batch_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::Internal("mock: no scripted batch response".into())))
    }
}

#[async_trait::async_trait]
impl ValidationClient for MockValidationClient {
    async fn validate_update(
        &self,
        list_url: &str,
        item_id: &str,
        updates: FieldUpdates,
        new_document: bool,
        _check_in_comment: Option<&str>,
    ) -> ApiResult<UpdateResult> {
        self.calls.lock().unwrap().push(RecordedCall::Update {
            list_url: list_url.to_string(),
            item_id: item_id.to_string(),
            updates: updates.to_vec(),
            new_document,
        });
        self.wait_gate().await;
        self.next_response()
    }

    async fn validate_create(
        &self,
        list_url: &str,
        item_id: &str,
        updates: FieldUpdates,
        _new_document: bool,
        _check_in_comment: Option<&str>,
    ) -> ApiResult<UpdateResult> {
        self.calls.lock().unwrap().push(RecordedCall::Create {
            list_url: list_url.to_string(),
            item_id: item_id.to_string(),
            updates: updates.to_vec(),
        });
        self.wait_gate().await;
        self.next_response()
    }

    async fn validate_update_batch(
        &self,
        list_url: &str,
        items: Vec<ItemUpdate>,
    ) -> ApiResult<Vec<UpdateResult>> {
        self.calls.lock().unwrap().push(RecordedCall::Batch {
            list_url: list_url.to_string(),
            items: items.clone(),
        });
        self.wait_gate().await;
        self.next_batch_response()
    }
}

/// Scripted in-memory delete client. With no scripted response, the call
/// succeeds with the requested keys.
#[derive(Default)]
pub struct MockDeleteClient {
    responses: Mutex<VecDeque<Result<Vec<ItemKey>, DeleteFailure>>>,
    contexts: Mutex<Vec<DeleteContext>>,
}

impl MockDeleteClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Result<Vec<ItemKey>, DeleteFailure>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn contexts(&self) -> Vec<DeleteContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DeleteClient for MockDeleteClient {
    async fn delete(&self, ctx: DeleteContext) -> Result<Vec<ItemKey>, DeleteFailure> {
        let fallback = || Ok(ctx.items.iter().map(|t| t.key.clone()).collect());
        self.contexts.lock().unwrap().push(ctx.clone());
        self.responses.lock().unwrap().pop_front().unwrap_or_else(fallback)
    }
}
