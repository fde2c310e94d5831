//! Trait definitions for the remote service.
//!
//! The reconciliation engine, the cache builders and the operation protocol
//! only see [`RemoteApi`]. `concord-client` implements it over HTTP; tests
//! implement it in memory.
//!
//! # Example
//!
//! ```
//! use concord_core::traits::RemoteApi;
//! use concord_core::{AppError, EntityKind};
//!
//! async fn count_companies<A: RemoteApi>(api: &A) -> Result<usize, AppError> {
//!     Ok(api.list_records(EntityKind::Company, 10_000).await?.len())
//! }
//! ```

use std::future::Future;

use serde_json::{Map, Value};

use crate::{AppError, CustomFieldDefinition, EntityKind};

/// Operations the core needs from the remote service.
///
/// Implementations are expected to apply their own transient-failure retry
/// policy; errors surfacing from these methods are final for that call.
pub trait RemoteApi: Send + Sync + Clone {
    /// Drains the whole collection of `kind`, stopping at `cap` records.
    fn list_records(
        &self,
        kind: EntityKind,
        cap: usize,
    ) -> impl Future<Output = Result<Vec<Value>, AppError>> + Send;

    /// Lists custom-field definitions declared for `kind`.
    fn custom_field_definitions(
        &self,
        kind: EntityKind,
    ) -> impl Future<Output = Result<Vec<CustomFieldDefinition>, AppError>> + Send;

    /// Creates a record and returns its identifier.
    fn create_record(
        &self,
        kind: EntityKind,
        payload: &Map<String, Value>,
    ) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Partially updates a record.
    fn update_record(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Map<String, Value>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn delete_record(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Links `id` to `target_id` under `relation`.
    fn link_records(
        &self,
        kind: EntityKind,
        id: &str,
        relation: &str,
        target_id: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Writes one custom-field value through the eventually-consistent v2 API.
    fn write_custom_field(
        &self,
        kind: EntityKind,
        id: &str,
        field_id: &str,
        value: &Value,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}
