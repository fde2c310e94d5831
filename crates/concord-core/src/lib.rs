//! Concord Core - domain types, reconciliation engine and operation protocol.
//!
//! The remote service is reached only through the [`RemoteApi`] trait, so
//! everything in this crate can be exercised against an in-memory mock.

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod operation;
pub mod reconcile;
pub mod sync;
pub mod traits;
pub mod validation;

pub use cache::{Caches, CrossRefCache, CustomFieldIndex, RemapCache};
pub use config::{
    default_config_path, load_config, ConcordConfig, Dialect, HttpConfig, PaginationConfig,
    ReconcileConfig, Region,
};
pub use error::AppError;
pub use models::{
    CustomFieldDefinition, Dataset, EntityKind, FieldMapping, ImportOptions, LinkMapping, Row,
};
pub use operation::{
    operation_channel, DeleteRequest, EventSink, ImportRequest, LogLevel, OperationEvent,
    OperationReport, OperationService, OperationState,
};
pub use reconcile::{Reconciler, RowReport};
pub use sync::{decide, Decision, OperationResult, RowOutcome};
pub use traits::RemoteApi;
pub use validation::{validate, ValidationIssue, ValidationReport, Validator};
