//! Long-running, cancellable operations with incremental reporting.
//!
//! An operation streams [`OperationEvent`]s to its consumer over a bounded
//! channel created by [`operation_channel`]. The consumer cancels the
//! operation by dropping its receiver. The sink checks the *outbound* channel
//! for closure directly before each row, and a failed send trips its
//! [`CancellationToken`]. A watcher task also trips the token so callers
//! holding only the token see the disconnect. A row already in flight always
//! completes and nothing after it is sent to the remote service.
//!
//! # State machine
//!
//! ```text
//! Started -> (CollectingCaches) -> ProcessingRows -> Completed | Aborted | Failed
//! ```
//!
//! Exactly one terminal event (`complete` or `error`) is emitted per
//! operation, after which the channel is closed. This holds for errors and for
//! panics raised while building caches or iterating rows.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::{build_cross_ref_cache, build_custom_field_index, build_remap_cache, Caches};
use crate::config::ReconcileConfig;
use crate::models::{is_well_formed_identifier, Dataset, EntityKind, FieldMapping, ImportOptions, Row};
use crate::reconcile::{delete_record, Compensation, DeleteOutcome, Reconciler, RowReport};
use crate::sync::{Decision, OperationResult, RowOutcome};
use crate::traits::RemoteApi;
use crate::validation::Validator;
use crate::AppError;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

/// One message on the operation stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OperationEvent {
    Progress {
        message: String,
        percent: u8,
    },
    Log {
        level: LogLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Complete(OperationResult),
    Error {
        message: String,
    },
}

impl OperationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Started,
    CollectingCaches,
    ProcessingRows,
    Completed,
    Aborted,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }
}

/// Producer side of an operation stream.
///
/// Dropping the sink (or calling [`EventSink::finish`]) closes the stream
/// from the producer side.
pub struct EventSink {
    tx: mpsc::Sender<OperationEvent>,
    cancel: CancellationToken,
    done: CancellationToken,
    percent: u8,
}

/// Creates an operation stream.
///
/// Must be called from within a Tokio runtime: it spawns the task that
/// watches for the consumer going away.
pub fn operation_channel(buffer: usize) -> (EventSink, mpsc::Receiver<OperationEvent>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let cancel = CancellationToken::new();
    let done = CancellationToken::new();

    let watcher_tx = tx.clone();
    let watcher_cancel = cancel.clone();
    let watcher_done = done.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = watcher_tx.closed() => {
                tracing::info!("Event consumer disconnected, cancelling operation");
                watcher_cancel.cancel();
            }
            _ = watcher_done.cancelled() => {}
        }
    });

    (
        EventSink {
            tx,
            cancel,
            done,
            percent: 0,
        },
        rx,
    )
}

impl EventSink {
    /// Returns true once the consumer disconnected or the operation was
    /// cancelled through [`EventSink::cancellation_token`].
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Token that cancels this operation when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn emit(&self, event: OperationEvent) {
        if self.tx.send(event).await.is_err() {
            self.cancel.cancel();
        }
    }

    /// Emits a progress event. Percentages never go backwards.
    pub async fn progress(&mut self, message: impl Into<String>, percent: u8) {
        self.percent = self.percent.max(percent.min(100));
        let percent = self.percent;
        self.emit(OperationEvent::Progress {
            message: message.into(),
            percent,
        })
        .await;
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>, detail: Option<String>) {
        self.emit(OperationEvent::Log {
            level,
            message: message.into(),
            detail,
        })
        .await;
    }

    /// Emits the terminal event and closes the stream.
    pub async fn finish(self, event: OperationEvent) {
        debug_assert!(event.is_terminal());
        self.emit(event).await;
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

/// Import (or migration) request.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub kind: EntityKind,
    pub dataset: Dataset,
    pub mapping: FieldMapping,
    pub options: ImportOptions,
}

/// Bulk delete request: every row names an identifier in `id_column`.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub kind: EntityKind,
    pub dataset: Dataset,
    pub id_column: String,
}

/// What the caller gets back once the stream is closed.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub operation_id: Uuid,
    pub state: OperationState,
    /// Present for `Completed` and `Aborted`.
    pub result: Option<OperationResult>,
    /// Present for `Failed`.
    pub error: Option<String>,
    /// Lines of rows that ended in error.
    pub failed_lines: Vec<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Mutable bookkeeping shared between the runner and the operation body.
struct Progress {
    state: OperationState,
    failed_lines: Vec<usize>,
}

/// Service running import and delete operations against one remote.
///
/// # Example
///
/// ```ignore
/// let service = OperationService::new(client, ReconcileConfig::default());
/// let (sink, mut events) = operation_channel(DEFAULT_EVENT_BUFFER);
/// let handle = tokio::spawn(async move { service.run_import(request, sink).await });
/// while let Some(event) = events.recv().await {
///     println!("{}", serde_json::to_string(&event)?);
/// }
/// let report = handle.await?;
/// ```
#[derive(Clone)]
pub struct OperationService<A: RemoteApi> {
    api: A,
    config: ReconcileConfig,
}

impl<A: RemoteApi> OperationService<A> {
    pub fn new(api: A, config: ReconcileConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Runs an import, streaming events into `sink`.
    pub async fn run_import(&self, mut request: ImportRequest, mut sink: EventSink) -> OperationReport {
        let operation_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "import",
            operation_id = %operation_id,
            kind = %request.kind,
            rows = request.dataset.rows.len()
        );
        let started_at = Utc::now();
        let mut progress = Progress {
            state: OperationState::Started,
            failed_lines: Vec::new(),
        };

        let outcome = AssertUnwindSafe(
            self.execute_import(&mut request, &mut sink, &mut progress)
                .instrument(span.clone()),
        )
        .catch_unwind()
        .await;

        finalize(operation_id, started_at, outcome, progress, sink)
            .instrument(span)
            .await
    }

    /// Runs a bulk delete, streaming events into `sink`.
    pub async fn run_delete(&self, request: DeleteRequest, mut sink: EventSink) -> OperationReport {
        let operation_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "delete",
            operation_id = %operation_id,
            kind = %request.kind,
            rows = request.dataset.rows.len()
        );
        let started_at = Utc::now();
        let mut progress = Progress {
            state: OperationState::Started,
            failed_lines: Vec::new(),
        };

        let outcome = AssertUnwindSafe(
            self.execute_delete(&request, &mut sink, &mut progress)
                .instrument(span.clone()),
        )
        .catch_unwind()
        .await;

        finalize(operation_id, started_at, outcome, progress, sink)
            .instrument(span)
            .await
    }

    /// Builds every cache an import needs.
    pub async fn collect_caches(&self, request: &ImportRequest) -> Result<Caches, AppError> {
        let cap = self.config.pagination.record_cap;
        let mut kinds = vec![request.kind];
        for link in request.mapping.links.values() {
            if !kinds.contains(&link.target) {
                kinds.push(link.target);
            }
        }

        let mut caches = Caches::default();
        for &kind in &kinds {
            let cache = build_cross_ref_cache(&self.api, kind, cap).await?;
            caches.lookups.insert(kind, cache);
        }

        let options = &request.options;
        if !request.mapping.custom_fields.is_empty() || options.migration_mode {
            caches.fields = build_custom_field_index(&self.api, request.kind).await?;
        }

        if options.migration_mode {
            match options.remap_field_name.as_deref() {
                Some(field) => {
                    caches.remap = build_remap_cache(&self.api, field, &kinds, cap).await?;
                }
                None => tracing::warn!("Migration mode without a remap field; ids will not be remapped"),
            }
        }

        Ok(caches)
    }

    async fn execute_import(
        &self,
        request: &mut ImportRequest,
        sink: &mut EventSink,
        progress: &mut Progress,
    ) -> Result<OperationResult, AppError> {
        let kind = request.kind;
        let validator = Validator::new(kind).with_migration_mode(request.options.migration_mode);
        let mapping_errors = validator.check_mapping(&request.mapping, &request.dataset.headers);
        if !mapping_errors.is_empty() {
            let summary = mapping_errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AppError::ConfigError(summary));
        }

        progress.state = OperationState::CollectingCaches;
        sink.progress(format!("Loading existing {} records", kind), 0)
            .await;
        let mut caches = self.collect_caches(request).await?;
        let known = caches.lookup(kind).map(|c| c.len()).unwrap_or_default();
        sink.log(
            LogLevel::Info,
            format!("Loaded {} existing {} records", known, kind),
            (!caches.remap.is_empty())
                .then(|| format!("{} remapped identifiers", caches.remap.len())),
        )
        .await;

        progress.state = OperationState::ProcessingRows;
        let total = request.dataset.rows.len();
        let mut result = OperationResult::new(total);
        let reconciler = Reconciler::new(
            &self.api,
            kind,
            &request.mapping,
            &request.options,
            &self.config,
        );

        for (index, row) in request.dataset.rows.iter_mut().enumerate() {
            if sink.is_cancelled() {
                result.stopped = true;
                tracing::info!(processed = index, total, "Import cancelled");
                break;
            }

            let label = row_label(row, &request.mapping);
            match reconciler.reconcile_row(row, &mut caches).await {
                Ok(report) => {
                    result.record(report.outcome);
                    log_row_report(sink, row.line, &label, kind, &report).await;
                }
                Err(e) => {
                    result.record(RowOutcome::Failed);
                    progress.failed_lines.push(row.line);
                    tracing::warn!(row = row.line, error = %e, "Row failed");
                    sink.log(
                        LogLevel::Error,
                        format!("Row {}: {} failed", row.line, label),
                        Some(e.to_string()),
                    )
                    .await;
                }
            }

            sink.progress(
                format!("Processed {} of {} rows", index + 1, total),
                percent(index + 1, total),
            )
            .await;
        }

        Ok(result)
    }

    async fn execute_delete(
        &self,
        request: &DeleteRequest,
        sink: &mut EventSink,
        progress: &mut Progress,
    ) -> Result<OperationResult, AppError> {
        if !request.dataset.headers.iter().any(|h| h == &request.id_column) {
            return Err(AppError::ConfigError(format!(
                "Identifier column '{}' is not present in the dataset",
                request.id_column
            )));
        }

        progress.state = OperationState::ProcessingRows;
        let total = request.dataset.rows.len();
        let mut result = OperationResult::new(total);

        for (index, row) in request.dataset.rows.iter().enumerate() {
            if sink.is_cancelled() {
                result.stopped = true;
                tracing::info!(processed = index, total, "Delete cancelled");
                break;
            }

            match row.value(Some(request.id_column.as_str())) {
                Some(id) if is_well_formed_identifier(id) => {
                    match delete_record(&self.api, request.kind, id).await {
                        Ok(DeleteOutcome::Deleted) => {
                            result.record(RowOutcome::Deleted);
                            sink.log(
                                LogLevel::Success,
                                format!("Row {}: deleted {} {}", row.line, request.kind, id),
                                None,
                            )
                            .await;
                        }
                        Ok(DeleteOutcome::AlreadyAbsent) => {
                            result.record(RowOutcome::Deleted);
                            sink.log(
                                LogLevel::Info,
                                format!("Row {}: {} {} was already absent", row.line, request.kind, id),
                                None,
                            )
                            .await;
                        }
                        Err(e) => {
                            result.record(RowOutcome::Failed);
                            progress.failed_lines.push(row.line);
                            sink.log(
                                LogLevel::Error,
                                format!("Row {}: could not delete {} {}", row.line, request.kind, id),
                                Some(e.to_string()),
                            )
                            .await;
                        }
                    }
                }
                other => {
                    result.record(RowOutcome::Failed);
                    progress.failed_lines.push(row.line);
                    sink.log(
                        LogLevel::Error,
                        format!("Row {}: missing or invalid identifier", row.line),
                        other.map(str::to_string),
                    )
                    .await;
                }
            }

            sink.progress(
                format!("Processed {} of {} rows", index + 1, total),
                percent(index + 1, total),
            )
            .await;
        }

        Ok(result)
    }
}

/// Emits the single terminal event and builds the report.
async fn finalize(
    operation_id: Uuid,
    started_at: DateTime<Utc>,
    outcome: Result<Result<OperationResult, AppError>, Box<dyn Any + Send>>,
    progress: Progress,
    sink: EventSink,
) -> OperationReport {
    let (state, result, error, event) = match outcome {
        Ok(Ok(result)) => {
            let state = if result.stopped {
                OperationState::Aborted
            } else {
                OperationState::Completed
            };
            tracing::info!(
                state = ?state,
                created = result.created,
                updated = result.updated,
                skipped = result.skipped,
                deleted = result.deleted,
                errors = result.errors,
                "Operation finished"
            );
            let event = OperationEvent::Complete(result.clone());
            (state, Some(result), None, event)
        }
        Ok(Err(e)) => {
            tracing::error!(during = ?progress.state, error = %e, "Operation failed");
            let message = e.to_string();
            let event = OperationEvent::Error {
                message: message.clone(),
            };
            (OperationState::Failed, None, Some(message), event)
        }
        Err(panic) => {
            let message = format!("Operation aborted unexpectedly: {}", panic_message(&*panic));
            tracing::error!(during = ?progress.state, "{}", message);
            let event = OperationEvent::Error {
                message: message.clone(),
            };
            (OperationState::Failed, None, Some(message), event)
        }
    };

    sink.finish(event).await;

    OperationReport {
        operation_id,
        state,
        result,
        error,
        failed_lines: progress.failed_lines,
        started_at,
        finished_at: Utc::now(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Percentage of `done` over `total`, 100 for an empty run.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

fn row_label(row: &Row, mapping: &FieldMapping) -> String {
    row.value(mapping.name.as_deref())
        .or_else(|| row.value(mapping.domain.as_deref()))
        .or_else(|| row.value(mapping.email.as_deref()))
        .map(|s| format!("'{}'", s))
        .unwrap_or_else(|| "row".to_string())
}

async fn log_row_report(sink: &EventSink, line: usize, label: &str, kind: EntityKind, report: &RowReport) {
    let id = report.id.as_deref().unwrap_or("-");
    match report.outcome {
        RowOutcome::Created => {
            sink.log(
                LogLevel::Success,
                format!("Row {}: created {} {}", line, kind, label),
                Some(format!("id {}", id)),
            )
            .await
        }
        RowOutcome::Updated => {
            let how = match report.decision {
                Decision::UpdateBySecondaryKey(_) => format!("matched by {}", kind.secondary_attribute()),
                _ => "matched by identifier".to_string(),
            };
            sink.log(
                LogLevel::Success,
                format!("Row {}: updated {} {}", line, kind, label),
                Some(format!("id {}, {}", id, how)),
            )
            .await
        }
        RowOutcome::SkippedNotFound => {
            sink.log(
                LogLevel::Warn,
                format!("Row {}: {} {} not found, skipped", line, kind, label),
                report.decision.target_id().map(|t| format!("id {}", t)),
            )
            .await
        }
        RowOutcome::Skipped => {
            sink.log(
                LogLevel::Info,
                format!("Row {}: no existing {} for {}, skipped", line, kind, label),
                None,
            )
            .await
        }
        RowOutcome::Deleted | RowOutcome::Failed => {}
    }

    for compensation in &report.compensations {
        let message = match compensation {
            Compensation::StrippedField(field) => {
                format!("Row {}: '{}' was rejected and saved without it", line, field)
            }
            Compensation::BackfillDegraded { written, dropped } => format!(
                "Row {}: custom fields written through v1 ({} written, {} dropped)",
                line,
                written,
                dropped.len()
            ),
        };
        sink.log(LogLevel::Warn, message, None).await;
    }

    for failure in &report.secondary_failures {
        sink.log(
            LogLevel::Warn,
            format!("Row {}: {} was not saved", line, failure.target),
            Some(failure.message.clone()),
        )
        .await;
    }

    for warning in &report.warnings {
        sink.log(LogLevel::Warn, format!("Row {}: {}", line, warning), None)
            .await;
    }
}
