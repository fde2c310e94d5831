//! Reconciliation engine.
//!
//! [`Reconciler::reconcile_row`] turns one dataset row into exactly one
//! primary write (create or update) plus any number of secondary writes
//! (custom-field values, relationship links). Secondary failures never undo or
//! fail the primary write; they are reported alongside the row outcome.
//!
//! Rows must be reconciled one at a time: a successful create is written back
//! into the cross-reference cache so later rows with the same secondary key
//! update the new record instead of creating a duplicate.

use std::time::Duration;

use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::time::sleep;

use crate::cache::{Caches, CrossRefCache};
use crate::config::ReconcileConfig;
use crate::models::{
    is_well_formed_identifier, normalize_key, CustomFieldDefinition, EntityKind, FieldMapping,
    ImportOptions, Row,
};
use crate::sync::{decide, Decision, RowOutcome};
use crate::traits::RemoteApi;
use crate::validation::{is_valid_email, Validator};
use crate::AppError;

/// Something the engine did to get a write accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// The remote rejected this optional attribute; the write was retried
    /// without it.
    StrippedField(String),
    /// The v2 backfill never saw the record; `written` custom fields were sent
    /// through v1 instead and `dropped` reference fields were not written.
    BackfillDegraded { written: usize, dropped: Vec<String> },
}

/// A secondary write that failed without failing the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryFailure {
    pub target: String,
    pub message: String,
}

/// Result of reconciling one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowReport {
    pub outcome: RowOutcome,
    pub decision: Decision,
    /// Identifier of the created or updated record.
    pub id: Option<String>,
    pub compensations: Vec<Compensation>,
    pub secondary_failures: Vec<SecondaryFailure>,
    pub links: usize,
    pub warnings: Vec<String>,
}

impl RowReport {
    fn new(outcome: RowOutcome, decision: Decision) -> Self {
        Self {
            outcome,
            decision,
            id: None,
            compensations: Vec::new(),
            secondary_failures: Vec::new(),
            links: 0,
            warnings: Vec::new(),
        }
    }
}

/// Outcome of a v2 custom-field write.
enum BackfillResult {
    Written,
    /// Still "not found" after every attempt.
    NotPropagated,
    Failed(AppError),
}

/// Builds the primary write payload for a row.
///
/// Only attributes with a non-empty source value are included. With
/// `clear_empty` set (updates only), mapped optional attributes with a blank
/// cell are sent as `null` instead of being omitted.
pub fn build_payload(
    row: &Row,
    mapping: &FieldMapping,
    kind: EntityKind,
    clear_empty: bool,
) -> Map<String, Value> {
    let mut payload = Map::new();

    if let Some(name) = row.value(mapping.name.as_deref()) {
        payload.insert("name".into(), Value::String(name.to_string()));
    }
    if let Some(key) = row.value(mapping.secondary_key_column(kind)) {
        payload.insert(
            kind.secondary_attribute().into(),
            Value::String(normalize_key(kind, key)),
        );
    }

    let mut optional = |attribute: &str, value: Option<Value>| match value {
        Some(value) => {
            payload.insert(attribute.to_string(), value);
        }
        None if clear_empty => {
            payload.insert(attribute.to_string(), Value::Null);
        }
        None => {}
    };

    if let Some(column) = mapping.owner_email.as_deref() {
        match row.value(Some(column)) {
            // Malformed owners are left out rather than cleared
            Some(owner) if !is_valid_email(owner) => {}
            owner => optional(
                "owner_email",
                owner.map(|v| Value::String(v.to_lowercase())),
            ),
        }
    }
    for (attribute, column) in &mapping.attributes {
        optional(
            attribute.as_str(),
            row.value(Some(column.as_str())).map(|v| Value::String(v.to_string())),
        );
    }
    for (attribute, column) in &mapping.numeric_attributes {
        optional(
            attribute.as_str(),
            row.value(Some(column.as_str()))
                .and_then(|v| v.parse::<u64>().ok())
                .map(Value::from),
        );
    }

    payload
}

/// Resolves a link cell to a target identifier.
///
/// Order: remap cache (migration mode), literal identifier, email in the
/// person cache, domain in the company cache.
pub fn resolve_link_target(value: &str, caches: &Caches, migration_mode: bool) -> Option<String> {
    let value = value.trim();
    if migration_mode {
        if let Some(target) = caches.remap.get(value) {
            return Some(target.to_string());
        }
    }
    if is_well_formed_identifier(value) {
        return Some(value.to_string());
    }
    let kind = if value.contains('@') {
        EntityKind::Person
    } else {
        EntityKind::Company
    };
    caches
        .lookup(kind)
        .and_then(|cache| cache.get(value))
        .map(str::to_string)
}

/// Deletion outcome; both variants count as deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

/// Deletes a record, treating "not found" as already satisfied.
pub async fn delete_record<A: RemoteApi>(
    api: &A,
    kind: EntityKind,
    id: &str,
) -> Result<DeleteOutcome, AppError> {
    match api.delete_record(kind, id).await {
        Ok(()) => Ok(DeleteOutcome::Deleted),
        Err(e) if e.is_not_found() => {
            tracing::debug!(kind = %kind, id, "Record already absent");
            Ok(DeleteOutcome::AlreadyAbsent)
        }
        Err(e) => Err(e),
    }
}

/// Per-operation reconciliation engine.
pub struct Reconciler<'a, A: RemoteApi> {
    api: &'a A,
    kind: EntityKind,
    mapping: &'a FieldMapping,
    options: &'a ImportOptions,
    config: &'a ReconcileConfig,
    validator: Validator,
}

impl<'a, A: RemoteApi> Reconciler<'a, A> {
    pub fn new(
        api: &'a A,
        kind: EntityKind,
        mapping: &'a FieldMapping,
        options: &'a ImportOptions,
        config: &'a ReconcileConfig,
    ) -> Self {
        Self {
            api,
            kind,
            mapping,
            options,
            config,
            validator: Validator::new(kind).with_migration_mode(options.migration_mode),
        }
    }

    /// Computes the decision for a row against the current caches.
    pub fn decision_for(&self, row: &Row, caches: &Caches) -> Decision {
        let raw_identifier = row.value(self.mapping.identifier.as_deref());
        let identifier = if self.options.migration_mode {
            raw_identifier.and_then(|source| caches.remap.get(source))
        } else {
            raw_identifier
        };
        let secondary = row.value(self.mapping.secondary_key_column(self.kind));

        match caches.lookup(self.kind) {
            Some(cache) => decide(identifier, secondary, cache, self.options.update_only),
            None => decide(
                identifier,
                secondary,
                &CrossRefCache::new(self.kind),
                self.options.update_only,
            ),
        }
    }

    /// Reconciles one row.
    ///
    /// Returns `Err` when the row is rejected locally or the primary write
    /// fails. Secondary-write failures are reported in the [`RowReport`].
    pub async fn reconcile_row(
        &self,
        row: &mut Row,
        caches: &mut Caches,
    ) -> Result<RowReport, AppError> {
        let findings = self.validator.check_row(row, self.mapping);
        if !findings.is_valid() {
            return Err(AppError::ValidationError(findings.summary()));
        }

        let decision = self.decision_for(row, caches);
        tracing::debug!(row = row.line, decision = decision.as_str(), "Row decision");

        let mut report = RowReport::new(RowOutcome::Failed, decision.clone());
        report
            .warnings
            .extend(findings.warnings.into_iter().map(|w| w.message));

        if decision == Decision::Skip {
            report.outcome = RowOutcome::Skipped;
            return Ok(report);
        }

        let is_update = decision != Decision::Create;
        let payload = build_payload(
            row,
            self.mapping,
            self.kind,
            is_update && self.options.clear_empty_fields,
        );

        let id = match self.write_primary(&decision, payload).await {
            Ok((id, stripped)) => {
                if let Some(field) = stripped {
                    report.compensations.push(Compensation::StrippedField(field));
                }
                id
            }
            Err(e) if is_update && e.is_not_found() => {
                report.outcome = RowOutcome::SkippedNotFound;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        if is_update {
            report.outcome = RowOutcome::Updated;
        } else {
            report.outcome = RowOutcome::Created;
            self.record_created(row, caches, &id);
        }
        report.id = Some(id.clone());

        self.write_custom_fields(row, caches, &id, &mut report).await;
        self.write_links(row, caches, &id, &mut report).await;

        Ok(report)
    }

    async fn send_primary(
        &self,
        decision: &Decision,
        payload: &Map<String, Value>,
    ) -> Result<String, AppError> {
        match decision {
            Decision::Create => self.api.create_record(self.kind, payload).await,
            Decision::UpdateById(id) | Decision::UpdateBySecondaryKey(id) => {
                if !payload.is_empty() {
                    self.api.update_record(self.kind, id, payload).await?;
                }
                Ok(id.clone())
            }
            Decision::Skip => Err(AppError::Generic("Skipped rows are never written".into())),
        }
    }

    /// Sends the primary write, retrying once without a compensable attribute
    /// when the remote rejects exactly that attribute.
    async fn write_primary(
        &self,
        decision: &Decision,
        payload: Map<String, Value>,
    ) -> Result<(String, Option<String>), AppError> {
        let err = match self.send_primary(decision, &payload).await {
            Ok(id) => return Ok((id, None)),
            Err(err) => err,
        };

        let Some(field) = self
            .config
            .compensable_fields
            .iter()
            .find(|f| payload.contains_key(f.as_str()) && err.rejects_field(f))
        else {
            return Err(err);
        };

        tracing::warn!(field = %field, error = %err, "Remote rejected field, retrying without it");
        let mut stripped = payload;
        stripped.remove(field.as_str());
        let id = self.send_primary(decision, &stripped).await?;
        Ok((id, Some(field.clone())))
    }

    /// Makes a freshly created record visible to later rows.
    fn record_created(&self, row: &mut Row, caches: &mut Caches, id: &str) {
        if let Some(key) = row.value(self.mapping.secondary_key_column(self.kind)) {
            let key = key.to_string();
            caches.lookup_mut(self.kind).insert(&key, id);
        }

        if !self.options.migration_mode {
            return;
        }
        let (Some(source_id), Some(field_name)) = (
            row.value(self.mapping.identifier.as_deref()).map(str::to_string),
            self.options.remap_field_name.as_deref(),
        ) else {
            return;
        };
        caches.remap.insert(&source_id, id);
        // Re-read by the custom-field pass below.
        row.set(field_name, source_id);
    }

    /// Custom-field values to write: (definition, value) pairs.
    fn custom_field_values(
        &self,
        row: &Row,
        caches: &Caches,
        report: &mut RowReport,
    ) -> Vec<(CustomFieldDefinition, Value)> {
        let mut columns: Vec<(&str, &str)> = self
            .mapping
            .custom_fields
            .iter()
            .map(|(name, column)| (name.as_str(), column.as_str()))
            .collect();
        if self.options.migration_mode {
            if let Some(field_name) = self.options.remap_field_name.as_deref() {
                if !self.mapping.custom_fields.contains_key(field_name) {
                    columns.push((field_name, field_name));
                }
            }
        }

        let mut values = Vec::new();
        for (name, column) in columns {
            let Some(value) = row.value(Some(column)) else {
                continue;
            };
            match caches.fields.get(name) {
                Some(definition) => {
                    values.push((definition.clone(), Value::String(value.to_string())))
                }
                None => report.secondary_failures.push(SecondaryFailure {
                    target: format!("custom field '{}'", name),
                    message: "Custom field does not exist on the remote".to_string(),
                }),
            }
        }
        values
    }

    async fn write_custom_fields(
        &self,
        row: &Row,
        caches: &Caches,
        id: &str,
        report: &mut RowReport,
    ) {
        let values = self.custom_field_values(row, caches, report);
        if values.is_empty() {
            return;
        }

        let batch_size = self.config.secondary_batch_size.max(1);
        let mut pending: Vec<&(CustomFieldDefinition, Value)> = Vec::new();

        for (index, batch) in values.chunks(batch_size).enumerate() {
            if index > 0 && !self.config.batch_delay.is_zero() {
                sleep(self.config.batch_delay).await;
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|(definition, value)| self.backfill_field(id, definition, value)),
            )
            .await;

            for (entry, result) in batch.iter().zip(results) {
                match result {
                    BackfillResult::Written => {}
                    BackfillResult::NotPropagated => pending.push(entry),
                    BackfillResult::Failed(e) => {
                        report.secondary_failures.push(SecondaryFailure {
                            target: format!("custom field '{}'", entry.0.name),
                            message: e.to_string(),
                        })
                    }
                }
            }
        }

        if !pending.is_empty() {
            self.degrade_backfill(id, &pending, report).await;
        }
    }

    /// v2 custom-field write with bounded retry on "not found".
    async fn backfill_field(
        &self,
        id: &str,
        definition: &CustomFieldDefinition,
        value: &Value,
    ) -> BackfillResult {
        let attempts = self.config.backfill_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .api
                .write_custom_field(self.kind, id, &definition.id, value)
                .await
            {
                Ok(()) => return BackfillResult::Written,
                Err(e) if e.is_not_found() => {
                    if attempt == attempts {
                        return BackfillResult::NotPropagated;
                    }
                    let delay = self.config.backfill_base_delay * attempt;
                    tracing::debug!(
                        id,
                        field = %definition.name,
                        attempt,
                        "Record not visible on v2 yet, retrying in {:?}",
                        delay
                    );
                    if delay > Duration::ZERO {
                        sleep(delay).await;
                    }
                }
                Err(e) => return BackfillResult::Failed(e),
            }
        }
        BackfillResult::NotPropagated
    }

    /// Writes non-reference custom fields through v1 after the v2 backfill
    /// gave up.
    async fn degrade_backfill(
        &self,
        id: &str,
        pending: &[&(CustomFieldDefinition, Value)],
        report: &mut RowReport,
    ) {
        let (reference, plain): (Vec<_>, Vec<_>) =
            pending.iter().copied().partition(|(definition, _)| definition.is_reference());
        let dropped: Vec<String> = reference.iter().map(|(d, _)| d.name.clone()).collect();

        let mut written = 0;
        if !plain.is_empty() {
            let fields: Map<String, Value> = plain
                .iter()
                .map(|(definition, value)| (definition.id.clone(), value.clone()))
                .collect();
            let mut payload = Map::new();
            payload.insert("custom_fields".into(), Value::Object(fields));

            match self.api.update_record(self.kind, id, &payload).await {
                Ok(()) => written = plain.len(),
                Err(e) => report.secondary_failures.push(SecondaryFailure {
                    target: "custom fields".to_string(),
                    message: e.to_string(),
                }),
            }
        }

        for name in &dropped {
            report.warnings.push(format!(
                "Custom field '{}' was not written: record not yet available",
                name
            ));
        }
        tracing::warn!(id, written, dropped = dropped.len(), "Backfill degraded to v1");
        report
            .compensations
            .push(Compensation::BackfillDegraded { written, dropped });
    }

    async fn write_links(&self, row: &Row, caches: &Caches, id: &str, report: &mut RowReport) {
        for (relation, link) in &self.mapping.links {
            let Some(value) = row.value(Some(link.column.as_str())) else {
                continue;
            };
            let Some(target_id) = resolve_link_target(value, caches, self.options.migration_mode)
            else {
                report.warnings.push(format!(
                    "Could not resolve {} '{}' for link '{}'",
                    link.target, value, relation
                ));
                continue;
            };

            match self
                .api
                .link_records(self.kind, id, relation, &target_id)
                .await
            {
                Ok(()) => report.links += 1,
                Err(e) if is_already_linked(&e) => {
                    tracing::debug!(id, relation = %relation, "Already linked");
                    report.links += 1;
                }
                Err(e) => report.secondary_failures.push(SecondaryFailure {
                    target: format!("link '{}'", relation),
                    message: e.to_string(),
                }),
            }
        }
    }
}

/// A 409 whose message says the link exists already.
pub fn is_already_linked(err: &AppError) -> bool {
    match err {
        AppError::Api {
            status: 409,
            message,
        } => message.to_lowercase().contains("already"),
        _ => false,
    }
}
