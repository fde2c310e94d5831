//! Integration tests for the reconciliation engine.

use std::time::{Duration, Instant};

use concord_core::cache::{build_custom_field_index, Caches};
use concord_core::reconcile::{Compensation, Reconciler};
use concord_core::{
    EntityKind, FieldMapping, ImportOptions, LinkMapping, OperationState, ReconcileConfig,
    RowOutcome,
};
use serde_json::Value;

use crate::integration::common::{
    company, company_mapping, dataset, fast_config, import_request, log_messages, person,
    run_import, run_import_with, MockRemoteApi, ACME_ID, GLOBEX_ID, JANE_ID,
};

fn tiered_mapping() -> FieldMapping {
    FieldMapping {
        custom_fields: [("Account Tier".to_string(), "tier".to_string())].into(),
        ..company_mapping()
    }
}

#[tokio::test]
async fn test_mixed_dataset_creates_and_updates() {
    // Arrange
    let api = MockRemoteApi::new()
        .with_record(EntityKind::Company, company(ACME_ID, "Acme", "acme.io"))
        .with_record(EntityKind::Company, company(GLOBEX_ID, "Globex", "globex.com"));
    let csv = format!(
        "id,name,domain\n{},Globex Corp,globex.com\n,Acme,acme.io\n,Initech,initech.com\n",
        GLOBEX_ID
    );
    let request = import_request(EntityKind::Company, dataset(&csv), company_mapping());

    // Act
    let (report, _) = run_import(&api, request).await;

    // Assert
    let result = report.result.expect("completed operations carry a result");
    assert_eq!(report.state, OperationState::Completed);
    assert_eq!(result.total, 3);
    assert_eq!(result.created, 1);
    assert_eq!(result.updated, 2);
    assert_eq!(result.errors, 0);
    assert!(!result.stopped);

    assert_eq!(api.count("POST companies"), 1);
    assert_eq!(api.count(&format!("PATCH companies/{}", GLOBEX_ID)), 1);
    assert_eq!(api.count(&format!("PATCH companies/{}", ACME_ID)), 1);
    assert_eq!(
        api.record(EntityKind::Company, GLOBEX_ID).unwrap()["name"],
        "Globex Corp"
    );
}

#[tokio::test]
async fn test_repeated_key_updates_record_created_earlier() {
    let api = MockRemoteApi::new();
    let csv = "id,name,domain\n,Initech,initech.com\n,Initech LLC,https://www.Initech.com/\n";
    let request = import_request(EntityKind::Company, dataset(csv), company_mapping());

    let (report, _) = run_import(&api, request).await;

    let result = report.result.unwrap();
    assert_eq!(result.created, 1);
    assert_eq!(result.updated, 1);
    assert_eq!(api.count("POST"), 1);
    assert_eq!(api.count("PATCH"), 1);

    let records = api.records(EntityKind::Company);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["name"], "Initech LLC");
}

#[tokio::test]
async fn test_rejected_owner_is_stripped_and_retried() {
    let api = MockRemoteApi::new().rejecting_field("owner_email");
    let mapping = FieldMapping {
        owner_email: Some("owner".into()),
        ..company_mapping()
    };
    let options = ImportOptions::default();
    let config = fast_config();
    let reconciler = Reconciler::new(&api, EntityKind::Company, &mapping, &options, &config);
    let mut row = dataset("id,name,domain,owner\n,Acme,acme.io,ghost@acme.io\n")
        .rows
        .remove(0);
    let mut caches = Caches::default();

    let report = reconciler.reconcile_row(&mut row, &mut caches).await.unwrap();

    assert_eq!(report.outcome, RowOutcome::Created);
    assert_eq!(
        report.compensations,
        vec![Compensation::StrippedField("owner_email".to_string())]
    );
    assert_eq!(api.count("POST companies"), 2);

    let id = report.id.unwrap();
    let record = api.record(EntityKind::Company, &id).unwrap();
    assert!(record.get("owner_email").is_none());
    assert_eq!(record["domain"], "acme.io");
}

#[tokio::test]
async fn test_rejection_of_other_attribute_fails_row() {
    let api = MockRemoteApi::new().rejecting_field("industry");
    let mapping = FieldMapping {
        attributes: [("industry".to_string(), "industry".to_string())].into(),
        ..company_mapping()
    };
    let csv = "id,name,domain,industry\n,Acme,acme.io,Explosives\n,Globex,globex.com,\n";
    let request = import_request(EntityKind::Company, dataset(csv), mapping);

    let (report, events) = run_import(&api, request).await;

    let result = report.result.unwrap();
    assert_eq!(result.errors, 1);
    assert_eq!(result.created, 1);
    assert_eq!(report.failed_lines, vec![2]);
    assert_eq!(api.count("POST"), 2);
    assert!(log_messages(&events)
        .iter()
        .any(|m| m.starts_with("Row 2:") && m.contains("failed")));
}

#[tokio::test]
async fn test_rejection_after_compensating_retry_fails_row() {
    // Both fields are compensable, but only one is stripped per row.
    let api = MockRemoteApi::new()
        .rejecting_field("owner_email")
        .rejecting_field("industry");
    let mapping = FieldMapping {
        owner_email: Some("owner".into()),
        attributes: [("industry".to_string(), "industry".to_string())].into(),
        ..company_mapping()
    };
    let config = ReconcileConfig {
        compensable_fields: vec!["owner_email".to_string(), "industry".to_string()],
        ..fast_config()
    };
    let csv = "id,name,domain,owner,industry\n,Acme,acme.io,ghost@acme.io,Explosives\n";
    let request = import_request(EntityKind::Company, dataset(csv), mapping);

    let (report, _) = run_import_with(&api, request, config).await;

    let result = report.result.unwrap();
    assert_eq!(result.errors, 1);
    assert_eq!(result.created, 0);
    assert_eq!(report.failed_lines, vec![2]);
    assert_eq!(api.count("POST"), 2);
    assert!(api.records(EntityKind::Company).is_empty());
}

#[tokio::test]
async fn test_update_of_missing_record_is_skipped() {
    let api = MockRemoteApi::new();
    let csv = format!("id,name,domain\n{},Ghost,\n", ACME_ID);
    let request = import_request(EntityKind::Company, dataset(&csv), company_mapping());

    let (report, _) = run_import(&api, request).await;

    let result = report.result.unwrap();
    assert_eq!(result.skipped, 1);
    assert_eq!(result.errors, 0);
    assert_eq!(api.count("POST"), 0);
}

#[tokio::test]
async fn test_invalid_row_makes_no_remote_call() {
    let api = MockRemoteApi::new();
    let csv = "id,name,domain\n,<b>Acme</b>,acme.io\nnot-an-id,Globex,\n";
    let request = import_request(EntityKind::Company, dataset(csv), company_mapping());

    let (report, _) = run_import(&api, request).await;

    assert_eq!(report.result.unwrap().errors, 2);
    assert_eq!(api.write_count(), 0);
}

#[tokio::test]
async fn test_backfill_retries_until_record_is_visible() {
    let api = MockRemoteApi::new()
        .with_definition("cf-tier", "Account Tier", "text", EntityKind::Company)
        .with_v2_lag(2);
    let mapping = tiered_mapping();
    let options = ImportOptions::default();
    let config = fast_config();
    let mut caches = Caches {
        fields: build_custom_field_index(&api, EntityKind::Company).await.unwrap(),
        ..Caches::default()
    };
    let reconciler = Reconciler::new(&api, EntityKind::Company, &mapping, &options, &config);
    let mut row = dataset("id,name,domain,tier\n,Acme,acme.io,Gold\n").rows.remove(0);

    let report = reconciler.reconcile_row(&mut row, &mut caches).await.unwrap();

    assert!(report.compensations.is_empty());
    assert!(report.secondary_failures.is_empty());
    assert_eq!(api.count("PUT custom-field"), 3);

    let record = api.record(EntityKind::Company, &report.id.unwrap()).unwrap();
    assert_eq!(record["custom_fields"]["cf-tier"], "Gold");
}

#[tokio::test]
async fn test_backfill_degrades_to_v1_and_drops_references() {
    let api = MockRemoteApi::new()
        .with_definition("cf-tier", "Account Tier", "text", EntityKind::Company)
        .with_definition("cf-parent", "Parent Account", "reference", EntityKind::Company)
        .with_v2_never_visible();
    let mapping = FieldMapping {
        custom_fields: [
            ("Account Tier".to_string(), "tier".to_string()),
            ("Parent Account".to_string(), "parent".to_string()),
        ]
        .into(),
        ..company_mapping()
    };
    let options = ImportOptions::default();
    let config = fast_config();
    let mut caches = Caches {
        fields: build_custom_field_index(&api, EntityKind::Company).await.unwrap(),
        ..Caches::default()
    };
    let reconciler = Reconciler::new(&api, EntityKind::Company, &mapping, &options, &config);
    let mut row = dataset("id,name,domain,tier,parent\n,Acme,acme.io,Gold,globex.com\n")
        .rows
        .remove(0);

    let report = reconciler.reconcile_row(&mut row, &mut caches).await.unwrap();

    assert_eq!(report.outcome, RowOutcome::Created);
    assert_eq!(
        report.compensations,
        vec![Compensation::BackfillDegraded {
            written: 1,
            dropped: vec!["Parent Account".to_string()],
        }]
    );
    assert!(report.warnings.iter().any(|w| w.contains("Parent Account")));
    assert_eq!(
        api.count("PUT custom-field"),
        2 * config.backfill_attempts as usize
    );

    let id = report.id.unwrap();
    let record = api.record(EntityKind::Company, &id).unwrap();
    assert_eq!(record["custom_fields"]["cf-tier"], "Gold");
    assert!(record["custom_fields"].get("cf-parent").is_none());
}

/// Five text custom fields `Field 1`..`Field 5` mapped to columns `f1`..`f5`.
fn five_fields(api: MockRemoteApi) -> (MockRemoteApi, FieldMapping, String) {
    let api = (1..=5).fold(api, |api, i| {
        api.with_definition(
            &format!("cf-{}", i),
            &format!("Field {}", i),
            "text",
            EntityKind::Company,
        )
    });
    let mapping = FieldMapping {
        custom_fields: (1..=5)
            .map(|i| (format!("Field {}", i), format!("f{}", i)))
            .collect(),
        ..company_mapping()
    };
    let csv = "id,name,domain,f1,f2,f3,f4,f5\n,Acme,acme.io,v1,v2,v3,v4,v5\n".to_string();
    (api, mapping, csv)
}

async fn reconcile_first_row(
    api: &MockRemoteApi,
    mapping: &FieldMapping,
    csv: &str,
    config: &ReconcileConfig,
) -> concord_core::RowReport {
    let options = ImportOptions::default();
    let mut caches = Caches {
        fields: build_custom_field_index(api, EntityKind::Company).await.unwrap(),
        ..Caches::default()
    };
    let reconciler = Reconciler::new(api, EntityKind::Company, mapping, &options, config);
    let mut row = dataset(csv).rows.remove(0);
    reconciler.reconcile_row(&mut row, &mut caches).await.unwrap()
}

#[tokio::test]
async fn test_custom_fields_are_written_in_bounded_batches() {
    let (api, mapping, csv) =
        five_fields(MockRemoteApi::new().with_field_write_delay(Duration::from_millis(20)));
    let config = ReconcileConfig {
        secondary_batch_size: 2,
        batch_delay: Duration::from_millis(30),
        ..fast_config()
    };

    let started = Instant::now();
    let report = reconcile_first_row(&api, &mapping, &csv, &config).await;

    assert_eq!(report.outcome, RowOutcome::Created);
    assert!(report.secondary_failures.is_empty());
    assert_eq!(api.count("PUT custom-field"), 5);
    assert_eq!(api.max_fields_in_flight(), 2);
    // Three batches, with a pause before the second and the third.
    assert!(started.elapsed() >= Duration::from_millis(60));

    let id = report.id.unwrap();
    let record = api.record(EntityKind::Company, &id).unwrap();
    for i in 1..=5 {
        assert_eq!(record["custom_fields"][format!("cf-{}", i)], format!("v{}", i));
    }
}

#[tokio::test]
async fn test_backfill_degrade_collects_every_batch() {
    let (api, mapping, csv) = five_fields(MockRemoteApi::new().with_v2_never_visible());
    let config = ReconcileConfig {
        secondary_batch_size: 2,
        ..fast_config()
    };

    let report = reconcile_first_row(&api, &mapping, &csv, &config).await;

    assert_eq!(
        report.compensations,
        vec![Compensation::BackfillDegraded {
            written: 5,
            dropped: Vec::new(),
        }]
    );
    assert_eq!(
        api.count("PUT custom-field"),
        5 * config.backfill_attempts as usize
    );
    // One v1 write carries the fields from all three batches.
    assert_eq!(api.count("PATCH"), 1);

    let id = report.id.unwrap();
    let record = api.record(EntityKind::Company, &id).unwrap();
    assert_eq!(record["custom_fields"].as_object().unwrap().len(), 5);
}

#[tokio::test]
async fn test_unknown_custom_field_does_not_fail_row() {
    let api = MockRemoteApi::new();
    let request = import_request(
        EntityKind::Company,
        dataset("id,name,domain,tier\n,Acme,acme.io,Gold\n"),
        tiered_mapping(),
    );

    let (report, events) = run_import(&api, request).await;

    let result = report.result.unwrap();
    assert_eq!(result.created, 1);
    assert_eq!(result.errors, 0);
    assert!(log_messages(&events)
        .iter()
        .any(|m| m.contains("custom field 'Account Tier' was not saved")));
}

#[tokio::test]
async fn test_already_linked_counts_as_success() {
    let api = MockRemoteApi::new()
        .with_record(EntityKind::Company, company(ACME_ID, "Acme", "acme.io"))
        .with_record(EntityKind::Person, person(JANE_ID, "Jane Roe", "jane@acme.io"))
        .with_link(JANE_ID, "employer", ACME_ID);
    let mapping = FieldMapping {
        name: Some("name".into()),
        email: Some("email".into()),
        links: [(
            "employer".to_string(),
            LinkMapping {
                column: "company".into(),
                target: EntityKind::Company,
            },
        )]
        .into(),
        ..Default::default()
    };
    let csv = "name,email,company\nJane Roe,jane@acme.io,acme.io\n";
    let request = import_request(EntityKind::Person, dataset(csv), mapping);

    let (report, events) = run_import(&api, request).await;

    let result = report.result.unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(result.errors, 0);
    assert_eq!(api.count("LINK"), 1);
    assert!(api.has_link(JANE_ID, "employer", ACME_ID));
    assert!(!log_messages(&events).iter().any(|m| m.contains("was not saved")));
}

#[tokio::test]
async fn test_unresolvable_link_is_a_warning() {
    let api = MockRemoteApi::new();
    let mapping = FieldMapping {
        links: [(
            "parent".to_string(),
            LinkMapping {
                column: "parent".into(),
                target: EntityKind::Company,
            },
        )]
        .into(),
        ..company_mapping()
    };
    let csv = "id,name,domain,parent\n,Acme,acme.io,unknown.io\n";
    let request = import_request(EntityKind::Company, dataset(csv), mapping);

    let (report, events) = run_import(&api, request).await;

    assert_eq!(report.result.unwrap().created, 1);
    assert_eq!(api.count("LINK"), 0);
    assert!(log_messages(&events)
        .iter()
        .any(|m| m.contains("Could not resolve company 'unknown.io'")));
}

#[tokio::test]
async fn test_update_only_skips_unmatched_rows() {
    let api = MockRemoteApi::new()
        .with_record(EntityKind::Company, company(ACME_ID, "Acme", "acme.io"));
    let mut request = import_request(
        EntityKind::Company,
        dataset("id,name,domain\n,Acme Inc,acme.io\n,Newco,newco.io\n"),
        company_mapping(),
    );
    request.options.update_only = true;

    let (report, _) = run_import(&api, request).await;

    let result = report.result.unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(result.skipped, 1);
    assert_eq!(api.count("POST"), 0);
}

#[tokio::test]
async fn test_clear_empty_fields_on_update() {
    let api = MockRemoteApi::new().with_record(
        EntityKind::Company,
        serde_json::json!({"id": ACME_ID, "name": "Acme", "domain": "acme.io", "industry": "Retail"}),
    );
    let mapping = FieldMapping {
        attributes: [("industry".to_string(), "industry".to_string())].into(),
        ..company_mapping()
    };
    let mut request = import_request(
        EntityKind::Company,
        dataset("id,name,domain,industry\n,Acme,acme.io,\n,Newco,newco.io,\n"),
        mapping,
    );
    request.options.clear_empty_fields = true;

    let (report, _) = run_import(&api, request).await;

    assert_eq!(report.result.unwrap().created, 1);
    assert_eq!(
        api.record(EntityKind::Company, ACME_ID).unwrap()["industry"],
        Value::Null
    );
    let created = api
        .records(EntityKind::Company)
        .into_iter()
        .find(|r| r["domain"] == "newco.io")
        .unwrap();
    assert!(created.get("industry").is_none());
}

#[tokio::test]
async fn test_migration_remaps_and_backfills_source_ids() {
    let api = MockRemoteApi::new()
        .with_definition("cf-src", "Source ID", "text", EntityKind::Company)
        .with_record(
            EntityKind::Company,
            serde_json::json!({
                "id": ACME_ID, "name": "Acme", "domain": "acme.io",
                "custom_fields": {"cf-src": "legacy-1"}
            }),
        );
    let mut request = import_request(
        EntityKind::Company,
        dataset("id,name,domain\nlegacy-1,Acme Renamed,\nlegacy-2,Newco,newco.io\n"),
        company_mapping(),
    );
    request.options = ImportOptions {
        migration_mode: true,
        remap_field_name: Some("Source ID".into()),
        ..Default::default()
    };

    let (report, _) = run_import(&api, request).await;

    let result = report.result.unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(result.created, 1);
    assert_eq!(
        api.record(EntityKind::Company, ACME_ID).unwrap()["name"],
        "Acme Renamed"
    );

    let created = api
        .records(EntityKind::Company)
        .into_iter()
        .find(|r| r["domain"] == "newco.io")
        .unwrap();
    assert_eq!(created["custom_fields"]["cf-src"], "legacy-2");
}
