//! Integration tests for the streaming operation protocol.

use std::time::Duration;

use concord_core::operation::{operation_channel, LogLevel, OperationEvent};
use concord_core::{
    DeleteRequest, EntityKind, FieldMapping, OperationService, OperationState,
};

use crate::integration::common::{
    company, company_mapping, dataset, fast_config, import_request, log_messages, run_delete,
    run_import, MockRemoteApi, ACME_ID, GLOBEX_ID,
};

fn percents(events: &[OperationEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            OperationEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect()
}

fn terminal_count(events: &[OperationEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

fn many_companies(n: usize) -> String {
    let mut csv = String::from("id,name,domain\n");
    for i in 0..n {
        csv.push_str(&format!(",Company {},company{}.io\n", i, i));
    }
    csv
}

#[tokio::test]
async fn test_stream_ends_with_single_complete_event() {
    let api = MockRemoteApi::new()
        .with_record(EntityKind::Company, company(ACME_ID, "Acme", "acme.io"));
    let csv = "id,name,domain\n,Acme,acme.io\n,Globex,globex.com\n,Initech,initech.com\n";
    let request = import_request(EntityKind::Company, dataset(csv), company_mapping());

    let (report, events) = run_import(&api, request).await;

    assert_eq!(terminal_count(&events), 1);
    match events.last() {
        Some(OperationEvent::Complete(result)) => {
            assert_eq!(result.total, 3);
            assert_eq!(result.created, 2);
            assert_eq!(result.updated, 1);
        }
        other => panic!("expected complete as last event, got {:?}", other),
    }

    let percents = percents(&events);
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));

    let logs = log_messages(&events);
    for line in 2..=4 {
        assert!(
            logs.iter().any(|m| m.starts_with(&format!("Row {}:", line))),
            "missing log for row {}",
            line
        );
    }
    assert_eq!(report.state, OperationState::Completed);
    assert!(report.finished_at >= report.started_at);
}

#[tokio::test]
async fn test_cache_failure_emits_single_error() {
    let api = MockRemoteApi::new().failing_listing();
    let request = import_request(
        EntityKind::Company,
        dataset("id,name,domain\n,Acme,acme.io\n"),
        company_mapping(),
    );

    let (report, events) = run_import(&api, request).await;

    assert_eq!(report.state, OperationState::Failed);
    assert!(report.result.is_none());
    assert!(report.error.unwrap().contains("503"));
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(events.last(), Some(OperationEvent::Error { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, OperationEvent::Complete(_))));
    assert_eq!(api.write_count(), 0);
}

#[tokio::test]
async fn test_unusable_mapping_fails_before_remote_calls() {
    let api = MockRemoteApi::new();
    let mapping = FieldMapping {
        name: Some("Company Name".into()),
        ..company_mapping()
    };
    let request = import_request(
        EntityKind::Company,
        dataset("id,name,domain\n,Acme,acme.io\n"),
        mapping,
    );

    let (report, events) = run_import(&api, request).await;

    assert_eq!(report.state, OperationState::Failed);
    assert!(api.calls().is_empty());
    match events.last() {
        Some(OperationEvent::Error { message }) => assert!(message.contains("Company Name")),
        other => panic!("expected error event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dropping_receiver_stops_at_row_boundary() {
    // Arrange
    let api = MockRemoteApi::new().with_write_delay(Duration::from_millis(50));
    let request = import_request(
        EntityKind::Company,
        dataset(&many_companies(20)),
        company_mapping(),
    );
    let service = OperationService::new(api.clone(), fast_config());
    let (sink, mut rx) = operation_channel(16);
    let handle = tokio::spawn(async move { service.run_import(request, sink).await });

    // Act: leave as soon as the first row is reported.
    while let Some(event) = rx.recv().await {
        if matches!(
            event,
            OperationEvent::Log {
                level: LogLevel::Success,
                ..
            }
        ) {
            break;
        }
    }
    drop(rx);
    let report = handle.await.unwrap();

    // Assert
    let result = report.result.expect("aborted operations carry a result");
    assert_eq!(report.state, OperationState::Aborted);
    assert!(result.stopped);
    assert!(result.processed() >= 1);
    assert!(result.processed() < 20);
    assert_eq!(api.count("POST"), result.created);
    assert_eq!(result.errors, 0);
}

#[tokio::test]
async fn test_disconnect_stops_writes_without_watcher() {
    // No write delay and a one-slot buffer: the sink must notice the closed
    // channel itself rather than wait for the watcher task.
    let api = MockRemoteApi::new();
    let request = import_request(
        EntityKind::Company,
        dataset(&many_companies(300)),
        company_mapping(),
    );
    let service = OperationService::new(api.clone(), fast_config());
    let (sink, mut rx) = operation_channel(1);
    let handle = tokio::spawn(async move { service.run_import(request, sink).await });

    while let Some(event) = rx.recv().await {
        if matches!(
            event,
            OperationEvent::Log {
                level: LogLevel::Success,
                ..
            }
        ) {
            break;
        }
    }
    drop(rx);
    let report = handle.await.unwrap();

    let result = report.result.unwrap();
    assert_eq!(report.state, OperationState::Aborted);
    assert!(result.stopped);
    // The reported row plus at most the one in flight when the receiver went away.
    assert!(api.count("POST") <= 2, "{} creates", api.count("POST"));
    assert_eq!(api.count("POST"), result.created);
}

#[tokio::test]
async fn test_cancelled_before_first_row() {
    let api = MockRemoteApi::new();
    let request = import_request(
        EntityKind::Company,
        dataset(&many_companies(3)),
        company_mapping(),
    );
    let service = OperationService::new(api.clone(), fast_config());
    let (sink, mut rx) = operation_channel(16);
    sink.cancellation_token().cancel();

    let handle = tokio::spawn(async move { service.run_import(request, sink).await });
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let report = handle.await.unwrap();

    assert_eq!(report.state, OperationState::Aborted);
    let result = report.result.unwrap();
    assert!(result.stopped);
    assert_eq!(result.processed(), 0);
    assert_eq!(api.write_count(), 0);
    assert!(matches!(
        events.last(),
        Some(OperationEvent::Complete(r)) if r.stopped
    ));
}

#[tokio::test]
async fn test_panic_during_rows_is_reported_once() {
    let api = MockRemoteApi::new().panicking_on_create();
    let request = import_request(
        EntityKind::Company,
        dataset(&many_companies(2)),
        company_mapping(),
    );

    let (report, events) = run_import(&api, request).await;

    assert_eq!(report.state, OperationState::Failed);
    assert!(report.result.is_none());
    assert_eq!(terminal_count(&events), 1);
    match events.last() {
        Some(OperationEvent::Error { message }) => {
            assert!(message.contains("simulated remote failure"))
        }
        other => panic!("expected error event, got {:?}", other),
    }
    assert_eq!(api.count("POST"), 1);
}

#[tokio::test]
async fn test_delete_counts_missing_records_as_deleted() {
    let api = MockRemoteApi::new()
        .with_record(EntityKind::Company, company(ACME_ID, "Acme", "acme.io"));
    let csv = format!("id\n{}\n{}\nbogus\n", ACME_ID, GLOBEX_ID);
    let request = DeleteRequest {
        kind: EntityKind::Company,
        dataset: dataset(&csv),
        id_column: "id".into(),
    };

    let (report, events) = run_delete(&api, request).await;

    let result = report.result.unwrap();
    assert_eq!(result.deleted, 2);
    assert_eq!(result.errors, 1);
    assert_eq!(report.failed_lines, vec![4]);
    assert_eq!(api.count("DELETE"), 2);
    assert!(api.records(EntityKind::Company).is_empty());
    assert!(log_messages(&events)
        .iter()
        .any(|m| m.contains("already absent")));
}

#[tokio::test]
async fn test_delete_twice_is_idempotent() {
    let api = MockRemoteApi::new()
        .with_record(EntityKind::Company, company(ACME_ID, "Acme", "acme.io"));
    let request = DeleteRequest {
        kind: EntityKind::Company,
        dataset: dataset(&format!("id\n{}\n", ACME_ID)),
        id_column: "id".into(),
    };

    let (first, _) = run_delete(&api, request.clone()).await;
    let (second, _) = run_delete(&api, request).await;

    assert_eq!(first.result.unwrap().deleted, 1);
    let second = second.result.unwrap();
    assert_eq!(second.deleted, 1);
    assert_eq!(second.errors, 0);
}

#[tokio::test]
async fn test_delete_requires_identifier_column() {
    let api = MockRemoteApi::new();
    let request = DeleteRequest {
        kind: EntityKind::Person,
        dataset: dataset("email\njane@acme.io\n"),
        id_column: "id".into(),
    };

    let (report, events) = run_delete(&api, request).await;

    assert_eq!(report.state, OperationState::Failed);
    assert_eq!(terminal_count(&events), 1);
    assert!(api.calls().is_empty());
}
