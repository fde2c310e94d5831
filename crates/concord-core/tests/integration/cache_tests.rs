//! Integration tests for the cache builders.

use concord_core::cache::{build_cross_ref_cache, build_remap_cache};
use concord_core::EntityKind;
use serde_json::json;

use crate::integration::common::{company, person, MockRemoteApi, ACME_ID, GLOBEX_ID, JANE_ID};

#[tokio::test]
async fn test_cross_ref_cache_skips_incomplete_records() {
    let api = MockRemoteApi::new()
        .with_record(EntityKind::Company, company(ACME_ID, "Acme", "www.Acme.io"))
        .with_record(EntityKind::Company, json!({"id": GLOBEX_ID, "name": "Globex"}))
        .with_record(EntityKind::Company, json!({"name": "Orphan", "domain": "orphan.io"}));

    let cache = build_cross_ref_cache(&api, EntityKind::Company, 10_000)
        .await
        .unwrap();

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get("acme.io"), Some(ACME_ID));
    assert_eq!(cache.get("orphan.io"), None);
}

#[tokio::test]
async fn test_cross_ref_cache_first_record_wins() {
    let api = MockRemoteApi::new()
        .with_record(EntityKind::Company, company(ACME_ID, "Acme", "acme.io"))
        .with_record(EntityKind::Company, company(GLOBEX_ID, "Acme (dup)", "ACME.io"));

    let cache = build_cross_ref_cache(&api, EntityKind::Company, 10_000)
        .await
        .unwrap();

    assert_eq!(cache.get("acme.io"), Some(ACME_ID));
}

#[tokio::test]
async fn test_cross_ref_cache_respects_cap() {
    let mut api = MockRemoteApi::new();
    for i in 0..5 {
        api = api.with_record(
            EntityKind::Person,
            person(&format!("p-{}", i), "Someone", &format!("user{}@acme.io", i)),
        );
    }

    let cache = build_cross_ref_cache(&api, EntityKind::Person, 3)
        .await
        .unwrap();

    assert_eq!(cache.len(), 3);
    assert_eq!(cache.get("user4@acme.io"), None);
}

#[tokio::test]
async fn test_remap_cache_is_empty_when_field_missing() {
    let api = MockRemoteApi::new()
        .with_record(EntityKind::Company, company(ACME_ID, "Acme", "acme.io"));

    let cache = build_remap_cache(&api, "Source ID", &[EntityKind::Company], 10_000)
        .await
        .unwrap();

    assert!(cache.is_empty());
    assert_eq!(cache.field_name(), Some("Source ID"));
    assert_eq!(cache.field_id(EntityKind::Company), None);
    assert_eq!(api.count("GET companies"), 0);
}

#[tokio::test]
async fn test_remap_cache_ignores_field_with_wrong_type() {
    let api = MockRemoteApi::new()
        .with_definition("cf-src", "Source ID", "number", EntityKind::Company)
        .with_record(
            EntityKind::Company,
            json!({"id": ACME_ID, "domain": "acme.io", "custom_fields": {"cf-src": "42"}}),
        );

    let cache = build_remap_cache(&api, "Source ID", &[EntityKind::Company], 10_000)
        .await
        .unwrap();

    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_remap_cache_indexes_every_kind() {
    let api = MockRemoteApi::new()
        .with_definition("cf-src", "Source ID", "text", EntityKind::Company)
        .with_definition("pf-src", "source id", "text", EntityKind::Person)
        .with_record(
            EntityKind::Company,
            json!({"id": ACME_ID, "domain": "acme.io", "custom_fields": {"cf-src": "legacy-c1"}}),
        )
        .with_record(
            EntityKind::Company,
            json!({"id": GLOBEX_ID, "domain": "globex.com", "custom_fields": {"cf-src": "  "}}),
        )
        .with_record(
            EntityKind::Person,
            json!({"id": JANE_ID, "email": "jane@acme.io", "custom_fields": {"pf-src": "legacy-p1"}}),
        );

    let cache = build_remap_cache(
        &api,
        "Source ID",
        &[EntityKind::Company, EntityKind::Person],
        10_000,
    )
    .await
    .unwrap();

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get("legacy-c1"), Some(ACME_ID));
    assert_eq!(cache.get("legacy-p1"), Some(JANE_ID));
    assert_eq!(cache.field_id(EntityKind::Person), Some("pf-src"));
}

#[tokio::test]
async fn test_remap_cache_propagates_fetch_errors() {
    let api = MockRemoteApi::new()
        .with_definition("cf-src", "Source ID", "text", EntityKind::Company)
        .failing_listing();

    let err = build_remap_cache(&api, "Source ID", &[EntityKind::Company], 10_000)
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(503));
}
