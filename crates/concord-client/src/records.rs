//! `RemoteApi` over the v1/v2 REST endpoints.

use concord_core::traits::RemoteApi;
use concord_core::{AppError, CustomFieldDefinition, EntityKind};
use futures::TryStreamExt;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::pagination::PageStrategy;
use crate::remote::{ApiVersion, RemoteClient};

/// `{ "data": T }` wrapper used by single-resource responses.
#[derive(Deserialize, Debug)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize, Debug)]
struct CreatedRecord {
    id: String,
}

fn unwrap_data<T: for<'de> Deserialize<'de>>(body: Option<Value>) -> Result<T, AppError> {
    let body = body.ok_or(AppError::EmptyResponse)?;
    let envelope: DataEnvelope<T> = serde_json::from_value(body)?;
    Ok(envelope.data)
}

impl RemoteApi for RemoteClient {
    async fn list_records(&self, kind: EntityKind, cap: usize) -> Result<Vec<Value>, AppError> {
        let strategy = PageStrategy::new(self.dialect_for(kind), self.pagination_config().page_size);
        let mut pages = self.paginate(kind.collection(), strategy, cap);

        let mut records = Vec::new();
        while let Some(batch) = pages.try_next().await? {
            records.extend(batch);
        }
        tracing::debug!(kind = %kind, count = records.len(), "Listed records");
        Ok(records)
    }

    async fn custom_field_definitions(
        &self,
        kind: EntityKind,
    ) -> Result<Vec<CustomFieldDefinition>, AppError> {
        let query = [("entity".to_string(), kind.as_str().to_string())];
        let body = self
            .call(Method::GET, ApiVersion::V2, &["custom-fields"], &query, None)
            .await?;
        unwrap_data(body)
    }

    async fn create_record(
        &self,
        kind: EntityKind,
        payload: &Map<String, Value>,
    ) -> Result<String, AppError> {
        let body = Value::Object(payload.clone());
        let response = self
            .call(
                Method::POST,
                ApiVersion::V1,
                &[kind.collection()],
                &[],
                Some(&body),
            )
            .await?;
        let created: CreatedRecord = unwrap_data(response)?;
        Ok(created.id)
    }

    async fn update_record(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Map<String, Value>,
    ) -> Result<(), AppError> {
        let body = Value::Object(payload.clone());
        self.call(
            Method::PATCH,
            ApiVersion::V1,
            &[kind.collection(), id],
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_record(&self, kind: EntityKind, id: &str) -> Result<(), AppError> {
        self.call(
            Method::DELETE,
            ApiVersion::V1,
            &[kind.collection(), id],
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    async fn link_records(
        &self,
        kind: EntityKind,
        id: &str,
        relation: &str,
        target_id: &str,
    ) -> Result<(), AppError> {
        let body = json!({ "id": target_id });
        self.call(
            Method::POST,
            ApiVersion::V1,
            &[kind.collection(), id, "links", relation],
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn write_custom_field(
        &self,
        kind: EntityKind,
        id: &str,
        field_id: &str,
        value: &Value,
    ) -> Result<(), AppError> {
        let body = json!({ "value": value });
        self.call(
            Method::PUT,
            ApiVersion::V2,
            &[kind.collection(), id, "custom-fields", field_id],
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }
}
