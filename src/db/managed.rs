//! Managed backend client
//!
//! `EntityBackend` over the hosted entity API. Records live under
//! `{base_url}/apps/{app_id}/entities/{Entity}`; the service stamps ids and
//! timestamps itself, so this client only forwards payloads.

use crate::config::settings::ManagedSettings;
use crate::db::provider::{EntityBackend, strip_system_fields};
use crate::db::query::ListQuery;
use crate::db::types::Record;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Characters left unescaped in a path segment
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Managed entity API client
#[derive(Clone)]
pub struct ManagedBackend {
    client: Client,
    /// `{base_url}/apps/{app_id}/entities`
    entities_url: String,
}

impl ManagedBackend {
    pub fn new(settings: &ManagedSettings) -> DbResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = settings.api_key.as_deref().filter(|k| !k.is_empty()) {
            let mut value = HeaderValue::from_str(key)
                .map_err(|e| DbError::InvalidInput(format!("invalid api key: {}", e)))?;
            value.set_sensitive(true);
            headers.insert("api_key", value);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            entities_url: entities_url(&settings.base_url, &settings.app_id),
        })
    }

    fn collection_url(&self, entity: &str) -> String {
        format!("{}/{}", self.entities_url, encode_segment(entity))
    }

    fn record_url(&self, entity: &str, id: &str) -> String {
        format!("{}/{}", self.collection_url(entity), encode_segment(id))
    }
}

#[async_trait]
impl EntityBackend for ManagedBackend {
    fn name(&self) -> &'static str {
        "managed"
    }

    async fn list(&self, entity: &str, query: &ListQuery) -> DbResult<Vec<Record>> {
        let params = list_params(query);
        tracing::debug!(entity, ?params, "managed list");
        let response = self
            .client
            .get(self.collection_url(entity))
            .query(&params)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn get(&self, entity: &str, id: &str) -> DbResult<Option<Record>> {
        let response = self.client.get(self.record_url(entity, id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = check(response).await?.json().await?;
        Ok(match body {
            Value::Object(record) => Some(record),
            _ => None,
        })
    }

    async fn create(&self, entity: &str, mut data: Record, created_by: &str) -> DbResult<Record> {
        if !data.get("created_by").is_some_and(|v| !v.is_null()) {
            data.insert("created_by".into(), Value::String(created_by.to_string()));
        }
        let response = self
            .client
            .post(self.collection_url(entity))
            .json(&data)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn update(&self, entity: &str, id: &str, data: Record) -> DbResult<Option<Record>> {
        let response = self
            .client
            .put(self.record_url(entity, id))
            .json(&strip_system_fields(data))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json().await?))
    }

    async fn delete(&self, entity: &str, id: &str) -> DbResult<()> {
        let response = self.client.delete(self.record_url(entity, id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    async fn bulk_create(
        &self,
        entity: &str,
        mut records: Vec<Record>,
        created_by: &str,
    ) -> DbResult<Vec<Record>> {
        for record in &mut records {
            record
                .entry("created_by")
                .or_insert_with(|| Value::String(created_by.to_string()));
        }
        let response = self
            .client
            .post(format!("{}/bulk", self.collection_url(entity)))
            .json(&records)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

fn entities_url(base_url: &str, app_id: &str) -> String {
    format!(
        "{}/apps/{}/entities",
        base_url.trim_end_matches('/'),
        encode_segment(app_id)
    )
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

/// Query-string form of a list request
fn list_params(query: &ListQuery) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if !query.filter.is_empty() {
        params.push(("q", query.filter.to_json().to_string()));
    }
    params.push(("sort", query.sort.to_param()));
    if let Some(limit) = query.page.limit {
        params.push(("limit", limit.to_string()));
    }
    if let Some(skip) = query.page.skip {
        params.push(("skip", skip.to_string()));
    }
    params
}

/// Pass through a success response, turn anything else into an upstream error
async fn check(response: Response) -> DbResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = upstream_message(status, &body);
    tracing::warn!(status = status.as_u16(), %message, "managed backend error");
    Err(DbError::Upstream {
        status: status.as_u16(),
        message,
    })
}

fn upstream_message(status: StatusCode, body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        for key in ["error", "message", "detail"] {
            if let Some(Value::String(msg)) = map.get(key) {
                return msg.clone();
            }
        }
    }
    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    } else {
        body.to_string()
    }
}
