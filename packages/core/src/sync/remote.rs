use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::error::RemoteError;
use crate::records::{DomainRecord, EntityType, RecordId};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// The server-side collaborator that receives buffered records.
///
/// Implementations must be idempotent by record id: resubmitting a
/// record the remote already holds is a success, never a duplicate.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn submit(&self, record: &DomainRecord) -> Result<(), RemoteError>;
}

#[derive(Debug, Serialize)]
struct Submission<'a> {
    id: &'a RecordId,
    entity_type: EntityType,
    payload: &'a serde_json::Value,
    created_at: DateTime<Utc>,
    retry_count: u32,
}

/// `POST {base_url}/records` with the record id as idempotency key.
#[derive(Clone)]
pub struct HttpRemoteEndpoint {
    base_url: String,
    http: Client,
    timeout: Duration,
}

impl HttpRemoteEndpoint {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RemoteError::network(err.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RemoteEndpoint for HttpRemoteEndpoint {
    async fn submit(&self, record: &DomainRecord) -> Result<(), RemoteError> {
        let url = format!("{}/records", self.base_url);
        let body = Submission {
            id: &record.id,
            entity_type: record.entity_type,
            payload: &record.payload,
            created_at: record.created_at,
            retry_count: record.retry_count,
        };

        let response = self
            .http
            .post(&url)
            .header(IDEMPOTENCY_HEADER, record.id.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    RemoteError::Timeout(self.timeout)
                } else {
                    RemoteError::network(err.to_string())
                }
            })?;

        let status = response.status();
        // 409: the remote already holds this id, which is what we wanted.
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}
