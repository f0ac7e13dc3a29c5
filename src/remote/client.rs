// ABOUTME: HTTP client for the remote store's bulk-sync, metadata, query, and health endpoints
// ABOUTME: Maps HTTP failures and busy sentinels into the pipeline's error taxonomy

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

use super::models::{BulkSyncRequest, BulkSyncResponse, MetadataResponse, QueryRequest, QueryResponse};
use crate::error::{SyncError, SyncResult};

/// Default timeout for remote store calls.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

/// The endpoints of the remote store the pipeline depends on.
pub trait RemoteStore {
    fn health(&self) -> impl Future<Output = SyncResult<()>> + Send;

    /// Current high-water marks and per-table counts. A busy store yields `SyncError::Busy`.
    fn metadata(&self) -> impl Future<Output = SyncResult<MetadataResponse>> + Send;

    /// Upsert one batch. The store keys rows by GUID plus tenant identifiers.
    fn bulk_sync(
        &self,
        request: &BulkSyncRequest<'_>,
    ) -> impl Future<Output = SyncResult<BulkSyncResponse>> + Send;
}

pub struct RemoteClient {
    client: Client,
    api_base_url: String,
    api_key: Option<String>,
    tenant: String,
    sub_tenant: String,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(
        api_base_url: &str,
        api_key: Option<String>,
        tenant: &str,
        sub_tenant: &str,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Remote(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            api_key,
            tenant: tenant.to_string(),
            sub_tenant: sub_tenant.to_string(),
            timeout,
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn sub_tenant(&self) -> &str {
        &self.sub_tenant
    }

    fn scoped_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.api_base_url, endpoint, self.tenant, self.sub_tenant
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.api_key {
            Some(ref key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn execute(&self, what: &str, request: RequestBuilder) -> SyncResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| SyncError::from_http(what, self.timeout.as_secs(), e).into_remote())?;

        let status = response.status();
        if status == StatusCode::LOCKED || status == StatusCode::SERVICE_UNAVAILABLE {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Busy(format!("{} returned {}: {}", what, status, body)));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::Remote(format!(
                "{} was rejected: the API key is invalid or expired",
                what
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Remote(format!(
                "{} failed with status {}: {}",
                what, status, body
            )));
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, what: &str, response: Response) -> SyncResult<T> {
        response
            .json()
            .await
            .map_err(|e| SyncError::Remote(format!("failed to parse {} response: {}", what, e)))
    }

    /// Ad-hoc read query. Returns `SyncError::Busy` while a bulk load is running.
    pub async fn query(&self, request: &QueryRequest) -> SyncResult<QueryResponse> {
        let what = "query";
        let response = self
            .execute(what, self.client.post(self.scoped_url(what)).json(request))
            .await?;
        let body: QueryResponse = self.json(what, response).await?;
        if body.busy {
            return Err(SyncError::Busy("query endpoint reported a bulk load".to_string()));
        }
        Ok(body)
    }

    pub async fn stats(&self) -> SyncResult<serde_json::Value> {
        let what = "stats";
        let response = self
            .execute(what, self.client.get(self.scoped_url(what)))
            .await?;
        self.json(what, response).await
    }
}

impl RemoteStore for RemoteClient {
    async fn health(&self) -> SyncResult<()> {
        let url = format!("{}/health", self.api_base_url);
        self.execute("health check", self.client.get(url)).await?;
        Ok(())
    }

    async fn metadata(&self) -> SyncResult<MetadataResponse> {
        let what = "metadata";
        let response = self
            .execute(what, self.client.get(self.scoped_url(what)))
            .await?;
        let meta: MetadataResponse = self.json(what, response).await?;
        if meta.busy {
            return Err(SyncError::Busy(
                meta.message
                    .unwrap_or_else(|| "bulk load in progress".to_string()),
            ));
        }
        Ok(meta)
    }

    async fn bulk_sync(&self, request: &BulkSyncRequest<'_>) -> SyncResult<BulkSyncResponse> {
        let what = "bulk-sync";
        let response = self
            .execute(what, self.client.post(self.scoped_url(what)).json(request))
            .await?;
        self.json(what, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = RemoteClient::new(
            "https://store.example.com/",
            None,
            "acme",
            "hq",
            DEFAULT_REMOTE_TIMEOUT,
        )
        .unwrap();
        assert_eq!(client.api_base_url, "https://store.example.com");
        assert_eq!(client.tenant(), "acme");
        assert_eq!(client.sub_tenant(), "hq");
    }

    #[tokio::test]
    async fn test_unreachable_store_is_a_remote_error() {
        let client = RemoteClient::new(
            "http://127.0.0.1:1",
            None,
            "acme",
            "hq",
            Duration::from_secs(2),
        )
        .unwrap();
        let err = client.health().await.unwrap_err();
        assert!(
            matches!(err, SyncError::Remote(_) | SyncError::Timeout { .. }),
            "{:?}",
            err
        );
        assert!(!err.to_string().contains("ERP"));
    }

    #[test]
    fn test_scoped_urls() {
        let client = RemoteClient::new(
            "https://store.example.com",
            Some("key".to_string()),
            "acme",
            "hq",
            DEFAULT_REMOTE_TIMEOUT,
        )
        .unwrap();
        assert_eq!(
            client.scoped_url("bulk-sync"),
            "https://store.example.com/bulk-sync/acme/hq"
        );
        assert_eq!(
            client.scoped_url("metadata"),
            "https://store.example.com/metadata/acme/hq"
        );
    }
}
