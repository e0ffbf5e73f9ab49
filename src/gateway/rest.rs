use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;

use super::{Backend, Filter, Table};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct RemoteError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTPS gateway for a REST endpoint family rooted at `{base_url}/rest/v1`.
/// Every request carries the static API credential.
#[derive(Clone)]
pub struct RestGateway {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestGateway {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.name())
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<RemoteError>(&body)
            .ok()
            .and_then(|e| e.message.or(e.error))
            .unwrap_or(body);
        Err(Error::Remote {
            status: status.as_u16(),
            message,
        })
    }

    async fn rows(resp: Response) -> Result<Vec<Value>> {
        let value: Value = resp.json().await?;
        match value {
            Value::Array(rows) => Ok(rows),
            other => Err(Error::Schema(format!("expected a JSON array, got {other}"))),
        }
    }
}

#[async_trait]
impl Backend for RestGateway {
    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<Value>> {
        let resp = self
            .authorized(self.client.get(self.url(table)))
            .query(&filter.query_pairs())
            .send()
            .await?;
        Self::rows(Self::check(resp).await?).await
    }

    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<()> {
        let resp = self
            .authorized(self.client.post(self.url(table)))
            .header("Prefer", "return=minimal")
            .json(&rows)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn update(&self, table: Table, key: &str, value: &str, patch: Value) -> Result<()> {
        let resp = self
            .authorized(self.client.patch(self.url(table)))
            .query(&[(key, format!("eq.{value}"))])
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        let updated = Self::rows(Self::check(resp).await?).await?;
        if updated.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str, value: &str) -> Result<()> {
        let resp = self
            .authorized(self.client.delete(self.url(table)))
            .query(&[(key, format!("eq.{value}"))])
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> RestGateway {
        RestGateway::new("https://roster.example.com/", "anon-key", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_table_urls() {
        let gateway = gateway();
        assert_eq!(gateway.base_url(), "https://roster.example.com");
        assert_eq!(
            gateway.url(Table::SyncMetadata),
            "https://roster.example.com/rest/v1/sync_metadata"
        );
    }

    #[test]
    fn test_requests_carry_credential() {
        let gateway = gateway();
        let request = gateway
            .authorized(gateway.client.get(gateway.url(Table::Roster)))
            .query(&Filter::all().eq("id", "r1").query_pairs())
            .build()
            .unwrap();

        assert_eq!(request.headers()["apikey"], "anon-key");
        assert_eq!(request.headers()["authorization"], "Bearer anon-key");
        assert_eq!(request.url().query(), Some("id=eq.r1&select=*"));
    }
}
