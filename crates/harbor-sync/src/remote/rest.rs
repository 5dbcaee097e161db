//! # REST Remote Store
//!
//! [`RemoteStore`] over a PostgREST-style HTTP interface.
//!
//! ## Request Mapping
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Operation        HTTP                                                  │
//! │  ─────────        ────                                                  │
//! │  insert           POST   /rest/v1/{table}                               │
//! │  update           PATCH  /rest/v1/{table}?{key}=eq.{id}                 │
//! │  delete           DELETE /rest/v1/{table}?{key}=eq.{id}                 │
//! │  select_all       GET    /rest/v1/{table}?select=*                      │
//! │  select_by_id     GET    /rest/v1/{table}?select=*&{key}=eq.{id}        │
//! │  ping             GET    /rest/v1/                                      │
//! │                                                                         │
//! │  Status           RemoteError                                           │
//! │  ──────           ───────────                                           │
//! │  404              NotFound                                              │
//! │  409 / 23505      Conflict                                              │
//! │  408, 429, 5xx    Transient (also connect / timeout failures)           │
//! │  other 4xx        Rejected                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Update and delete request `Prefer: return=representation` so the number of
//! returned rows is the number of rows affected.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, trace};
use url::Url;

use harbor_core::Record;

use super::{RemoteError, RemoteResult, RemoteStore};
use crate::error::{SyncError, SyncResult};

/// Postgres unique_violation SQLSTATE, reported in error bodies.
const UNIQUE_VIOLATION: &str = "23505";

/// HTTP client for the remote store's table API.
#[derive(Debug, Clone)]
pub struct RestRemote {
    client: Client,
    base: Url,
    api_key: Option<String>,
}

impl RestRemote {
    /// Creates a client for `base_url` (e.g. `https://project.example.co`).
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> SyncResult<Self> {
        let mut base = Url::parse(base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "Remote URL must start with http:// or https://, got: {base_url}"
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {e}")))?;

        debug!(base = %base, "REST remote client created");
        Ok(RestRemote {
            client,
            base,
            api_key,
        })
    }

    fn table_url(&self, table: &str) -> RemoteResult<Url> {
        self.base
            .join(&format!("rest/v1/{table}"))
            .map_err(|e| RemoteError::Protocol(e.to_string()))
    }

    fn row_url(&self, table: &str, key_column: &str, id: &str) -> RemoteResult<Url> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut()
            .append_pair(key_column, &format!("eq.{id}"));
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, body))
    }

    async fn rows(response: Response) -> RemoteResult<Vec<Record>> {
        response
            .json::<Vec<Record>>()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl RemoteStore for RestRemote {
    async fn insert(&self, table: &str, record: &Record) -> RemoteResult<()> {
        trace!(table = %table, "POST");
        let url = self.table_url(table)?;
        self.send(
            self.client
                .post(url)
                .header("Prefer", "return=minimal")
                .json(record),
        )
        .await?;
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        key_column: &str,
        id: &str,
        patch: &Record,
    ) -> RemoteResult<u64> {
        trace!(table = %table, id = %id, "PATCH");
        let url = self.row_url(table, key_column, id)?;
        let response = self
            .send(
                self.client
                    .patch(url)
                    .header("Prefer", "return=representation")
                    .json(patch),
            )
            .await?;
        Ok(Self::rows(response).await?.len() as u64)
    }

    async fn delete(&self, table: &str, key_column: &str, id: &str) -> RemoteResult<u64> {
        trace!(table = %table, id = %id, "DELETE");
        let url = self.row_url(table, key_column, id)?;
        let response = self
            .send(
                self.client
                    .delete(url)
                    .header("Prefer", "return=representation"),
            )
            .await?;
        Ok(Self::rows(response).await?.len() as u64)
    }

    async fn select_all(&self, table: &str) -> RemoteResult<Vec<Record>> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut().append_pair("select", "*");
        let response = self.send(self.client.get(url)).await?;
        Self::rows(response).await
    }

    async fn select_by_id(
        &self,
        table: &str,
        key_column: &str,
        id: &str,
    ) -> RemoteResult<Option<Record>> {
        let mut url = self.row_url(table, key_column, id)?;
        url.query_pairs_mut().append_pair("select", "*");
        let response = self.send(self.client.get(url)).await?;
        Ok(Self::rows(response).await?.into_iter().next())
    }

    async fn ping(&self) -> RemoteResult<()> {
        let url = self
            .base
            .join("rest/v1/")
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(map_transport)?;

        // Any answer short of a server error means the store is reachable.
        if response.status().is_server_error() {
            Err(RemoteError::Transient(format!("ping returned {}", response.status())))
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn map_transport(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Protocol(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}

fn map_status(status: StatusCode, body: String) -> RemoteError {
    match status.as_u16() {
        404 => RemoteError::NotFound,
        409 => RemoteError::Conflict,
        _ if body.contains(UNIQUE_VIOLATION) => RemoteError::Conflict,
        408 | 429 => RemoteError::Transient(format!("{status}: {body}")),
        code if status.is_server_error() => RemoteError::Transient(format!("{code}: {body}")),
        code => RemoteError::Rejected {
            status: code,
            message: body,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> RestRemote {
        RestRemote::new("https://pos.example.co", Some("key".into()), Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn test_urls() {
        let remote = remote();
        assert_eq!(
            remote.table_url("products").unwrap().as_str(),
            "https://pos.example.co/rest/v1/products"
        );
        assert_eq!(
            remote.row_url("settings", "key", "currency").unwrap().as_str(),
            "https://pos.example.co/rest/v1/settings?key=eq.currency"
        );
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(RestRemote::new("ws://pos.example.co", None, Duration::from_secs(1)).is_err());
        assert!(RestRemote::new("not a url", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status(StatusCode::NOT_FOUND, String::new()), RemoteError::NotFound);
        assert_eq!(map_status(StatusCode::CONFLICT, String::new()), RemoteError::Conflict);
        assert_eq!(
            map_status(
                StatusCode::BAD_REQUEST,
                r#"{"code":"23505","message":"duplicate key"}"#.into()
            ),
            RemoteError::Conflict
        );
        assert!(map_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_transient());
        assert!(map_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(matches!(
            map_status(StatusCode::UNPROCESSABLE_ENTITY, "bad column".into()),
            RemoteError::Rejected { status: 422, .. }
        ));
    }
}
