//! I/O collaborators for bitstats: JSON HTTP fetch, object store, secrets and the record table.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub mod object_store;
pub mod records;
pub mod secrets;

pub use object_store::{FsObjectStore, ObjectStore, StoredObject};
pub use records::{DailyTotal, JsonLinesSink, RecordSink, SqliteRecordStore};
pub use secrets::{DirSecretStore, EnvSecretStore, SecretError, SecretStore};

pub const CRATE_NAME: &str = "bitstats-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {key} not found in bucket {bucket}")]
    ObjectNotFound { bucket: String, key: String },
    #[error("database file {0} does not exist")]
    MissingDatabase(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-attempt JSON fetcher. Any transport error, non-200 status or
/// undecodable body fails the call; nothing is retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        bearer_token: &str,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let request_error = |source| FetchError::Request {
                url: url.to_string(),
                source,
            };

            let resp = self
                .client
                .get(url)
                .bearer_auth(bearer_token)
                .header(ACCEPT, "application/json")
                .send()
                .await
                .map_err(request_error)?;

            let status = resp.status();
            if status != StatusCode::OK {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let body = resp.bytes().await.map_err(request_error)?;
            debug!(bytes = body.len(), "response received");
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Echo {
        auth: String,
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).expect("fetcher")
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn sends_bearer_token_and_decodes_json() {
        let router = Router::new().route(
            "/echo",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(serde_json::json!({ "auth": auth }))
            }),
        );
        let base = serve(router).await;

        let echo: Echo = fetcher()
            .get_json(&format!("{base}/echo"), "s3cret")
            .await
            .expect("fetch");
        assert_eq!(echo.auth, "Bearer s3cret");
    }

    #[tokio::test]
    async fn non_ok_status_is_not_retried() {
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/flaky",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    axum::http::StatusCode::SERVICE_UNAVAILABLE
                }
            }),
        );
        let base = serve(router).await;

        let err = fetcher()
            .get_json::<serde_json::Value>(&format!("{base}/flaky"), "t")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn created_status_is_rejected() {
        let router = Router::new().route(
            "/created",
            get(|| async { (axum::http::StatusCode::CREATED, Json(serde_json::json!({}))) }),
        );
        let base = serve(router).await;

        let err = fetcher()
            .get_json::<serde_json::Value>(&format!("{base}/created"), "t")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 201, .. }));
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let router = Router::new().route("/bad", get(|| async { "not json" }));
        let base = serve(router).await;

        let err = fetcher()
            .get_json::<serde_json::Value>(&format!("{base}/bad"), "t")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }
}
