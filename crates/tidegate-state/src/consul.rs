//! Consul key/value backend over the HTTP API.
//!
//! ```text
//! GET /v1/kv/<key>?raw          200 → raw value, X-Consul-Index header
//!                               404 → absent
//! PUT /v1/kv/<key>[?cas=<idx>]  200 → "true" | "false"
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::kv::{KvBackend, KvEntry};

const INDEX_HEADER: &str = "x-consul-index";
const TOKEN_HEADER: &str = "x-consul-token";

/// Consul KV client. Cheap to clone; connections are pooled.
#[derive(Clone)]
pub struct ConsulKv {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    token: Option<String>,
}

impl ConsulKv {
    /// Create a client for `address` (`host:port` or `http://host:port`).
    pub fn new(address: &str, token: Option<String>) -> StateResult<Self> {
        let address = address.trim().trim_end_matches('/');
        if address.is_empty() {
            return Err(StateError::InvalidAddress("empty address".to_string()));
        }
        let base_url = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        base_url
            .parse::<http::Uri>()
            .map_err(|e| StateError::InvalidAddress(format!("{base_url}: {e}")))?;

        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self {
            client,
            base_url,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Each `/`-separated key segment is percent-encoded, so names carrying
    /// `?`, `#`, or spaces stay inside the path.
    fn kv_uri(&self, key: &str, query: &str) -> StateResult<http::Uri> {
        let path = key
            .trim_start_matches('/')
            .split('/')
            .map(urlencoding::encode)
            .collect::<Vec<_>>()
            .join("/");
        let uri = format!("{}/v1/kv/{}?{}", self.base_url, path, query);
        uri.parse()
            .map_err(|e| StateError::InvalidAddress(format!("{uri}: {e}")))
    }

    async fn send(
        &self,
        method: Method,
        uri: http::Uri,
        body: Vec<u8>,
    ) -> StateResult<(StatusCode, http::HeaderMap, Bytes)> {
        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header("user-agent", "tidegate-state/0.1");
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        let req = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| StateError::Request(e.to_string()))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| StateError::Request(format!("{uri}: {e}")))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| StateError::Request(e.to_string()))?
            .to_bytes();

        Ok((status, headers, body))
    }

    async fn put_with_query(&self, key: &str, value: Vec<u8>, query: &str) -> StateResult<bool> {
        let uri = self.kv_uri(key, query)?;
        let (status, _, body) = self.send(Method::PUT, uri, value).await?;
        if !status.is_success() {
            return Err(unexpected(status, &body));
        }
        Ok(String::from_utf8_lossy(&body).trim() == "true")
    }
}

fn unexpected(status: StatusCode, body: &[u8]) -> StateError {
    StateError::Status {
        status: status.as_u16(),
        body: String::from_utf8_lossy(body).trim().to_string(),
    }
}

#[async_trait]
impl KvBackend for ConsulKv {
    async fn get(&self, key: &str) -> StateResult<Option<KvEntry>> {
        let uri = self.kv_uri(key, "raw")?;
        let (status, headers, body) = self.send(Method::GET, uri, Vec::new()).await?;

        match status {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let modify_index = headers
                    .get(INDEX_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or_else(|| {
                        debug!(%key, "consul response carried no index header");
                        0
                    });
                Ok(Some(KvEntry {
                    value: body.to_vec(),
                    modify_index,
                }))
            }
            s => Err(unexpected(s, &body)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StateResult<()> {
        if self.put_with_query(key, value, "").await? {
            Ok(())
        } else {
            Err(StateError::Request(format!("consul rejected write to {key}")))
        }
    }

    async fn put_cas(&self, key: &str, value: Vec<u8>, index: u64) -> StateResult<bool> {
        self.put_with_query(key, value, &format!("cas={index}")).await
    }
}
