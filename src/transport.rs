use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Client, Method, StatusCode, Url};
use tokio::time::timeout;
use tracing::debug;

use crate::action::{CONTENT_LENGTH, Credential, SoapRequest};
use crate::error::{TransportError, TransportResult};

/// Response body as it arrives from the network
pub type ByteStream = BoxStream<'static, TransportResult<Bytes>>;

/// Status line and headers of a response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMetadata {
    pub url: Url,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Declared body length, when the server sent one
    pub content_length: Option<u64>,
    pub received_at: DateTime<Utc>,
}

impl ResponseMetadata {
    pub fn new(url: Url, status: u16) -> Self {
        Self {
            url,
            status,
            headers: Vec::new(),
            content_length: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_content_length(mut self, content_length: u64) -> Self {
        self.content_length = Some(content_length);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One started exchange: metadata plus the body still to be received
///
/// The body yields zero or more fragments and ends either cleanly or with a
/// single error.
pub struct TransportExchange {
    pub metadata: ResponseMetadata,
    pub body: ByteStream,
}

impl std::fmt::Debug for TransportExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportExchange")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// HTTP request/response mechanism used by engines
///
/// Returns once the response has started. A server asking for credentials is
/// reported as [`TransportError::AuthenticationChallenge`]; callers answer it
/// by issuing the same request again with a credential.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(
        &self,
        request: &SoapRequest,
        credential: Option<&Credential>,
    ) -> TransportResult<TransportExchange>;
}

/// Configuration for the HTTP transport
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Time allowed until the response starts, and between two body
    /// fragments, in seconds
    pub timeout_seconds: u64,
    /// User agent string
    pub user_agent: String,
    /// How long idle pooled connections are kept
    pub pool_idle_timeout_seconds: u64,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            user_agent: format!("soap-stream/{}", env!("CARGO_PKG_VERSION")),
            pool_idle_timeout_seconds: 30,
        }
    }
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    config: HttpTransportConfig,
}

impl ReqwestTransport {
    pub fn new(config: HttpTransportConfig) -> TransportResult<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_seconds))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(TransportError::from)?;

        Ok(Self { client, config })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    async fn send(
        &self,
        request: &SoapRequest,
        credential: Option<&Credential>,
    ) -> TransportResult<reqwest::Response> {
        let method =
            Method::from_bytes(request.method.as_bytes()).map_err(|e| TransportError::InvalidRequest {
                details: e.to_string(),
            })?;

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            // reqwest derives it from the body
            if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(credential) = credential {
            builder = builder.basic_auth(&credential.username, Some(&credential.password));
        }

        let request_future = builder.body(request.body.clone()).send();

        timeout(
            Duration::from_secs(self.config.timeout_seconds),
            request_future,
        )
        .await
        .map_err(|_| TransportError::Timeout {
            url: request.url.to_string(),
            timeout_seconds: self.config.timeout_seconds,
        })?
        .map_err(TransportError::from)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn exchange(
        &self,
        request: &SoapRequest,
        credential: Option<&Credential>,
    ) -> TransportResult<TransportExchange> {
        let response = self.send(request, credential).await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            if let Some(challenge) = response.headers().get(WWW_AUTHENTICATE) {
                let realm = challenge.to_str().ok().and_then(parse_realm);
                debug!(url = %request.url, ?realm, "authentication challenge");
                return Err(TransportError::AuthenticationChallenge { realm });
            }
        }

        let metadata = ResponseMetadata {
            url: response.url().clone(),
            status: status.as_u16(),
            headers: response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
            content_length: response.content_length(),
            received_at: Utc::now(),
        };
        debug!(
            url = %metadata.url,
            status = metadata.status,
            content_length = ?metadata.content_length,
            "response started"
        );

        let body = with_idle_timeout(
            response.bytes_stream().map_err(TransportError::from).boxed(),
            metadata.url.to_string(),
            Duration::from_secs(self.config.timeout_seconds),
        );

        Ok(TransportExchange { metadata, body })
    }
}

/// End `body` with a retryable [`TransportError::Timeout`] when no fragment
/// arrives within `idle`
///
/// The stream yields nothing after the timeout error.
pub fn with_idle_timeout(body: ByteStream, url: String, idle: Duration) -> ByteStream {
    stream::unfold(Some(body), move |body| {
        let url = url.clone();
        async move {
            let mut body = body?;
            match timeout(idle, body.next()).await {
                Ok(Some(fragment)) => Some((fragment, Some(body))),
                Ok(None) => None,
                Err(_) => {
                    debug!(url = %url, idle_ms = idle.as_millis() as u64, "response body stalled");
                    let error = TransportError::Timeout {
                        url,
                        timeout_seconds: idle.as_secs(),
                    };
                    Some((Err(error), None))
                }
            }
        }
    })
    .boxed()
}

/// Pull the realm out of a `WWW-Authenticate` header value
fn parse_realm(challenge: &str) -> Option<String> {
    let start = challenge.find("realm=")? + "realm=".len();
    let rest = &challenge[start..];
    let realm = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => rest.split([',', ' ']).next()?,
    };
    Some(realm.to_string())
}
