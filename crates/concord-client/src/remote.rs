use concord_core::{AppError, Dialect, EntityKind, HttpConfig, PaginationConfig};
use futures::stream::{self, BoxStream};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::pagination::{Page, PageStrategy};
use crate::retry::with_retry;

/// Remote API version; each serves one paging dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

/// Error envelope returned by the remote service:
///
/// ```json
/// { "errors": [ { "title": "Invalid attribute", "detail": "owner_email is not a user" } ] }
/// ```
#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    errors: Vec<ErrorEntry>,
}

#[derive(Deserialize, Debug)]
struct ErrorEntry {
    title: Option<String>,
    detail: Option<String>,
}

/// Extracts a human message from an error body.
///
/// Takes the first entry of the `errors` array, preferring `detail` over
/// `title`; falls back to the raw body when it is not a parseable envelope.
///
/// # Examples
///
/// ```
/// use concord_client::extract_error_message;
///
/// let body = r#"{"errors": [{"title": "Conflict", "detail": "Records are already linked"}]}"#;
/// assert_eq!(extract_error_message(body), "Records are already linked");
/// assert_eq!(extract_error_message("upstream exploded"), "upstream exploded");
/// ```
pub fn extract_error_message(body: &str) -> String {
    let from_envelope = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.errors.into_iter().next())
        .and_then(|entry| {
            entry
                .detail
                .filter(|d| !d.trim().is_empty())
                .or(entry.title.filter(|t| !t.trim().is_empty()))
        });

    match from_envelope {
        Some(message) => message,
        None if body.trim().is_empty() => "No error details".to_string(),
        None => body.trim().to_string(),
    }
}

/// Maps a non-success status and its body to an [`AppError`].
pub fn classify_status(status: StatusCode, body: &str) -> AppError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return AppError::RateLimitExceeded;
    }
    let message = extract_error_message(body);
    if status.is_server_error() {
        AppError::ServerError {
            status: status.as_u16(),
            message,
        }
    } else {
        AppError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

/// Authenticated HTTP client for the remote CRM API.
///
/// # Examples
///
/// ```no_run
/// use concord_client::RemoteClient;
/// use concord_core::{HttpConfig, PaginationConfig};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = RemoteClient::new(
///     "https://api.example.com",
///     "secret-token",
///     HttpConfig::default(),
///     PaginationConfig::default(),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RemoteClient {
    client: Client,
    base_url: Url,
    http: HttpConfig,
    pagination: PaginationConfig,
    dialects: HashMap<EntityKind, Dialect>,
}

impl RemoteClient {
    /// Creates a client for the instance at `base_url_str`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MissingCredentials` for an empty token,
    /// `AppError::InvalidUrl` for a malformed base URL and
    /// `AppError::ClientError` if the HTTP client cannot be built.
    pub fn new(
        base_url_str: &str,
        token: &str,
        http: HttpConfig,
        pagination: PaginationConfig,
    ) -> Result<Self, AppError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::MissingCredentials("API token is empty".to_string()));
        }

        let mut base_url = Url::parse(base_url_str)
            .map_err(|_| AppError::InvalidUrl(base_url_str.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::InvalidUrl(base_url_str.to_string()));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| AppError::ConfigError("API token contains invalid characters".into()))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .user_agent("Concord/0.1 (csv-reconciler)")
            .timeout(http.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            http,
            pagination,
            dialects: HashMap::new(),
        })
    }

    /// Pages the collection of `kind` with `dialect` instead of offsets.
    pub fn with_dialect(mut self, kind: EntityKind, dialect: Dialect) -> Self {
        self.dialects.insert(kind, dialect);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn http_config(&self) -> &HttpConfig {
        &self.http
    }

    pub fn pagination_config(&self) -> &PaginationConfig {
        &self.pagination
    }

    pub fn dialect_for(&self, kind: EntityKind) -> Dialect {
        self.dialects.get(&kind).copied().unwrap_or_default()
    }

    /// Builds `{base}/{version}/{segments...}`, escaping each segment.
    pub fn url(&self, version: ApiVersion, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(version.prefix())
            .extend(segments);
        Ok(url)
    }

    /// Sends one request with the retry policy applied.
    ///
    /// Returns the parsed JSON body, or `None` for an empty success body.
    pub async fn call(
        &self,
        method: Method,
        version: ApiVersion,
        segments: &[&str],
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>, AppError> {
        let url = self.url(version, segments)?;
        let description = format!("{} {}", method, url.path());
        with_retry(&self.http, &description, || {
            self.send_once(method.clone(), url.clone(), query, body)
        })
        .await
    }

    async fn send_once(
        &self,
        method: Method,
        url: Url,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>, AppError> {
        let mut request = self.client.request(method.clone(), url.clone());
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            let err = classify_status(status, &text);
            tracing::debug!(
                method = %method,
                path = url.path(),
                status = status.as_u16(),
                error = %err,
                "Remote call rejected"
            );
            return Err(err);
        }

        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.http.timeout.as_secs())
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {}", e))
        } else if e.is_request() || e.is_body() {
            // The connection was reset or closed mid-exchange
            AppError::NetworkError(e.to_string())
        } else {
            AppError::ClientError(e.to_string())
        }
    }

    /// Lazily pages through a collection, yielding one batch per page.
    ///
    /// The stream ends when the strategy reports no further page or when
    /// `cap` records have been yielded, whichever comes first. Calling it
    /// again with a fresh strategy restarts from the beginning.
    pub fn paginate<'a>(
        &'a self,
        collection: &'a str,
        strategy: PageStrategy,
        cap: usize,
    ) -> BoxStream<'a, Result<Vec<Value>, AppError>> {
        Box::pin(stream::try_unfold(
            Some((strategy, 0usize)),
            move |state| async move {
                let Some((mut strategy, fetched)) = state else {
                    return Ok(None);
                };
                if fetched >= cap {
                    return Ok(None);
                }

                let body = self
                    .call(
                        Method::GET,
                        strategy.version(),
                        &[collection],
                        &strategy.query(),
                        None,
                    )
                    .await?
                    .ok_or(AppError::EmptyResponse)?;
                let page: Page = serde_json::from_value(body)?;

                let more = strategy.advance(&page);
                let mut batch = page.data;
                batch.truncate(cap - fetched);
                let fetched = fetched + batch.len();

                if fetched >= cap && more {
                    tracing::warn!(collection, cap, "Record cap reached, listing truncated");
                }
                tracing::debug!(collection, fetched, more, "Fetched page");

                let next = (more && fetched < cap).then_some((strategy, fetched));
                Ok(Some((batch, next)))
            },
        ))
    }
}
