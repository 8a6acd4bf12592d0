//! `fetch_url`: outbound HTTP requests through a self-healing client.

use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{
    Method, StatusCode,
    header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER},
};
use serde_json::{Map, Value as JsonValue, json};
use toolgate_core::{
    Arguments, CallContext, Classification, HttpConfig, ParamKind, ParamSchema, ParamSpec,
    StructuredError, Tool, ToolHandler,
};
use toolgate_runtime::{ClientError, ClientFactory, ClientSlot, ContextSource, ManagedClient, fingerprint};
use tracing::{debug, warn};

pub const TOOL_NAME: &str = "fetch_url";

const READ_METHODS: [&str; 3] = ["GET", "HEAD", "OPTIONS"];
const SUPPORTED_METHODS: [&str; 7] = ["GET", "HEAD", "OPTIONS", "POST", "PUT", "PATCH", "DELETE"];

/// Shared, live-updatable HTTP settings.
///
/// Updating them changes the factory fingerprint, so the next call rebuilds
/// the outbound client.
#[derive(Debug, Clone, Default)]
pub struct HttpSettings(Arc<RwLock<HttpConfig>>);

impl HttpSettings {
    pub fn new(config: HttpConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    pub fn snapshot(&self) -> HttpConfig {
        match self.0.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut HttpConfig)) {
        match self.0.write() {
            Ok(mut config) => f(&mut config),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// A `reqwest` client owned by a [`ClientSlot`].
#[derive(Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
    closed: AtomicBool,
}

impl HttpClient {
    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }
}

#[async_trait]
impl ManagedClient for HttpClient {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientFactory {
    settings: HttpSettings,
}

impl HttpClientFactory {
    pub fn new(settings: HttpSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }
}

impl ClientFactory for HttpClientFactory {
    type Client = HttpClient;

    fn fingerprint(&self) -> String {
        let config = self.settings.snapshot();
        fingerprint([
            config.user_agent,
            config.timeout_ms.to_string(),
            config.bearer_token.unwrap_or_default(),
        ])
    }

    fn build(&self) -> Result<HttpClient, ClientError> {
        let config = self.settings.snapshot();

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::Build(format!("invalid bearer token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let timeout = config.timeout();
        let inner = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ClientError::Build(e.to_string()))?;

        Ok(HttpClient {
            inner,
            closed: AtomicBool::new(false),
        })
    }
}

/// Handler for `fetch_url`.
#[derive(Debug)]
pub struct FetchUrl {
    slot: Arc<ClientSlot<HttpClientFactory>>,
}

impl FetchUrl {
    pub fn new(settings: HttpSettings, context: Arc<dyn ContextSource>) -> Self {
        Self {
            slot: Arc::new(ClientSlot::new(HttpClientFactory::new(settings), context)),
        }
    }

    pub fn slot(&self) -> &Arc<ClientSlot<HttpClientFactory>> {
        &self.slot
    }
}

struct FetchRequest {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<JsonValue>,
}

fn parse_request(args: &Arguments) -> Result<FetchRequest, StructuredError> {
    let url = args
        .get("url")
        .and_then(JsonValue::as_str)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| StructuredError::validation("invalid_argument", "`url` must be a non-empty string"))?
        .to_string();

    let method = match args.get("method") {
        None | Some(JsonValue::Null) => Method::GET,
        Some(JsonValue::String(method)) => {
            let upper = method.to_ascii_uppercase();
            if !SUPPORTED_METHODS.contains(&upper.as_str()) {
                return Err(StructuredError::validation(
                    "unsupported_method",
                    format!("method `{method}` is not supported"),
                )
                .with_detail("supported_methods", SUPPORTED_METHODS.to_vec()));
            }
            Method::from_bytes(upper.as_bytes()).map_err(|e| {
                StructuredError::validation("unsupported_method", e.to_string())
            })?
        }
        Some(_) => {
            return Err(StructuredError::validation("invalid_argument", "`method` must be a string"));
        }
    };

    let mut headers = HeaderMap::new();
    match args.get("headers") {
        None | Some(JsonValue::Null) => {}
        Some(JsonValue::Object(map)) => {
            for (name, value) in map {
                let value = value.as_str().ok_or_else(|| {
                    StructuredError::validation(
                        "invalid_header",
                        format!("header `{name}` must be a string"),
                    )
                })?;
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    StructuredError::validation("invalid_header", format!("`{name}`: {e}"))
                })?;
                let value = HeaderValue::from_str(value).map_err(|e| {
                    StructuredError::validation("invalid_header", format!("`{name}`: {e}"))
                })?;
                headers.insert(name, value);
            }
        }
        Some(_) => {
            return Err(StructuredError::validation("invalid_argument", "`headers` must be an object"));
        }
    }

    let body = args.get("body").filter(|body| !body.is_null()).cloned();

    Ok(FetchRequest {
        method,
        url,
        headers,
        body,
    })
}

/// Maps a non-success HTTP status onto an error envelope.
fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> StructuredError {
    let message = if body.is_empty() {
        format!("upstream returned {status}")
    } else {
        format!("upstream returned {status}: {body}")
    };

    let error = match status.as_u16() {
        401 | 403 => StructuredError::auth("http_unauthorized", message),
        404 => StructuredError::not_found("http_not_found", message),
        429 => {
            let error = StructuredError::rate_limited("http_rate_limited", message);
            match retry_after(headers) {
                Some(delay) => error.with_retry_after(delay),
                None => error,
            }
        }
        code if code >= 500 => StructuredError::upstream("http_server_error", message),
        _ => StructuredError::validation("http_client_error", message),
    };
    error.with_detail("http_status", status.as_u16())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

fn transport_error(err: &reqwest::Error) -> StructuredError {
    if err.is_timeout() {
        StructuredError::upstream("timeout", err.to_string())
    } else if err.is_connect() {
        StructuredError::upstream("connection_failed", err.to_string())
    } else if err.is_builder() {
        StructuredError::validation("invalid_url", err.to_string())
    } else {
        StructuredError::upstream("http_error", err.to_string())
    }
}

fn headers_to_json(headers: &HeaderMap) -> Map<String, JsonValue> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), JsonValue::String(value.to_string())))
        })
        .collect()
}

#[async_trait]
impl ToolHandler for FetchUrl {
    async fn call(&self, ctx: CallContext, args: Arguments) -> anyhow::Result<JsonValue> {
        let request = parse_request(&args)?;
        let max_body_bytes = self.slot.factory().settings().snapshot().max_body_bytes;
        let client = self.slot.get().map_err(StructuredError::from)?;

        debug!(
            method = %request.method,
            url = %request.url,
            attempt = ctx.attempt(),
            "Sending HTTP request"
        );

        let mut builder = client
            .inner()
            .request(request.method, &request.url)
            .headers(request.headers);
        builder = match request.body {
            Some(JsonValue::String(raw)) => builder.body(raw),
            Some(body) => builder.json(&body),
            None => builder,
        };

        let mut response = builder.send().await.map_err(|e| transport_error(&e))?;
        let status = response.status();
        let headers = response.headers().clone();

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.map_err(|e| transport_error(&e))? {
            let remaining = max_body_bytes.saturating_sub(body.len());
            if chunk.len() > remaining {
                body.extend_from_slice(&chunk[..remaining]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&body).into_owned();

        if !status.is_success() {
            warn!(status = status.as_u16(), url = %request.url, "Upstream request failed");
            return Err(status_error(status, &headers, &body).into());
        }

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers_to_json(&headers),
            "body": body,
            "truncated": truncated,
        }))
    }
}

/// `GET`, `HEAD` and `OPTIONS` are reads; every other method mutates.
fn method_is_write(args: &Map<String, JsonValue>) -> bool {
    match args.get("method") {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::String(method)) => !READ_METHODS.contains(&method.to_ascii_uppercase().as_str()),
        Some(_) => true,
    }
}

/// Registration record for `fetch_url`.
pub fn fetch_url_tool(settings: HttpSettings, context: Arc<dyn ContextSource>) -> Tool {
    Tool::builder(TOOL_NAME, Arc::new(FetchUrl::new(settings, context)))
        .description("Send an HTTP request and return the status, headers and body")
        .params(ParamSchema::new(vec![
            ParamSpec::required("url", ParamKind::String),
            ParamSpec::optional("method", ParamKind::String)
                .with_description("HTTP method, defaults to GET"),
            ParamSpec::optional("headers", ParamKind::Object),
            ParamSpec::optional("body", ParamKind::Any)
                .with_description("Strings are sent verbatim, other values as JSON"),
        ]))
        .classification(Classification::dynamic(method_is_write))
        .build()
}
