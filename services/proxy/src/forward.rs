//! Request forwarding
//!
//! Route shape: `/{prefix}/{serviceName}/{subpath...}`. The prefix set is
//! configured per deployment and matched case-insensitively, as is the
//! service name. Bodies are streamed in both directions and never
//! buffered; the response is dispatched headers-first.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use discovery_cache::DiscoveryCache;
use services_common::models::{ErrorResponse, InstanceRecord};
use services_common::trace::{
    self, BAGGAGE_HEADER, SpanRecord, TRACEPARENT_HEADER, TraceContext, TraceSink,
};

use crate::breaker::BreakerRegistry;
use crate::config::ProxyConfig;

/// Hop-by-hop headers stripped in both directions per RFC 7230
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared proxy state
#[derive(Clone)]
pub struct ProxyState {
    pub cache: Arc<DiscoveryCache>,
    pub breakers: Arc<BreakerRegistry>,
    pub config: Arc<ProxyConfig>,
    /// General-purpose upstream pool
    pub client: reqwest::Client,
    /// Large-transfer pool: fewer connections, HTTP/1.1 only
    pub large_client: reqwest::Client,
    pub trace_sink: Arc<dyn TraceSink>,
}

/// The routing result extracted from a request path
#[derive(Debug, PartialEq, Eq)]
pub struct ProxyRoute {
    pub service_name: String,
    /// Forwarded path, always starting with `/`
    pub subpath: String,
}

/// Extract `/{prefix}/{serviceName}/{subpath...}` from a path
#[must_use]
pub fn extract_route(config: &ProxyConfig, path: &str) -> Option<ProxyRoute> {
    let trimmed = path.strip_prefix('/')?;
    let (prefix, rest) = match trimmed.split_once('/') {
        Some(parts) => parts,
        None => (trimmed, ""),
    };
    if !config.matches_prefix(prefix) {
        return None;
    }
    let (service, subpath) = match rest.split_once('/') {
        Some((service, tail)) => (service, format!("/{tail}")),
        None => (rest, "/".to_string()),
    };
    if service.is_empty() {
        return None;
    }
    Some(ProxyRoute {
        service_name: service.to_string(),
        subpath,
    })
}

/// Fallback handler: every method, every path
pub async fn proxy_handler(State(state): State<ProxyState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some(route) = extract_route(&state.config, &path) else {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("no proxy route matches '{path}'"),
            None,
        );
    };

    // The extractor is case-insensitive; the catalog is not
    let service_name = state
        .cache
        .resolve_name(&route.service_name)
        .unwrap_or_else(|| route.service_name.clone());

    let Some(instance) = state.cache.pick(&service_name, None) else {
        debug!(service = %service_name, "No healthy instance available");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            &format!("no healthy instance of '{service_name}'"),
            Some(&service_name),
        );
    };

    let breaker = state.breakers.breaker_for(&instance.authority());
    if !breaker.try_acquire() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "circuit_open",
            "Circuit open",
            Some(&service_name),
        );
    }

    let ctx = TraceContext::extract(
        header_str(request.headers(), TRACEPARENT_HEADER),
        header_str(request.headers(), BAGGAGE_HEADER),
    );
    let span_started = Instant::now();
    let span_started_at = Utc::now();
    let span_ctx = ctx.clone();

    let outcome = trace::with_context(
        ctx,
        forward(&state, &service_name, &instance, route, request),
    )
    .await;

    let (response, upstream_ok) = match outcome {
        Ok(response) => {
            let ok = response.status().is_success();
            if ok {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
            (response, ok)
        }
        Err(failure) => {
            breaker.record_failure();
            (failure.into_error_response(&service_name), false)
        }
    };

    state.trace_sink.record(&SpanRecord {
        name: format!("proxy {service_name}"),
        trace_id: span_ctx.trace_id,
        span_id: span_ctx.span_id,
        parent_span_id: span_ctx.parent_span_id,
        started_at: span_started_at,
        duration_ms: span_started.elapsed().as_millis() as u64,
        ok: upstream_ok,
    });
    response
}

/// Upstream dispatch failure, pre-classified for the wire
enum ForwardFailure {
    Timeout(String),
    Transient(String),
    Internal(String),
}

impl ForwardFailure {
    fn into_error_response(self, service: &str) -> Response {
        match self {
            Self::Timeout(message) => error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                &message,
                Some(service),
            ),
            Self::Transient(message) => error_response(
                StatusCode::BAD_GATEWAY,
                "transient",
                &message,
                Some(service),
            ),
            Self::Internal(message) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                &message,
                Some(service),
            ),
        }
    }
}

async fn forward(
    state: &ProxyState,
    service_name: &str,
    instance: &InstanceRecord,
    route: ProxyRoute,
    request: Request,
) -> Result<Response, ForwardFailure> {
    let method = request.method().clone();
    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let url = format!(
        "http://{}{}{}",
        instance.authority(),
        route.subpath,
        query
    );

    // Large transfers go to the dedicated pool with a long deadline
    let content_length = header_str(request.headers(), header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse::<u64>().ok());
    let large = content_length.is_some_and(|len| len > state.config.upstream.large_threshold_bytes);
    let (client, timeout) = if large {
        (
            &state.large_client,
            Duration::from_secs(state.config.upstream.large_timeout_seconds),
        )
    } else {
        (
            &state.client,
            Duration::from_secs(state.config.upstream.timeout_seconds),
        )
    };

    let mut upstream_headers = filter_headers(request.headers());
    upstream_headers.remove(header::HOST);
    if let Some(ctx) = trace::current() {
        if let Ok(value) = HeaderValue::from_str(&ctx.to_traceparent()) {
            upstream_headers.insert(HeaderName::from_static(TRACEPARENT_HEADER), value);
        }
        if let Some(baggage) = ctx.to_baggage() {
            if let Ok(value) = HeaderValue::from_str(&baggage) {
                upstream_headers.insert(HeaderName::from_static(BAGGAGE_HEADER), value);
            }
        }
    }

    debug!(service = %service_name, %method, %url, large, "Forwarding request");

    // Outstanding-request accounting for least-in-flight; released when
    // the response body finishes streaming
    let inflight = state
        .cache
        .balancer()
        .inflight()
        .acquire(instance.instance_id);

    let body_stream = request.into_body().into_data_stream();
    let upstream = client
        .request(method.clone(), &url)
        .headers(upstream_headers)
        .body(reqwest::Body::wrap_stream(body_stream))
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify(&e, &url))?;

    // Headers-first: the status line and headers go out now, the body
    // streams behind them
    let status = upstream.status();
    let response_headers = filter_headers(upstream.headers());
    let guard = inflight;
    let body = Body::from_stream(upstream.bytes_stream().map(move |chunk| {
        let _streaming = &guard;
        chunk
    }));

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn classify(error: &reqwest::Error, url: &str) -> ForwardFailure {
    if error.is_timeout() {
        warn!(%url, "Upstream call timed out");
        ForwardFailure::Timeout(format!("upstream deadline exceeded for {url}"))
    } else if error.is_connect() || error.is_request() || error.is_body() {
        warn!(%url, error = %error, "Upstream call failed");
        ForwardFailure::Transient(format!("upstream unreachable: {error}"))
    } else {
        warn!(%url, error = %error, "Unexpected upstream error");
        ForwardFailure::Internal(error.to_string())
    }
}

/// Copy headers minus the hop-by-hop set and anything named by the
/// Connection header
fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_scoped: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        let lowered = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lowered.as_str()) || connection_scoped.contains(&lowered) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn error_response(
    status: StatusCode,
    kind: &str,
    message: &str,
    service: Option<&str>,
) -> Response {
    let body = ErrorResponse {
        error: kind.to_string(),
        message: message.to_string(),
        service: service.map(ToString::to_string),
    };
    (status, Json(body)).into_response()
}

/// GET /health
pub async fn health(State(state): State<ProxyState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "cacheVersion": state.cache.version(),
        "services": state.cache.service_names().len(),
        "breakers": state.breakers.len(),
    }))
}
