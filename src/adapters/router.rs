use std::{
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    Json, Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::IntoResponse,
};
use bytes::Bytes;
use hyper::{
    Request, Response, Uri,
    body::{Body as HttpBody, Frame, SizeHint},
};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::{
    adapters::admin,
    core::{EndpointLease, GatewayService, RoutingError, response_cache::CachedResponse},
    ports::http_client::{HttpClient, HttpClientError},
};

/// Largest upstream body buffered for the response cache
const MAX_CACHEABLE_BODY: usize = 8 * 1024 * 1024;

const X_CACHE: &str = "x-cache";
const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Per-request orchestrator: route, cache, breaker, balancer, transport.
#[derive(Clone)]
pub struct GatewayRouter {
    gateway_service: Arc<GatewayService>,
    http_client: Arc<dyn HttpClient>,
}

impl GatewayRouter {
    pub fn new(gateway_service: Arc<GatewayService>, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            gateway_service,
            http_client,
        }
    }

    pub fn gateway_service(&self) -> &Arc<GatewayService> {
        &self.gateway_service
    }

    /// Full axum application: operational endpoints plus the proxy fallback.
    pub fn into_app(self) -> Router {
        admin::routes()
            .fallback(proxy_handler)
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }

    /// Route one request. Errors are rendered as JSON responses.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let span = tracing::info_span!(
            "gateway_request",
            http.method = %req.method(),
            http.path = %req.uri().path(),
            request_id = %request_id,
            service = tracing::field::Empty,
        );

        match self
            .route(req, client_addr, &request_id)
            .instrument(span)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(error = %err, tag = err.tag(), "Request not routed");
                err.into_response()
            }
        }
    }

    async fn route(
        &self,
        mut req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
        request_id: &str,
    ) -> Result<Response<AxumBody>, RoutingError> {
        let gateway = &self.gateway_service;
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let method = req.method().clone();

        let (prefix, route) = gateway
            .find_matching_route(&path)
            .ok_or_else(|| RoutingError::RouteNotFound { path: path.clone() })?;
        let service = route.service.as_str();
        tracing::Span::current().record("service", service);

        if !route.allows_method(method.as_str()) {
            return Err(RoutingError::MethodNotAllowed {
                service: service.to_string(),
                method: method.to_string(),
            });
        }

        let cache_key = (route.cacheable && (method == Method::GET || method == Method::HEAD))
            .then(|| {
                gateway
                    .cache()
                    .cache_key(service, &method, &path, query.as_deref(), req.headers())
            });
        if let Some(key) = &cache_key {
            if let Some(cached) = gateway.cache().get(key).await {
                tracing::debug!(key = %key, "Cache hit");
                return Ok(cached_response(cached));
            }
        }

        let breaker = gateway.breakers().breaker(service).await;
        // Dropping the permit on any early return hands a trial slot back
        let Some(permit) = breaker.try_acquire() else {
            return Err(RoutingError::CircuitOpen {
                service: service.to_string(),
            });
        };

        let Some(balancer) = gateway.pools().get(service) else {
            tracing::error!("Route references a service without an instance pool");
            return Err(RoutingError::Internal {
                service: Some(service.to_string()),
            });
        };
        let Ok(lease) = balancer.next_endpoint() else {
            return Err(RoutingError::NoHealthyInstance {
                service: service.to_string(),
            });
        };
        let instance = lease.url().to_string();

        let rewritten = GatewayService::rewrite_path(prefix, route, &path);
        let target = match &query {
            Some(query) => format!("{instance}{rewritten}?{query}"),
            None => format!("{instance}{rewritten}"),
        };
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(target = %target, "Failed to build upstream URI: {e}");
                return Err(RoutingError::Internal {
                    service: Some(service.to_string()),
                });
            }
        };
        *req.uri_mut() = uri;
        add_forwarding_headers(req.headers_mut(), client_addr, request_id);

        let timeout = Duration::from_millis(route.timeout_ms);
        tracing::debug!(instance = %instance, upstream_path = %rewritten, "Forwarding request");

        match self.http_client.forward(req, timeout).await {
            Ok(response) => {
                let count_5xx = breaker.config().count_5xx_as_failure;
                if count_5xx && response.status().is_server_error() {
                    permit.record_failure();
                    lease.record_failure();
                } else {
                    permit.record_success();
                    lease.record_success();
                    balancer.mark_healthy(&instance);
                }

                let response = response.map(|body| LeasedBody::wrap(body, lease));
                match cache_key {
                    Some(key) if response.status().is_success() => {
                        Ok(self.store_and_respond(key, gateway.cache_ttl(route), response).await)
                    }
                    Some(_) => Ok(with_cache_header(response, "MISS")),
                    None => Ok(response),
                }
            }
            Err(err) => {
                permit.record_failure();
                lease.record_failure();
                balancer.mark_unhealthy(&instance);
                tracing::warn!(instance = %instance, error = %err, "Upstream request failed");

                Err(match err {
                    HttpClientError::Timeout(_) => RoutingError::UpstreamTimeout {
                        service: service.to_string(),
                    },
                    _ => RoutingError::UpstreamConnection {
                        service: service.to_string(),
                    },
                })
            }
        }
    }

    /// Buffer a cacheable 2xx response, store it, and return it with `x-cache: MISS`.
    ///
    /// Bodies without a known length, or longer than [`MAX_CACHEABLE_BODY`],
    /// stream through uncached.
    async fn store_and_respond(
        &self,
        key: String,
        ttl: Duration,
        response: Response<AxumBody>,
    ) -> Response<AxumBody> {
        let fits = response
            .body()
            .size_hint()
            .upper()
            .is_some_and(|len| len <= MAX_CACHEABLE_BODY as u64);
        if !fits {
            tracing::debug!(key = %key, "Response body too large or unsized, not caching");
            return with_cache_header(response, "MISS");
        }

        let (parts, body) = response.into_parts();
        let body = match axum::body::to_bytes(body, MAX_CACHEABLE_BODY).await {
            Ok(bytes) => bytes,
            Err(e) => {
                // Headers were already received; the body broke off mid-stream
                tracing::warn!(key = %key, "Failed to buffer upstream body for caching: {e}");
                let response = Response::from_parts(parts, AxumBody::empty());
                return with_cache_header(response, "MISS");
            }
        };

        let cached = CachedResponse {
            status: parts.status,
            headers: parts.headers.clone(),
            body: body.clone(),
        };
        self.gateway_service.cache().put(key, cached, ttl).await;

        let response = Response::from_parts(parts, AxumBody::from(body));
        with_cache_header(response, "MISS")
    }
}

/// Upstream response body holding the instance's connection slot.
///
/// The slot is released once the body reports its end or is dropped, so
/// least-connections sees responses that are still streaming.
struct LeasedBody {
    inner: AxumBody,
    lease: Option<EndpointLease>,
}

impl LeasedBody {
    fn wrap(inner: AxumBody, lease: EndpointLease) -> AxumBody {
        AxumBody::new(Self {
            inner,
            lease: Some(lease),
        })
    }
}

impl HttpBody for LeasedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        if let Poll::Ready(None) = polled {
            self.lease = None;
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn cached_response(cached: CachedResponse) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(cached.body));
    *response.status_mut() = cached.status;
    *response.headers_mut() = cached.headers;
    with_cache_header(response, "HIT")
}

fn with_cache_header(mut response: Response<AxumBody>, value: &'static str) -> Response<AxumBody> {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(value));
    response
}

/// Append the client to `x-forwarded-for` and fill in host, proto and request id.
fn add_forwarding_headers(
    headers: &mut HeaderMap,
    client_addr: Option<SocketAddr>,
    request_id: &str,
) {
    if let Some(addr) = client_addr {
        let client_ip = addr.ip().to_string();
        let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing}, {client_ip}"),
            _ => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = headers.get(header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }
    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
}

impl IntoResponse for RoutingError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let mut response = (status, Json(self.body())).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
        }
        response
    }
}

/// Fallback handler proxying every non-admin request.
pub async fn proxy_handler(
    State(router): State<GatewayRouter>,
    req: Request<AxumBody>,
) -> Response<AxumBody> {
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    router.handle_request(req, client_addr).await
}
