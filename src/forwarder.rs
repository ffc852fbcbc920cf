//! Proxy Forwarder (§4.H): the circuit-breaker-gated upstream call. Never
//! fails over to another backend by design; the goal is latency fidelity
//! for the chosen target, not at-any-cost availability (§7).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_ENCODING;
use hyper::{Body, Client, HeaderMap, Request, Response, StatusCode, Uri};
use tracing::warn;

use crate::error::ForwardError;
use crate::hooks::{RequestRewriter, ResponseRewriter};
use crate::http_client::{TimedBody, TimedBodyError};
use crate::registry::BackendRegistry;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Counts a request's outcome against a single backend's consecutive-
/// failure budget, independent of every other forward in flight.
#[derive(Clone)]
struct FailureTracker {
    registry: Arc<BackendRegistry>,
    failures: Arc<Mutex<HashMap<String, u32>>>,
    threshold: u32,
    url: String,
}

impl FailureTracker {
    fn record_success(&self) {
        self.failures.lock().unwrap().remove(&self.url);
    }

    fn record_failure(&self) {
        let count = {
            let mut failures = self.failures.lock().unwrap();
            let count = failures.entry(self.url.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if count >= self.threshold {
            self.registry.mark_unhealthy(&self.url);
            warn!(url = %self.url, "backend marked unhealthy after consecutive forward failures");
        }
    }
}

/// The response body type `forward()` hands back: either a short, fully
/// buffered body for a locally generated error response, or the upstream
/// response streamed straight through with a read-timeout budget (§4.H
/// step 4: "streaming the body"). The outcome-based failure accounting for
/// the streamed case settles once, when the body stream actually reaches
/// its end or errors — not up front — since the body may not be fully
/// drained until long after `forward()` itself returns.
pub struct ForwardBody(Repr);

enum Repr {
    Full(Option<Bytes>),
    Streamed(StreamedBody),
}

struct StreamedBody {
    inner: TimedBody,
    tracker: FailureTracker,
    status_is_failure: bool,
    settled: bool,
}

impl StreamedBody {
    fn settle(&mut self, body_errored: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        if body_errored || self.status_is_failure {
            self.tracker.record_failure();
        } else {
            self.tracker.record_success();
        }
    }
}

impl ForwardBody {
    pub fn full(body: impl Into<Bytes>) -> Self {
        ForwardBody(Repr::Full(Some(body.into())))
    }

    fn streamed(inner: TimedBody, tracker: FailureTracker, status_is_failure: bool) -> Self {
        ForwardBody(Repr::Streamed(StreamedBody { inner, tracker, status_is_failure, settled: false }))
    }
}

impl HttpBody for ForwardBody {
    type Data = Bytes;
    type Error = TimedBodyError;

    fn poll_data(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        match &mut self.get_mut().0 {
            Repr::Full(bytes) => Poll::Ready(bytes.take().map(Ok)),
            Repr::Streamed(streamed) => {
                let poll = Pin::new(&mut streamed.inner).poll_data(cx);
                match &poll {
                    Poll::Ready(Some(Err(_))) => streamed.settle(true),
                    Poll::Ready(None) => streamed.settle(false),
                    _ => {}
                }
                poll
            }
        }
    }

    fn poll_trailers(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        match &mut self.get_mut().0 {
            Repr::Full(_) => Poll::Ready(Ok(None)),
            Repr::Streamed(streamed) => {
                let poll = Pin::new(&mut streamed.inner).poll_trailers(cx);
                if let Poll::Ready(Err(_)) = &poll {
                    streamed.settle(true);
                }
                poll
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.0 {
            Repr::Full(bytes) => bytes.is_none(),
            Repr::Streamed(streamed) => streamed.inner.is_end_stream(),
        }
    }
}

pub struct ProxyForwarder {
    client: Client<HttpConnector>,
    registry: Arc<BackendRegistry>,
    consecutive_failure_threshold: u32,
    failures: Arc<Mutex<HashMap<String, u32>>>,
    request_rewriter: Box<dyn RequestRewriter>,
    response_rewriter: Box<dyn ResponseRewriter>,
}

impl ProxyForwarder {
    pub fn new(
        client: Client<HttpConnector>,
        registry: Arc<BackendRegistry>,
        consecutive_failure_threshold: u32,
        request_rewriter: Box<dyn RequestRewriter>,
        response_rewriter: Box<dyn ResponseRewriter>,
    ) -> Self {
        Self {
            client,
            registry,
            consecutive_failure_threshold,
            failures: Arc::new(Mutex::new(HashMap::new())),
            request_rewriter,
            response_rewriter,
        }
    }

    fn tracker(&self, url: &str) -> FailureTracker {
        FailureTracker {
            registry: self.registry.clone(),
            failures: self.failures.clone(),
            threshold: self.consecutive_failure_threshold,
            url: url.to_string(),
        }
    }

    /// Rewrites `request`'s URI to point at `backend_url` + the original
    /// path/query, gates on health, issues the call, and maps the outcome
    /// to an HTTP response per §4.H / §7.
    pub async fn forward(
        &self,
        mut request: Request<Body>,
        path_and_query: &str,
        backend_url: &str,
    ) -> Response<ForwardBody> {
        if backend_url.is_empty() {
            return error_response(ForwardError::NoBackend);
        }

        if !self.registry.is_healthy(backend_url) {
            return error_response(ForwardError::GateRejected);
        }

        let target = format!("{backend_url}{path_and_query}");
        let uri: Uri = match target.parse() {
            Ok(u) => u,
            Err(_) => return error_response(ForwardError::Upstream("invalid backend URL".to_string())),
        };
        *request.uri_mut() = uri;

        self.request_rewriter.rewrite(&mut request);

        let tracker = self.tracker(backend_url);

        match self.call_with_timeouts(request).await {
            Ok(response) => {
                let status_is_failure = response.status().as_u16() >= 500;
                let (mut parts, body) = response.into_parts();
                parts.headers.remove(CONTENT_ENCODING);
                let timed = TimedBody::new(body, READ_TIMEOUT);
                let mut response =
                    Response::from_parts(parts, ForwardBody::streamed(timed, tracker, status_is_failure));
                self.response_rewriter.rewrite(&mut response);
                response
            }
            Err(err) => {
                tracker.record_failure();
                error_response(err)
            }
        }
    }

    /// Issues the request under the connect timeout and returns as soon as
    /// headers arrive, without reading any of the body. The body's own
    /// read-timeout budget is applied separately by `forward()` via
    /// [`TimedBody`], once the body is actually streamed out.
    async fn call_with_timeouts(&self, request: Request<Body>) -> Result<Response<Body>, ForwardError> {
        tokio::time::timeout(CONNECT_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| ForwardError::Timeout)?
            .map_err(|e| ForwardError::Upstream(e.to_string()))
    }
}

/// Maps the §7 error taxonomy onto the HTTP status codes spec.md §4.H and
/// §7 prescribe for each class.
fn error_response(err: ForwardError) -> Response<ForwardBody> {
    let (status, body): (StatusCode, String) = match &err {
        ForwardError::NoBackend => (StatusCode::SERVICE_UNAVAILABLE, "No backend servers registered.".to_string()),
        ForwardError::GateRejected => (StatusCode::SERVICE_UNAVAILABLE, "Backend temporarily unavailable.".to_string()),
        ForwardError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "Upstream request timed out.".to_string()),
        ForwardError::Upstream(_) => (StatusCode::BAD_GATEWAY, "Upstream request failed.".to_string()),
    };
    Response::builder().status(status).body(ForwardBody::full(body)).expect("static status response is always valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Identity;
    use crate::wire::RegisterRequest;
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use hyper::service::{make_service_fn, service_fn};
    use hyper::Server;

    async fn spawn_upstream(status: u16, body: &'static str) -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let make_svc = make_service_fn(move |_conn| async move {
            Ok::<_, Infallible>(service_fn(move |_req| async move {
                Ok::<_, Infallible>(Response::builder().status(status).body(Body::from(body)).unwrap())
            }))
        });
        let server = Server::bind(&addr).serve(make_svc);
        let bound_addr = server.local_addr();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let graceful = server.with_graceful_shutdown(async { rx.await.ok(); });
            let _ = graceful.await;
        });
        (bound_addr, tx)
    }

    fn forwarder(registry: Arc<BackendRegistry>) -> ProxyForwarder {
        ProxyForwarder::new(
            Client::new(),
            registry,
            3,
            Box::new(Identity),
            Box::new(Identity),
        )
    }

    fn register(registry: &Arc<BackendRegistry>, url: &str) {
        registry
            .register(RegisterRequest {
                url: url.to_string(),
                port: None,
                health: true,
                in_flight_requests: None,
                rif_avg_latency: None,
                overall_avg_latency: None,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn empty_backend_url_returns_503_without_upstream_call() {
        let registry = Arc::new(BackendRegistry::new(Duration::from_secs(60)));
        let fwd = forwarder(registry);
        let request = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let response = fwd.forward(request, "/x", "").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn gate_rejects_unhealthy_backend_without_upstream_call() {
        let registry = Arc::new(BackendRegistry::new(Duration::from_secs(60)));
        let fwd = forwarder(registry);
        let request = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let response = fwd.forward(request, "/x", "http://127.0.0.1:1").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn successful_upstream_call_strips_content_encoding() {
        let (addr, _shutdown) = spawn_upstream(200, "hello").await;
        let url = format!("http://{addr}");
        let registry = Arc::new(BackendRegistry::new(Duration::from_secs(60)));
        register(&registry, &url);
        let fwd = forwarder(registry);
        let request = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let response = fwd.forward(request, "/x", &url).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn response_body_is_forwarded_as_a_stream_not_buffered_up_front() {
        // Upstream sends headers and a first chunk, then stalls for longer
        // than this test's own timeout. `forward()` must return as soon as
        // headers arrive rather than waiting on the full (stalled) body,
        // proving the body isn't buffered before being handed back.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                use tokio::io::AsyncWriteExt;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n")
                    .await;
                tokio::time::sleep(Duration::from_secs(2)).await;
                let _ = socket.write_all(b"0\r\n\r\n").await;
            }
        });

        let url = format!("http://{addr}");
        let registry = Arc::new(BackendRegistry::new(Duration::from_secs(60)));
        register(&registry, &url);
        let fwd = forwarder(registry);
        let request = Request::builder().uri("/x").body(Body::empty()).unwrap();

        let response = tokio::time::timeout(Duration::from_millis(500), fwd.forward(request, "/x", &url))
            .await
            .expect("forward() must return once headers arrive, not wait for the full stalled body");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sustained_5xx_marks_backend_unhealthy() {
        let (addr, _shutdown) = spawn_upstream(500, "oops").await;
        let url = format!("http://{addr}");
        let registry = Arc::new(BackendRegistry::new(Duration::from_secs(60)));
        register(&registry, &url);
        let fwd = forwarder(registry);
        for _ in 0..3 {
            let request = Request::builder().uri("/x").body(Body::empty()).unwrap();
            let response = fwd.forward(request, "/x", &url).await;
            // Draining the body is what actually settles the failure
            // count, mirroring the real server driving a response to
            // completion as it writes it out to the client.
            let _ = hyper::body::to_bytes(response.into_body()).await;
        }
        assert!(!registry.is_healthy(&url));
    }
}
