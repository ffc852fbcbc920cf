//! Shared upstream HTTP client. A single pooled `hyper::Client` is used for
//! both probes and forwarded requests; callers must not mutate it (§5).

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::{Body, Client, HeaderMap, Request, Response, Uri};
use tokio::time::Sleep;

pub type SharedClient = Client<HttpConnector>;

pub fn new_client() -> SharedClient {
    Client::builder().pool_idle_timeout(Duration::from_secs(90)).build_http()
}

#[derive(Debug)]
pub enum ClientError {
    Timeout,
    Request(hyper::Error),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Timeout => write!(f, "request timed out"),
            ClientError::Request(e) => write!(f, "request error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// A `hyper::Body` wrapped with a single deadline that applies to every
/// remaining poll, rather than a `tokio::time::timeout` wrapped around a
/// one-shot full-body read. Lets a body be forwarded (or consumed) chunk
/// by chunk as it arrives while still enforcing an overall read budget.
pub struct TimedBody {
    inner: Body,
    deadline: Pin<Box<Sleep>>,
}

impl TimedBody {
    pub fn new(inner: Body, timeout: Duration) -> Self {
        Self { inner, deadline: Box::pin(tokio::time::sleep(timeout)) }
    }
}

#[derive(Debug)]
pub enum TimedBodyError {
    Timeout,
    Upstream(hyper::Error),
}

impl std::fmt::Display for TimedBodyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimedBodyError::Timeout => write!(f, "body read timed out"),
            TimedBodyError::Upstream(e) => write!(f, "upstream body error: {e}"),
        }
    }
}

impl std::error::Error for TimedBodyError {}

impl HttpBody for TimedBody {
    type Data = Bytes;
    type Error = TimedBodyError;

    fn poll_data(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        let this = self.get_mut();
        if this.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(TimedBodyError::Timeout)));
        }
        match Pin::new(&mut this.inner).poll_data(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(TimedBodyError::Upstream(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_trailers(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_trailers(cx).map_err(TimedBodyError::Upstream)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }
}

/// Issues a GET request against `uri` under one overall deadline covering
/// both the header read and the body read (§4.E: "within 5s"). The
/// deadline is enforced by [`TimedBody`] as the body is actually read,
/// not by wrapping a one-shot full-buffer read in a timeout.
pub async fn get_with_timeout(
    client: &SharedClient,
    uri: Uri,
    timeout: Duration,
) -> Result<(Response<()>, Bytes), ClientError> {
    let started = Instant::now();
    let req = Request::get(uri)
        .body(Body::empty())
        .expect("GET request with empty body is always valid");

    let response = tokio::time::timeout(timeout, client.request(req))
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(ClientError::Request)?;

    let (parts, body) = response.into_parts();
    let remaining = timeout.saturating_sub(started.elapsed());
    let timed = TimedBody::new(body, remaining);
    let body_bytes = hyper::body::to_bytes(timed).await.map_err(|e| match e {
        TimedBodyError::Timeout => ClientError::Timeout,
        TimedBodyError::Upstream(e) => ClientError::Request(e),
    })?;

    Ok((Response::from_parts(parts, ()), body_bytes))
}
