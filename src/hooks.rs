//! Request/response rewrite hooks (§9 design note: the source loads these
//! by string module name at runtime; here they are a fixed trait registered
//! at startup instead, no dynamic dispatch by name).

use hyper::{Body, Request, Response};

use crate::forwarder::ForwardBody;

/// Invoked before the forwarder issues the upstream call. May rewrite the
/// request in place (e.g. path rewriting, header injection).
pub trait RequestRewriter: Send + Sync {
    fn rewrite(&self, request: &mut Request<Body>);
}

/// Invoked after the upstream response is received, before it is returned
/// to the client. Operates on headers/status only — the body is streamed
/// through independently and is not available to rewrite here.
pub trait ResponseRewriter: Send + Sync {
    fn rewrite(&self, response: &mut Response<ForwardBody>);
}

/// No-op default used when no hooks are configured.
pub struct Identity;

impl RequestRewriter for Identity {
    fn rewrite(&self, _request: &mut Request<Body>) {}
}

impl ResponseRewriter for Identity {
    fn rewrite(&self, _response: &mut Response<ForwardBody>) {}
}
