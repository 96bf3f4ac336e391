// Pluggable request handling plus the guard decorator.
use async_trait::async_trait;
use courier_wire::{Request, Response};
use std::future::Future;

/// Error codes carried by failed responses.
pub const BAD_REQUEST: i32 = 400;
pub const UNAUTHORIZED: i32 = 401;
pub const FORBIDDEN: i32 = 403;
pub const NOT_FOUND: i32 = 404;
pub const INTERNAL: i32 = 500;

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{message}")]
    Failed { code: i32, message: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn code(&self) -> i32 {
        match self {
            Self::BadRequest(_) => BAD_REQUEST,
            Self::Unauthorized(_) => UNAUTHORIZED,
            Self::Forbidden(_) => FORBIDDEN,
            Self::NotFound(_) => NOT_FOUND,
            Self::Failed { code, .. } => *code,
            Self::Internal(_) => INTERNAL,
        }
    }

    /// Failed terminal response for `request`.
    pub fn into_response(self, request: &Request) -> Response {
        Response::failure(request.correlation_id().clone(), self.code(), self.to_string())
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: &Request) -> Result<Response, HandlerError>;
}

/// Handler built from an async closure; the closure receives its own copy of
/// the request.
///
/// ```
/// use courier_rpc::{RequestHandler, handler_fn};
/// use courier_wire::{Body, Request, Response};
///
/// let handler = handler_fn(|request: Request| async move {
///     Ok(Response::ok(request.correlation_id().clone(), Body::text("echo", "pong")))
/// });
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// let response = rt
///     .block_on(handler.handle(&Request::builder().correlation_id("abc").build()))
///     .expect("handle");
/// assert_eq!(response.body().as_str(), Some("pong"));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        (self.0)(request.clone()).await
    }
}

/// Admission check run before the wrapped handler.
pub trait Guard: Send + Sync + 'static {
    fn check(&self, request: &Request) -> Result<(), HandlerError>;
}

impl<F> Guard for F
where
    F: Fn(&Request) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn check(&self, request: &Request) -> Result<(), HandlerError> {
        self(request)
    }
}

/// Runs `guard` before `inner`; a rejected request never reaches `inner`.
pub struct Guarded<H, G> {
    inner: H,
    guard: G,
}

impl<H, G> Guarded<H, G> {
    pub fn new(inner: H, guard: G) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl<H, G> RequestHandler for Guarded<H, G>
where
    H: RequestHandler,
    G: Guard,
{
    async fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        if let Err(err) = self.guard.check(request) {
            metrics::counter!("courier_rpc_requests_rejected_total").increment(1);
            tracing::debug!(
                correlation_id = %request.correlation_id(),
                error = %err,
                "request rejected by guard"
            );
            return Err(err);
        }
        self.inner.handle(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_wire::Body;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl RequestHandler for Counting {
        async fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Response::ok(
                request.correlation_id().clone(),
                Body::text("echo", "ok"),
            ))
        }
    }

    fn require_key(request: &Request) -> Result<(), HandlerError> {
        match request.partition_key() {
            Some(_) => Ok(()),
            None => Err(HandlerError::Unauthorized("missing key".into())),
        }
    }

    #[tokio::test]
    async fn guard_blocks_before_inner_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Guarded::new(Counting(calls.clone()), require_key);

        let rejected = handler
            .handle(&Request::builder().correlation_id("a").build())
            .await
            .expect_err("rejected");
        assert_eq!(rejected.code(), UNAUTHORIZED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handler
            .handle(&Request::builder().correlation_id("b").partition_key("k").build())
            .await
            .expect("accepted");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_becomes_failed_response() {
        let request = Request::builder().correlation_id("abc").build();
        let response = HandlerError::NotFound("device D1".into()).into_response(&request);
        assert!(response.is_failed());
        assert!(response.is_last());
        assert_eq!(response.error_code(), NOT_FOUND);
        assert_eq!(response.correlation_id().as_str(), "abc");
        assert_eq!(response.body().as_str(), Some("not found: device D1"));
    }

    #[test]
    fn internal_errors_map_to_500() {
        let err = HandlerError::from(anyhow::anyhow!("db down"));
        assert_eq!(err.code(), INTERNAL);
        assert_eq!(err.to_string(), "db down");
    }
}
