//! Request-path adapter.
//!
//! Parses the inbound segmentation cookie into a per-request
//! [`VaryContext`], exposes it to handlers through request extensions, and
//! fires the headers boundary exactly once when the inner service returns.
//! Handlers reach the context with the usual extension extractor:
//!
//! ```ignore
//! async fn handler(Extension(vary): Extension<SharedVaryContext>) -> impl IntoResponse {
//!     vary.lock().unwrap().register_group("beta")?;
//!     // ...
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    body::Body,
    extract::State,
    http::{Request, header::COOKIE},
    middleware::Next,
    response::Response,
};
use tracing::{instrument, warn};

use crate::context::VaryContext;
use crate::state::VaryState;

/// The per-request context as carried in request extensions.
///
/// The host dispatches one request per execution context, so the mutex sees
/// no contention; it exists to move the context across await points.
pub type SharedVaryContext = Arc<Mutex<VaryContext>>;

/// Middleware layering the segmentation engine onto a router.
///
/// Install with `axum::middleware::from_fn_with_state(state, vary_cache_layer)`.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn vary_cache_layer(
    State(vary): State<VaryState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let cookie_header = request
        .headers()
        .get(COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let context: SharedVaryContext = Arc::new(Mutex::new(
        vary.context_from_cookie_header(cookie_header.as_deref()),
    ));
    request.extensions_mut().insert(context.clone());

    let mut response = next.run(request).await;

    // The boundary event: response headers are about to be sent.
    lock_context(&context).emit_headers(response.headers_mut(), &vary);
    response
}

fn lock_context(context: &SharedVaryContext) -> MutexGuard<'_, VaryContext> {
    match context.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "a handler panicked while holding the segmentation context",
                "Recovered from poisoned segmentation context lock"
            );
            poisoned.into_inner()
        }
    }
}
