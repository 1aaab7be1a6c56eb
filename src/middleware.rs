//! axum middleware adapter.
//!
//! Wraps a [`Limiter`] as `tower`/`axum` middleware: on admission, the
//! downstream handler runs and the [`Completion`] guard records the
//! request's latency when it falls out of scope; on rejection, the
//! pipeline short-circuits with `429 Too Many Requests`.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::bbr::Limiter;

/// `axum::middleware::from_fn_with_state`-compatible handler. Mount with:
///
/// ```ignore
/// let limiter = Limiter::new()?;
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(axum::middleware::from_fn_with_state(limiter, admission_control));
/// ```
pub async fn admission_control(
    State(limiter): State<Arc<Limiter>>,
    request: Request,
    next: Next,
) -> Response {
    match limiter.allow() {
        Ok(completion) => {
            let response = next.run(request).await;
            drop(completion);
            response
        }
        Err(rejected) => {
            tracing::debug!(in_flight = limiter.in_flight(), "shedding request");
            rejected.into_response()
        }
    }
}
