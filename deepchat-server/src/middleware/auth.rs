use axum::{
    body::Body,
    extract::{Request, State},
    http::{self, header},
    middleware::Next,
    response::Response,
};
use cookie::Cookie;
use tracing::warn;

use crate::{app_state::AppState, middleware::request_context::RequestContext};

/// Resolves the session cookie into the request context.
///
/// This middleware never rejects: field validation runs before the session
/// check in the chat contract, so handlers enforce authentication themselves
/// via [`RequestContext`].
pub async fn resolve_session(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let cookie_name = &state.config.session.cookie_name;
    let session = match extract_session_cookie(request.headers(), cookie_name) {
        Some(token) => match state.sessions.resolve(&token).await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "session resolution failed");
                None
            }
        },
        None => None,
    };

    if let Some(context) = request.extensions_mut().get_mut::<RequestContext>() {
        context.session = session;
    } else {
        request.extensions_mut().insert(RequestContext {
            request_id: String::new(),
            session,
        });
    }

    next.run(request).await
}

fn extract_session_cookie(headers: &http::HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(header::COOKIE)?.to_str().ok()?;
    Cookie::split_parse(value)
        .flatten()
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}
