use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use nsdb_core::auth::{self, AuthLevel, Credentials};

use super::{AppState, PathComponents};

pub const CHALLENGE: &str = "Basic realm=\"nsdb\", charset=\"UTF-8\"";

/// Who sent the request, as resolved by [`require_auth`].
#[derive(Clone, Debug)]
pub struct Caller {
    pub username: String,
    pub level: AuthLevel,
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, CHALLENGE)],
        "Authentication required",
    )
        .into_response()
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "Invalid credentials").into_response()
}

/// Credentials from the `Authorization` header.
///
/// `Ok(None)` when the header is absent, `Err` when it is present but not
/// valid Basic credentials.
fn credentials(headers: &HeaderMap) -> Result<Option<Credentials>, ()> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| ())?;
    Credentials::from_basic(value).map(Some).ok_or(())
}

/// Middleware resolving Basic credentials to a [`Caller`].
///
/// The namespace for namespace-user lookups is the third path segment.
pub async fn require_auth(
    State(state): State<AppState>,
    components: PathComponents,
    mut request: Request,
    next: Next,
) -> Response {
    let creds = match credentials(request.headers()) {
        Ok(Some(creds)) => creds,
        Ok(None) => return unauthorized(),
        Err(()) => return forbidden(),
    };

    let level = {
        let db = state.dispatcher.database().read();
        auth::resolve(&db, &creds, components.namespace())
    };
    if level == AuthLevel::None {
        tracing::debug!(user = %creds.username, "rejected credentials");
        return forbidden();
    }

    request.extensions_mut().insert(Caller {
        username: creds.username,
        level,
    });
    next.run(request).await
}
