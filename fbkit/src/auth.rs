//! Authorization endpoint the gate redirects to. It forwards the browser to
//! the OAuth dialog with the requested permissions as scope.

use crate::config::FacebookConfig;
use crate::credential::PermissionSet;
use crate::headers::no_cache_redirect;
use crate::middleware::absolute_uri;
use crate::state::FacebookState;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use http::{HeaderMap, Uri};
use log::debug;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct AuthParams {
    /// Where to land once authorized
    pub next: Option<String>,
    /// Comma-separated permissions to ask for
    pub required_permissions: Option<String>,
}

/// Router serving the configured `auth_url` path
pub fn router(config: &FacebookConfig) -> Router<FacebookState> {
    route_at(&config.auth_url)
}

fn route_at(auth_url: &str) -> Router<FacebookState> {
    let path = auth_url
        .split(['?', '#'])
        .next()
        .filter(|path| path.starts_with('/'))
        .unwrap_or("/facebook/auth/");
    Router::new().route(path, get(authorize))
}

async fn authorize(
    State(state): State<FacebookState>,
    Query(params): Query<AuthParams>,
    headers: HeaderMap,
) -> Response {
    let next = match params.next.filter(|next| !next.is_empty()) {
        Some(next) => next,
        None => absolute_uri(&Uri::from_static("/"), &headers),
    };
    let scope = params
        .required_permissions
        .as_deref()
        .map(PermissionSet::from_csv)
        .unwrap_or_default();

    debug!("Sending browser to the OAuth dialog, next={}", next);
    let location = state.facebook().login_url(&next, false, Some(&scope));
    no_cache_redirect(&location)
}
