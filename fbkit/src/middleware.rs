//! Per-request OAuth lifecycle.
//!
//! Before the handler: restore the credential from the session bag, then let
//! inbound authorization data replace it (`code` > `signed_request` >
//! `session`). After the handler: write the credential back and persist the
//! bag.

use crate::client::Facebook;
use crate::credential::{Credential, SavedCredential, CREDENTIAL_KEY, PERMISSIONS_KEY};
use crate::errors::ApiError;
use crate::headers::no_cache_redirect;
use crate::session::Session;
use crate::signature::{verify_legacy_session, verify_signed_request};
use crate::state::FacebookState;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, Method, StatusCode, Uri};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use url::form_urlencoded;

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Authorization data carried by the request itself
#[derive(Debug, PartialEq)]
enum InboundAuth {
    Code(String),
    SignedRequest(String),
    LegacySession(String),
    Absent,
}

impl InboundAuth {
    /// `code` is only read from the query string, the signed payloads from
    /// the form body first and then the query string
    fn from_params(query: &HashMap<String, String>, form: &HashMap<String, String>) -> Self {
        if let Some(code) = query.get("code").filter(|code| !code.is_empty()) {
            return InboundAuth::Code(code.clone());
        }

        let param = |name: &str| {
            form.get(name)
                .or_else(|| query.get(name))
                .filter(|value| !value.is_empty())
                .cloned()
        };
        if let Some(signed_request) = param("signed_request") {
            InboundAuth::SignedRequest(signed_request)
        } else if let Some(session) = param("session") {
            InboundAuth::LegacySession(session)
        } else {
            InboundAuth::Absent
        }
    }
}

/// Attaches a [`Facebook`] client and the [`Session`] to every request.
///
/// Install with `axum::middleware::from_fn_with_state` ahead of every route
/// that uses fbkit, including the ones guarded by
/// [`require_oauth`](crate::gate::require_oauth).
pub async fn facebook_middleware(
    State(state): State<FacebookState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    let cookie_name = &state.config.session.cookie_name;
    let mut session = state
        .sessions
        .load(jar.get(cookie_name).map(Cookie::value))
        .await;
    let facebook = state.facebook();

    debug!("Restoring oauth data from the saved session");
    let saved = session.get::<SavedCredential>(CREDENTIAL_KEY).await;
    let restored = Credential::load(saved.as_ref());
    let restored_token = restored.token.clone();
    facebook.set_credential(restored).await;

    let (parts, body) = request.into_parts();
    let query = parse_params(parts.uri.query().unwrap_or_default().as_bytes());

    let (body, form) = if needs_form(&parts.method, &parts.headers, &query, state.config.max_form_bytes)
    {
        match to_bytes(body, state.config.max_form_bytes).await {
            Ok(bytes) => {
                let form = parse_params(&bytes);
                (Body::from(bytes), form)
            }
            Err(e) => {
                warn!("Failed to read form body: {}", e);
                return ApiError::new("Request body too large", StatusCode::PAYLOAD_TOO_LARGE)
                    .into_response();
            }
        }
    } else {
        (body, HashMap::new())
    };

    let response = match InboundAuth::from_params(&query, &form) {
        InboundAuth::Code(code) => {
            let response = exchange_code(&facebook, &parts.uri, &parts.headers, &code).await;
            session = rotate_on_new_token(&state, session, &facebook, &restored_token).await;
            response
        }
        inbound => {
            load_signed_payload(&facebook, &state.config.app_secret, inbound).await;
            session = rotate_on_new_token(&state, session, &facebook, &restored_token).await;
            resolve_uid(&facebook).await;

            let mut request = Request::from_parts(parts, body);
            request.extensions_mut().insert(facebook.clone());
            request.extensions_mut().insert(session.clone());
            next.run(request).await
        }
    };

    save_session(&state, &session, &facebook, jar, response).await
}

/// A stored session that receives a different token moves to a fresh id, so
/// an id known before login never carries the new token
async fn rotate_on_new_token(
    state: &FacebookState,
    session: Session,
    facebook: &Facebook,
    previous: &Option<String>,
) -> Session {
    let token = facebook.credential().await.token;
    if session.is_new() || token.is_none() || token == *previous {
        return session;
    }
    state.sessions.rotate(&session).await
}

/// Trade the code for a token and send the browser back to the same URL
/// without the code
async fn exchange_code(facebook: &Facebook, uri: &Uri, headers: &HeaderMap, code: &str) -> Response {
    let current = absolute_uri_without(uri, headers, &["code"]);
    let redirect_uri = facebook.canvas_redirect_uri(&current);

    debug!("Exchanging oauth code for an access token");
    match facebook.exchange_code(code, &redirect_uri).await {
        Ok(_) => {
            info!("Obtained an access token from an authorization code");
            no_cache_redirect(&redirect_uri)
        }
        Err(e) => {
            error!("Failed to exchange authorization code: {}", e);
            e.into_response()
        }
    }
}

async fn load_signed_payload(facebook: &Facebook, secret: &str, inbound: InboundAuth) {
    let verified = match inbound {
        InboundAuth::SignedRequest(signed_request) => {
            debug!("Loading oauth data from signed_request");
            verify_signed_request(&signed_request, secret)
        }
        InboundAuth::LegacySession(session) => {
            debug!("Loading oauth data from session parameter");
            verify_legacy_session(&session, secret)
        }
        InboundAuth::Code(_) | InboundAuth::Absent => return,
    };

    match verified {
        Ok(payload) => {
            facebook
                .set_credential(Credential::from_signed_payload(&payload))
                .await
        }
        Err(e) => {
            warn!("Ignoring signed payload: {}", e);
            facebook.clear().await;
        }
    }
}

/// A token without a known owner gets its user id from the Graph API
async fn resolve_uid(facebook: &Facebook) {
    let credential = facebook.credential().await;
    if credential.uid.is_some() || !credential.is_valid() {
        return;
    }
    match facebook.resolve_uid().await {
        Ok(uid) => debug!("Resolved Facebook user {}", uid),
        Err(e) => warn!("Failed to resolve Facebook user id: {}", e),
    }
}

async fn save_session(
    state: &FacebookState,
    session: &Session,
    facebook: &Facebook,
    jar: CookieJar,
    response: Response,
) -> Response {
    debug!("Saving oauth data to session");
    let credential = facebook.credential().await;
    if credential.is_empty() {
        session.remove(CREDENTIAL_KEY).await;
    } else if let Err(e) = session.insert(CREDENTIAL_KEY, &credential.save()).await {
        error!("Failed to store credential in session: {}", e);
    }
    if facebook.token_revoked() {
        session.remove(PERMISSIONS_KEY).await;
    }

    if let Err(e) = state.sessions.save(session).await {
        error!("Failed to save session: {}", e);
        return response;
    }
    if !session.is_new() || session.snapshot().await.is_empty() {
        return response;
    }

    let config = &state.config.session;
    let same_site = if config.cookie_secure {
        // Canvas pages are framed by the network, which needs a cross-site cookie
        SameSite::None
    } else {
        SameSite::Lax
    };
    let cookie = Cookie::build((config.cookie_name.clone(), session.id().to_string()))
        .path("/")
        .http_only(true)
        .secure(config.cookie_secure)
        .same_site(same_site);
    (jar.add(cookie), response).into_response()
}

/// Absolute URL of the request as the browser sees it
pub fn absolute_uri(uri: &Uri, headers: &HeaderMap) -> String {
    absolute_uri_without(uri, headers, &[])
}

fn absolute_uri_without(uri: &Uri, headers: &HeaderMap, dropped: &[&str]) -> String {
    let scheme = headers
        .get(FORWARDED_PROTO)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.scheme_str())
        .unwrap_or("http");
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.authority().map(|authority| authority.as_str()))
        .unwrap_or("localhost");

    let mut url = format!("{scheme}://{host}{}", uri.path());
    let Some(query) = uri.query().filter(|query| !query.is_empty()) else {
        return url;
    };

    if dropped.is_empty() {
        url.push('?');
        url.push_str(query);
        return url;
    }

    let kept: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .filter(|(key, _)| !dropped.contains(&key.as_str()))
        .collect();
    if !kept.is_empty() {
        url.push('?');
        url.push_str(
            &form_urlencoded::Serializer::new(String::new())
                .extend_pairs(kept)
                .finish(),
        );
    }
    url
}

/// Whether the form body has to be read to find the signed payload.
///
/// Not when the query string already decides, nor when the declared length
/// exceeds `limit`; such bodies are left to the handler.
fn needs_form(
    method: &Method,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    limit: usize,
) -> bool {
    if ["code", "signed_request", "session"]
        .iter()
        .any(|name| query.get(*name).is_some_and(|value| !value.is_empty()))
    {
        return false;
    }
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|length| length > limit) {
        debug!("Not inspecting form body of {:?} bytes", declared);
        return false;
    }
    *method == Method::POST
        && headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

fn parse_params(input: &[u8]) -> HashMap<String, String> {
    form_urlencoded::parse(input).into_owned().collect()
}
