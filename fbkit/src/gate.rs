//! Gate for handlers that need an authorized user.
//!
//! ```ignore
//! let gate = RequireOAuth::from_config(&state.config);
//! Router::new()
//!     .route("/", get(canvas))
//!     .route_layer(middleware::from_fn_with_state(gate, require_oauth))
//!     .layer(middleware::from_fn_with_state(state.clone(), facebook_middleware))
//! ```

use crate::client::{Facebook, FacebookError};
use crate::config::FacebookConfig;
use crate::credential::{Credential, PermissionSet, CREDENTIAL_KEY, PERMISSIONS_KEY};
use crate::errors::ApiError;
use crate::headers::no_cache_redirect;
use crate::middleware::absolute_uri;
use crate::session::Session;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why the gate sent the browser to the authorization endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequired {
    /// No token at all
    NoSession,
    /// The stored token is past its expiry
    TokenExpired,
    /// The remote API rejected the token
    TokenRevoked,
    /// The token lacks a required permission
    PermissionDenied,
}

impl fmt::Display for AuthRequired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthRequired::NoSession => "no session",
            AuthRequired::TokenExpired => "token expired",
            AuthRequired::TokenRevoked => "token revoked",
            AuthRequired::PermissionDenied => "permission denied",
        })
    }
}

/// Outcome of a failed [`RequireOAuth::check`]
#[derive(Debug, Error)]
pub enum GateError {
    /// The browser has to go through authorization again
    #[error("Authorization required: {0}")]
    AuthRequired(AuthRequired),
    /// The permission query failed for another reason
    #[error(transparent)]
    Remote(#[from] FacebookError),
}

impl From<AuthRequired> for GateError {
    fn from(reason: AuthRequired) -> Self {
        GateError::AuthRequired(reason)
    }
}

/// Requirements a request must meet to reach the guarded handler
#[derive(Debug, Clone, Default)]
pub struct RequireOAuth {
    /// Permissions the user must have granted
    pub required_permissions: PermissionSet,
    /// Permissions looked up alongside the required ones and cached, but not
    /// demanded
    pub additional_permissions: PermissionSet,
    /// Always query the remote API instead of trusting the cached set
    pub force_check: bool,
}

impl RequireOAuth {
    /// Require `required` permissions, checked live on every request
    pub fn new(required: PermissionSet) -> Self {
        Self {
            required_permissions: required,
            additional_permissions: PermissionSet::new(),
            force_check: true,
        }
    }

    /// Require the configured default permissions
    pub fn from_config(config: &FacebookConfig) -> Self {
        Self::new(config.default_permissions().into_iter().collect())
    }

    pub fn additional_permissions(mut self, additional: PermissionSet) -> Self {
        self.additional_permissions = additional;
        self
    }

    pub fn force_check(mut self, force_check: bool) -> Self {
        self.force_check = force_check;
        self
    }

    /// Decide whether the request may proceed.
    ///
    /// Expired credentials are dropped from the session and the client. A
    /// token rejected by the permission query is purged and reported as
    /// [`AuthRequired::TokenRevoked`].
    pub async fn check(&self, facebook: &Facebook, session: &Session) -> Result<(), GateError> {
        let credential = facebook.credential().await;
        let now = Utc::now().timestamp();

        if credential.is_expired_at(now) {
            info!("Stored access token has expired");
            session.remove(CREDENTIAL_KEY).await;
            facebook.clear().await;
            return Err(AuthRequired::TokenExpired.into());
        }
        if !credential.is_valid_at(now) {
            return Err(AuthRequired::NoSession.into());
        }
        if self.required_permissions.is_empty() {
            return Ok(());
        }

        match self.has_permissions(facebook, session, &credential).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthRequired::PermissionDenied.into()),
            Err(e) if e.is_invalid_token() => {
                purge(facebook, session).await;
                Err(AuthRequired::TokenRevoked.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has_permissions(
        &self,
        facebook: &Facebook,
        session: &Session,
        credential: &Credential,
    ) -> Result<bool, FacebookError> {
        if !self.force_check {
            let cached = session
                .get::<PermissionSet>(PERMISSIONS_KEY)
                .await
                .unwrap_or_default();
            if !cached.is_empty() && cached.satisfies(&self.required_permissions) {
                debug!("Cached permissions satisfy {}", self.required_permissions.to_csv());
                return Ok(true);
            }
        }

        let mut fields = self.required_permissions.to_csv();
        if !self.additional_permissions.is_empty() {
            fields.push(',');
            fields.push_str(&self.additional_permissions.to_csv());
        }
        debug!(
            "Checking permissions {} of user {:?}",
            fields, credential.uid
        );

        let Some(granted) = facebook.query_permissions(&fields).await? else {
            return Ok(false);
        };
        if let Err(e) = session.insert(PERMISSIONS_KEY, &granted).await {
            warn!("Failed to cache permissions in session: {}", e);
        }
        Ok(granted.satisfies(&self.required_permissions))
    }

    fn redirect(&self, facebook: &Facebook, next: &str, reason: AuthRequired) -> Response {
        let location = facebook.require_auth_url(Some(next), &self.required_permissions);
        info!("Authorization required ({}), redirecting to {}", reason, location);
        no_cache_redirect(&location)
    }
}

/// Forget everything known about the user's token
async fn purge(facebook: &Facebook, session: &Session) {
    session.remove(CREDENTIAL_KEY).await;
    session.remove(PERMISSIONS_KEY).await;
    facebook.clear().await;
}

/// Middleware guarding a handler with a [`RequireOAuth`].
///
/// Needs [`facebook_middleware`](crate::middleware::facebook_middleware) to
/// run first.
pub async fn require_oauth(
    State(gate): State<Arc<RequireOAuth>>,
    request: Request,
    next: Next,
) -> Response {
    let (Some(facebook), Some(session)) = (
        request.extensions().get::<Facebook>().cloned(),
        request.extensions().get::<Session>().cloned(),
    ) else {
        warn!("require_oauth used without facebook_middleware");
        return ApiError::internal("Facebook middleware is not installed").into_response();
    };
    let next_url = absolute_uri(request.uri(), request.headers());

    match gate.check(&facebook, &session).await {
        Ok(()) => {}
        Err(GateError::AuthRequired(reason)) => {
            return gate.redirect(&facebook, &next_url, reason)
        }
        Err(GateError::Remote(e)) => {
            warn!("Permission check failed: {}", e);
            return e.into_response();
        }
    }

    let response = next.run(request).await;

    // The handler may have found out that the token was revoked remotely
    if facebook.token_revoked() {
        purge(&facebook, &session).await;
        return gate.redirect(&facebook, &next_url, AuthRequired::TokenRevoked);
    }
    response
}
