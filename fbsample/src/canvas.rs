use crate::users::{remote_id, RemoteIdError, RemoteUser, UserStore};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Form, Json, Router};
use fbkit::headers::presets;
use fbkit::{ApiError, Facebook};
use log::debug;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error(transparent)]
    RemoteId(#[from] RemoteIdError),
}

impl IntoResponse for CanvasError {
    fn into_response(self) -> Response {
        match self {
            CanvasError::RemoteId(e) => ApiError::bad_request(e).into_response(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LanguageForm {
    pub language: Option<String>,
}

/// Canvas page routes. Both need the OAuth gate in front of them.
pub fn router(users: UserStore) -> Router {
    Router::new()
        .route("/", get(show).post(update))
        .with_state(users)
}

async fn current_user(users: &UserStore, facebook: &Facebook) -> Result<RemoteUser, CanvasError> {
    let id = remote_id(&facebook.credential().await)?;
    Ok(users.get_or_create(id).await)
}

fn private(user: RemoteUser) -> Response {
    let mut response = Json(user).into_response();
    presets::private_page().apply(&mut response);
    response
}

async fn show(
    State(users): State<UserStore>,
    Extension(facebook): Extension<Facebook>,
) -> Result<Response, CanvasError> {
    Ok(private(current_user(&users, &facebook).await?))
}

async fn update(
    State(users): State<UserStore>,
    Extension(facebook): Extension<Facebook>,
    Form(form): Form<LanguageForm>,
) -> Result<Response, CanvasError> {
    let user = current_user(&users, &facebook).await?;
    let Some(language) = form.language else {
        return Ok(private(user));
    };

    debug!("User {} now prefers {}", user.id, language);
    Ok(private(users.set_language(user.id, &language).await))
}
