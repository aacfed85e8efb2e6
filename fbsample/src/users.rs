//! Users of the canvas page and their favorite language

use fbkit::Credential;
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

pub const DEFAULT_LANGUAGE: &str = "Python";

/// Longest favorite language kept, in characters
pub const MAX_LANGUAGE_CHARS: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum RemoteIdError {
    #[error("No Facebook user id available")]
    Missing,
    #[error("Invalid Facebook user id: {0:?}")]
    Invalid(String),
}

/// Anything that knows the remote user id as text
pub trait RemoteIdSource {
    fn raw_remote_id(&self) -> Option<&str>;
}

impl RemoteIdSource for Credential {
    fn raw_remote_id(&self) -> Option<&str> {
        self.uid.as_deref()
    }
}

impl RemoteIdSource for HashMap<String, String> {
    fn raw_remote_id(&self) -> Option<&str> {
        self.get("uid").map(String::as_str)
    }
}

/// Numeric remote user id of `source`. The literal `None` reads as 0.
pub fn remote_id<S: RemoteIdSource + ?Sized>(source: &S) -> Result<i64, RemoteIdError> {
    let raw = source.raw_remote_id().ok_or(RemoteIdError::Missing)?.trim();
    if raw == "None" {
        return Ok(0);
    }
    raw.parse()
        .map_err(|_| RemoteIdError::Invalid(raw.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteUser {
    pub id: i64,
    pub favorite_language: String,
}

impl RemoteUser {
    fn new(id: i64) -> Self {
        Self {
            id,
            favorite_language: DEFAULT_LANGUAGE.to_string(),
        }
    }
}

/// In-process user table keyed by remote user id
#[derive(Debug, Clone, Default)]
pub struct UserStore {
    users: Arc<RwLock<HashMap<i64, RemoteUser>>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The user with `id`, created with the default language on first sight
    pub async fn get_or_create(&self, id: i64) -> RemoteUser {
        if let Some(user) = self.users.read().await.get(&id) {
            return user.clone();
        }
        self.users
            .write()
            .await
            .entry(id)
            .or_insert_with(|| {
                info!("New user {}", id);
                RemoteUser::new(id)
            })
            .clone()
    }

    /// Store a new favorite language, keeping only its first characters
    pub async fn set_language(&self, id: i64, language: &str) -> RemoteUser {
        let language: String = language.chars().take(MAX_LANGUAGE_CHARS).collect();
        let mut users = self.users.write().await;
        let user = users.entry(id).or_insert_with(|| RemoteUser::new(id));
        user.favorite_language = language;
        user.clone()
    }
}
