//! Server-side session bag.
//!
//! Every browser gets an opaque id in a cookie. The bag itself is a JSON map
//! kept in the configured [`Cache`] under `fbkit_session:{id}` and shared
//! between the middleware, the gate and the handler of one request.

use crate::cache::{Cache, CacheBackend, CacheError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::{debug, warn};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

const SESSION_KEY_PREFIX: &str = "fbkit_session";

/// Random bytes in a session id before encoding
const SESSION_ID_BYTES: usize = 32;

/// Encoded length of a session id
const SESSION_ID_LEN: usize = (SESSION_ID_BYTES * 4).div_ceil(3);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to encode session value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to persist session: {0}")]
    Store(#[from] CacheError),
}

/// Key/value content of one browser session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionBag(HashMap<String, Value>);

impl SessionBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed read. A value that no longer decodes as `T` reads as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.0.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!("Ignoring undecodable session value under '{key}': {e}");
                None
            }
        }
    }

    pub fn insert<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), SessionError> {
        self.0.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.0.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Handle on the session of the current request.
///
/// Clones share the same bag, so a change made by a handler is what the
/// middleware persists once the response is produced.
#[derive(Debug, Clone)]
pub struct Session {
    id: Arc<str>,
    is_new: bool,
    bag: Arc<RwLock<SessionBag>>,
}

impl Session {
    fn new(id: String, is_new: bool, bag: SessionBag) -> Self {
        Self {
            id: id.into(),
            is_new,
            bag: Arc::new(RwLock::new(bag)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the id was minted for this request and still has to reach the
    /// browser
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.bag.read().await.get(key)
    }

    pub async fn insert<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SessionError> {
        self.bag.write().await.insert(key, value)
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.bag.write().await.remove(key)
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.bag.read().await.contains(key)
    }

    /// Copy of the current content
    pub async fn snapshot(&self) -> SessionBag {
        self.bag.read().await.clone()
    }
}

/// Loads and persists session bags in the configured cache backend
#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<Cache>,
}

impl SessionStore {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    /// Load the session identified by the cookie value.
    ///
    /// Unknown, expired or malformed ids start a fresh session under a new id.
    /// Store failures are logged and also yield a fresh session.
    pub async fn load(&self, id: Option<&str>) -> Session {
        let Some(id) = id.filter(|id| is_well_formed(id)) else {
            return self.fresh();
        };

        match self.cache.get::<SessionBag>(&storage_key(id)).await {
            Ok(Some(bag)) => {
                debug!("Restored session {}", redact(id));
                Session::new(id.to_string(), false, bag)
            }
            Ok(None) => {
                debug!("Session {} not found, starting a new one", redact(id));
                self.fresh()
            }
            Err(e) => {
                warn!("Failed to load session {}: {e}", redact(id));
                self.fresh()
            }
        }
    }

    /// Persist the bag. An empty bag of a session that never reached the
    /// browser is not stored.
    pub async fn save(&self, session: &Session) -> Result<(), SessionError> {
        let bag = session.snapshot().await;
        if bag.is_empty() && session.is_new() {
            return Ok(());
        }
        self.cache.set(&storage_key(session.id()), &bag).await?;
        Ok(())
    }

    /// Move the bag of `session` under a fresh id and drop the old entry.
    ///
    /// The returned session counts as new, so its id is sent to the browser
    /// once saved.
    pub async fn rotate(&self, session: &Session) -> Session {
        let rotated = Session::new(generate_session_id(), true, session.snapshot().await);
        if !session.is_new() {
            if let Err(e) = self.cache.delete(&storage_key(session.id())).await {
                warn!("Failed to drop rotated session {}: {e}", redact(session.id()));
            }
        }
        debug!(
            "Rotated session {} to {}",
            redact(session.id()),
            redact(rotated.id())
        );
        rotated
    }

    /// Forget a session entirely
    pub async fn delete(&self, session: &Session) -> Result<(), SessionError> {
        self.cache.delete(&storage_key(session.id())).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), String> {
        self.cache.health_check().await
    }

    fn fresh(&self) -> Session {
        Session::new(generate_session_id(), true, SessionBag::new())
    }
}

/// New random session id, URL-safe base64 without padding
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn storage_key(id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}:{id}")
}

fn is_well_formed(id: &str) -> bool {
    id.len() == SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn redact(id: &str) -> String {
    format!("{}…", &id[..id.len().min(6)])
}
