//! Credential and permission state carried across requests in the session bag

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Session bag key holding the saved credential
pub const CREDENTIAL_KEY: &str = "facebook";

/// Session bag key holding the cached permission set
pub const PERMISSIONS_KEY: &str = "oauth2_extended_permissions";

/// OAuth credential of the current user, scoped to one browser session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    /// OAuth access token
    pub token: Option<String>,
    /// Token expiry as a unix timestamp; `None` means the token never expires
    pub expires_at: Option<i64>,
    /// Legacy REST session key
    pub session_key: Option<String>,
    /// Remote user id owning the token
    pub uid: Option<String>,
}

/// Flat form of a [`Credential`] as stored in the session bag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedCredential {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
}

impl Credential {
    /// Rebuild a credential from a previously saved one. No saved state yields
    /// an empty credential.
    pub fn load(saved: Option<&SavedCredential>) -> Self {
        let mut credential = Self::default();
        if let Some(saved) = saved {
            credential.restore(saved);
        }
        credential
    }

    /// Overlay saved state onto this credential.
    ///
    /// Token, expiry and session key are only taken when the saved state holds
    /// an access token; the user id is taken whenever present.
    pub fn restore(&mut self, saved: &SavedCredential) {
        if let Some(token) = &saved.access_token {
            self.token = Some(token.clone());
            self.expires_at = saved.expires;
            self.session_key = saved.session_key.clone();
        }
        if let Some(uid) = &saved.uid {
            self.uid = Some(uid.clone());
        }
    }

    /// Flatten the credential for storage
    pub fn save(&self) -> SavedCredential {
        match &self.token {
            Some(token) => SavedCredential {
                access_token: Some(token.clone()),
                expires: self.expires_at,
                session_key: self.session_key.clone(),
                uid: self.uid.clone(),
            },
            None => SavedCredential {
                uid: self.uid.clone(),
                ..Default::default()
            },
        }
    }

    /// Build a credential from a freshly issued token. `expires_in` is relative
    /// to now; zero, absent or past the representable range means the token
    /// does not expire.
    pub fn from_token(token: impl Into<String>, expires_in: Option<i64>) -> Self {
        Self {
            token: Some(token.into()),
            expires_at: expires_in
                .filter(|secs| *secs > 0)
                .and_then(|secs| Utc::now().timestamp().checked_add(secs)),
            ..Default::default()
        }
    }

    /// Build a credential from a verified `signed_request` or legacy `session`
    /// payload.
    pub fn from_signed_payload(payload: &Map<String, Value>) -> Self {
        let saved = SavedCredential {
            access_token: string_field(payload, &["oauth_token", "access_token"]),
            expires: int_field(payload, "expires").filter(|expires| *expires > 0),
            session_key: string_field(payload, &["session_key"]),
            uid: string_field(payload, &["user_id", "uid"]),
        };
        Self::load(Some(&saved))
    }

    /// Whether the credential holds a token that is still usable at `now`
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.token.is_some() && self.expires_at.is_none_or(|expires| expires > now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now().timestamp())
    }

    /// Whether a token is present but past its expiry at `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.token.is_some() && !self.is_valid_at(now)
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.uid.is_none()
    }
}

fn string_field(payload: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find_map(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn int_field(payload: &Map<String, Value>, key: &str) -> Option<i64> {
    match payload.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extended permissions believed granted to the current user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-separated permission list, ignoring blanks
    pub fn from_csv(csv: &str) -> Self {
        csv.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Collect the permissions granted in one row of the `permissions` FQL
    /// table. A permission is granted when its value equals 1.
    pub fn from_fql_row(row: &Map<String, Value>) -> Self {
        row.iter()
            .filter(|(_, allowed)| is_granted(allowed))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Whether every permission in `required` is present in this set
    pub fn satisfies(&self, required: &PermissionSet) -> bool {
        required.0.is_subset(&self.0)
    }

    pub fn contains(&self, permission: &str) -> bool {
        self.0.contains(permission)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_csv(&self) -> String {
        self.iter().collect::<Vec<_>>().join(",")
    }
}

impl<S: Into<String>> FromIterator<S> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

// FQL returns 1/0 flags, but some endpoints answer with strings or booleans
fn is_granted(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_i64() == Some(1) || n.as_f64() == Some(1.0),
        Value::String(s) => s.trim() == "1",
        Value::Bool(b) => *b,
        _ => false,
    }
}
