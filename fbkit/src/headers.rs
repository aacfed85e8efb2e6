//! Cache headers for responses that must never be replayed from a cache,
//! mainly the authorization redirects.

use crate::errors::ApiError;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use http::header::{CACHE_CONTROL, EXPIRES, LOCATION, PRAGMA};
use http::StatusCode;
use log::warn;

/// Cache-Control directives
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub private: bool,
    pub max_age: Option<u32>,
}

impl CacheControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn no_store(mut self) -> Self {
        self.no_store = true;
        self
    }

    pub fn must_revalidate(mut self) -> Self {
        self.must_revalidate = true;
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn to_header_value(&self) -> HeaderValue {
        let mut parts = Vec::new();

        if self.no_cache {
            parts.push("no-cache".to_string());
        }
        if self.no_store {
            parts.push("no-store".to_string());
        }
        if self.must_revalidate {
            parts.push("must-revalidate".to_string());
        }
        if self.private {
            parts.push("private".to_string());
        }
        if let Some(max_age) = self.max_age {
            parts.push(format!("max-age={max_age}"));
        }

        HeaderValue::from_str(&parts.join(", ")).unwrap_or(HeaderValue::from_static(""))
    }
}

/// Cache-Control, Pragma and Expires applied together
#[derive(Debug, Clone, Default)]
pub struct CacheHeaders {
    cache_control: CacheControl,
    expires: Option<DateTime<Utc>>,
}

impl CacheHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_control(mut self, cache_control: CacheControl) -> Self {
        self.cache_control = cache_control;
        self
    }

    pub fn expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn apply<B>(&self, response: &mut axum::response::Response<B>) {
        let headers = response.headers_mut();
        headers.insert(CACHE_CONTROL, self.cache_control.to_header_value());

        if self.cache_control.no_cache {
            headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        }

        match self.expires {
            Some(expires) => match HeaderValue::from_str(&expires.to_rfc2822()) {
                Ok(value) => {
                    headers.insert(EXPIRES, value);
                }
                Err(e) => warn!("failed to set expires header: {e}"),
            },
            None if self.cache_control.no_store || self.cache_control.no_cache => {
                headers.insert(EXPIRES, HeaderValue::from_static("0"));
            }
            None => {}
        }
    }
}

pub mod presets {
    use super::*;
    use chrono::Duration;

    /// No caching allowed, expiry set in the past
    pub fn no_cache() -> CacheHeaders {
        CacheHeaders::new()
            .cache_control(CacheControl::new().no_cache().no_store().must_revalidate())
            .expires(Utc::now() - Duration::hours(1))
    }

    /// Per-user page, never shared between browsers
    pub fn private_page() -> CacheHeaders {
        CacheHeaders::new().cache_control(CacheControl::new().private().max_age(0))
    }
}

/// `302 Found` to `location` carrying the no-cache preset.
pub fn no_cache_redirect(location: &str) -> Response {
    let value = match HeaderValue::from_str(location) {
        Ok(value) => value,
        Err(e) => {
            warn!("refusing to redirect to invalid location {location:?}: {e}");
            return ApiError::internal("Invalid redirect location").into_response();
        }
    };
    let mut response = (StatusCode::FOUND, [(LOCATION, value)]).into_response();
    presets::no_cache().apply(&mut response);
    response
}
