//! Facebook OAuth session handling and remote API bindings for axum
//! applications.
//!
//! [`middleware::facebook_middleware`] restores the user's credential on every
//! request, [`gate::require_oauth`] guards handlers that need an authorized
//! user and [`client::Facebook`] talks to the remote API on their behalf.

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod credential;
pub mod errors;
pub mod gate;
pub mod headers;
pub mod middleware;
pub mod session;
pub mod signature;
pub mod state;
#[cfg(test)]
mod test_utils;

pub use client::{Facebook, FacebookError, Namespace};
pub use config::FacebookConfig;
pub use credential::{Credential, PermissionSet};
pub use errors::ApiError;
pub use gate::{require_oauth, RequireOAuth};
pub use middleware::facebook_middleware;
pub use session::Session;
pub use state::FacebookState;
