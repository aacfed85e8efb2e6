//! Client for the remote REST, FQL and Graph APIs.
//!
//! A [`Facebook`] is built per request by the middleware and carries that
//! request's [`Credential`]. Clones share the credential, so a token obtained
//! or revoked while a handler runs is what gets saved afterwards.

use crate::config::FacebookConfig;
use crate::credential::{Credential, PermissionSet};
use crate::errors::ApiError;
use crate::signature::legacy_signature;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use log::{debug, warn};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use url::form_urlencoded;

/// Remote error code for an invalid, expired or revoked access token
pub const INVALID_TOKEN_CODE: i64 = 190;

const REST_API_VERSION: &str = "1.0";

/// Errors that can occur when calling the remote API
#[derive(Debug, Error)]
pub enum FacebookError {
    #[error("Facebook API error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("Failed to send request to Facebook: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Facebook request failed with status: {0}")]
    InvalidStatus(StatusCode),
    #[error("Failed to parse Facebook response: {0}")]
    Parse(String),
}

impl FacebookError {
    /// Remote error code, if the remote API reported one
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the remote API rejected the access token itself
    pub fn is_invalid_token(&self) -> bool {
        self.code() == Some(INVALID_TOKEN_CODE)
    }
}

impl From<FacebookError> for ApiError {
    fn from(err: FacebookError) -> Self {
        match &err {
            FacebookError::Remote {
                code: INVALID_TOKEN_CODE,
                ..
            } => ApiError::unauthorized("Facebook session is no longer valid"),
            FacebookError::Remote { .. } => ApiError::bad_gateway(err.to_string()),
            FacebookError::Transport(_) => ApiError::bad_gateway("Failed to send request to Facebook"),
            FacebookError::InvalidStatus(status) => {
                ApiError::bad_gateway(format!("Facebook request failed with status: {}", status))
            }
            FacebookError::Parse(e) => {
                ApiError::bad_gateway(format!("Failed to parse Facebook response: {}", e))
            }
        }
    }
}

impl IntoResponse for FacebookError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

/// Remote method namespaces of the REST API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Admin,
    Application,
    Auth,
    Comments,
    Connect,
    Dashboard,
    Data,
    Events,
    Fbml,
    Feed,
    Fql,
    Friends,
    Groups,
    Links,
    Livemessage,
    Marketplace,
    Notifications,
    Pages,
    Photos,
    Profile,
    Sms,
    Status,
    Stream,
    Users,
    Update,
    Video,
}

impl Namespace {
    pub const ALL: [Namespace; 26] = [
        Namespace::Admin,
        Namespace::Application,
        Namespace::Auth,
        Namespace::Comments,
        Namespace::Connect,
        Namespace::Dashboard,
        Namespace::Data,
        Namespace::Events,
        Namespace::Fbml,
        Namespace::Feed,
        Namespace::Fql,
        Namespace::Friends,
        Namespace::Groups,
        Namespace::Links,
        Namespace::Livemessage,
        Namespace::Marketplace,
        Namespace::Notifications,
        Namespace::Pages,
        Namespace::Photos,
        Namespace::Profile,
        Namespace::Sms,
        Namespace::Status,
        Namespace::Stream,
        Namespace::Users,
        Namespace::Update,
        Namespace::Video,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Admin => "admin",
            Namespace::Application => "application",
            Namespace::Auth => "auth",
            Namespace::Comments => "comments",
            Namespace::Connect => "connect",
            Namespace::Dashboard => "dashboard",
            Namespace::Data => "data",
            Namespace::Events => "events",
            Namespace::Fbml => "fbml",
            Namespace::Feed => "feed",
            Namespace::Fql => "fql",
            Namespace::Friends => "friends",
            Namespace::Groups => "groups",
            Namespace::Links => "links",
            Namespace::Livemessage => "livemessage",
            Namespace::Marketplace => "marketplace",
            Namespace::Notifications => "notifications",
            Namespace::Pages => "pages",
            Namespace::Photos => "photos",
            Namespace::Profile => "profile",
            Namespace::Sms => "sms",
            Namespace::Status => "status",
            Namespace::Stream => "stream",
            Namespace::Users => "users",
            Namespace::Update => "update",
            Namespace::Video => "video",
        }
    }

    // fbml markup methods still answer in XML
    fn answers_in_xml(self) -> bool {
        matches!(self, Namespace::Fbml)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("Unknown Facebook API namespace: {0}")]
pub struct UnknownNamespace(pub String);

impl FromStr for Namespace {
    type Err = UnknownNamespace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Namespace::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| UnknownNamespace(s.to_string()))
    }
}

/// Successful answer of a REST method call
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteResponse {
    Json(Value),
    /// Raw document returned by the XML namespace
    Xml(String),
}

impl RemoteResponse {
    pub fn into_json(self) -> Result<Value, FacebookError> {
        match self {
            RemoteResponse::Json(value) => Ok(value),
            RemoteResponse::Xml(_) => Err(FacebookError::Parse(
                "expected a JSON response, got XML".to_string(),
            )),
        }
    }
}

/// Remote API client bound to the credential of one request
#[derive(Clone)]
pub struct Facebook {
    inner: Arc<FacebookInner>,
}

struct FacebookInner {
    config: Arc<FacebookConfig>,
    http: reqwest::Client,
    credential: RwLock<Credential>,
    revoked: AtomicBool,
}

impl Facebook {
    pub fn new(config: Arc<FacebookConfig>, http: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(FacebookInner {
                config,
                http,
                credential: RwLock::new(Credential::default()),
                revoked: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &FacebookConfig {
        &self.inner.config
    }

    pub async fn credential(&self) -> Credential {
        self.inner.credential.read().await.clone()
    }

    pub async fn set_credential(&self, credential: Credential) {
        *self.inner.credential.write().await = credential;
    }

    pub async fn uid(&self) -> Option<String> {
        self.inner.credential.read().await.uid.clone()
    }

    /// Forget the credential
    pub async fn clear(&self) {
        self.set_credential(Credential::default()).await;
    }

    /// Whether a remote call rejected the token during this request
    pub fn token_revoked(&self) -> bool {
        self.inner.revoked.load(Ordering::SeqCst)
    }

    /// Call the REST method `{namespace}.{method}`.
    ///
    /// With a token the call is authenticated by `access_token`; without one
    /// it is signed with the application secret.
    pub async fn call<I, K, V>(
        &self,
        namespace: Namespace,
        method: &str,
        params: I,
    ) -> Result<RemoteResponse, FacebookError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut form: BTreeMap<String, String> = params
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        let format = if namespace.answers_in_xml() { "xml" } else { "json" };
        form.insert("method".to_string(), format!("{namespace}.{method}"));
        form.insert("format".to_string(), format.to_string());

        let credential = self.credential().await;
        match credential.token {
            Some(token) => {
                form.insert("access_token".to_string(), token);
            }
            None => {
                let config = self.config();
                form.insert("api_key".to_string(), config.app_id.clone());
                form.insert("v".to_string(), REST_API_VERSION.to_string());
                form.insert(
                    "call_id".to_string(),
                    Utc::now().timestamp_millis().to_string(),
                );
                if let Some(session_key) = credential.session_key {
                    form.insert("session_key".to_string(), session_key);
                }
                let sig = legacy_signature(form.iter(), &config.app_secret);
                form.insert("sig".to_string(), sig);
            }
        }

        let url = format!(
            "{}/method/{namespace}.{method}",
            self.config().api_url.trim_end_matches('/')
        );
        debug!("Calling Facebook method {namespace}.{method}");
        let request = self.inner.http.post(url).form(&form);

        let result = if namespace.answers_in_xml() {
            send_xml(request).await
        } else {
            send_json(request).await.map(RemoteResponse::Json)
        };
        self.observe(result).await
    }

    /// Run an FQL query and return its rows
    pub async fn fql_query(&self, query: &str) -> Result<Vec<Map<String, Value>>, FacebookError> {
        let rows = self
            .call(Namespace::Fql, "query", [("query", query)])
            .await?
            .into_json()?;

        Ok(match rows {
            Value::Array(rows) => rows
                .into_iter()
                .filter_map(|row| match row {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        })
    }

    /// Query the `permissions` table for the current user.
    ///
    /// `fields` is the comma-separated list of permissions to look up.
    /// Returns `None` when the query yields no row.
    pub async fn query_permissions(
        &self,
        fields: &str,
    ) -> Result<Option<PermissionSet>, FacebookError> {
        let uid = self.uid().await.unwrap_or_else(|| "me()".to_string());
        let rows = self
            .fql_query(&format!("select {fields} from permissions where uid={uid}"))
            .await?;
        Ok(rows.first().map(PermissionSet::from_fql_row))
    }

    /// GET a Graph API object
    pub async fn graph_get(&self, path: &str) -> Result<Value, FacebookError> {
        let url = format!("{}/{}", self.graph_base(), path.trim_start_matches('/'));
        let mut request = self.inner.http.get(url);
        if let Some(token) = self.credential().await.token {
            request = request.query(&[("access_token", token)]);
        }

        debug!("Fetching Graph object '{path}'");
        let result = send_json(request).await;
        self.observe(result).await
    }

    /// Look up the id of the token owner and store it in the credential
    pub async fn resolve_uid(&self) -> Result<String, FacebookError> {
        let me = self.graph_get("me").await?;
        let uid = match me.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(FacebookError::Parse(
                    "Graph 'me' object has no id".to_string(),
                ))
            }
        };
        self.inner.credential.write().await.uid = Some(uid.clone());
        Ok(uid)
    }

    /// Exchange an authorization code for an access token.
    ///
    /// The new credential replaces the current one; its user id is unknown
    /// until resolved.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Credential, FacebookError> {
        let config = self.config();
        let url = format!("{}/oauth/access_token", self.graph_base());
        let request = self.inner.http.get(url).query(&[
            ("client_id", config.app_id.as_str()),
            ("client_secret", config.app_secret.as_str()),
            ("redirect_uri", redirect_uri),
            ("code", code),
        ]);

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        let (token, expires_in) = parse_token_response(status, &body)?;

        let credential = Credential::from_token(token, expires_in);
        self.set_credential(credential.clone()).await;
        self.inner.revoked.store(false, Ordering::SeqCst);
        Ok(credential)
    }

    /// URL of the OAuth authorization dialog
    pub fn login_url(&self, next: &str, popup: bool, scope: Option<&PermissionSet>) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("redirect_uri", next);
        if popup {
            query.append_pair("display", "popup");
        }
        if let Some(scope) = scope.filter(|scope| !scope.is_empty()) {
            query.append_pair("scope", &scope.to_csv());
        }
        query.append_pair("client_id", &self.config().app_id);
        format!("{}/oauth/authorize?{}", self.graph_base(), query.finish())
    }

    /// URL of the application's authorization endpoint, carrying where to come
    /// back to and which permissions are needed. Any query already present in
    /// the configured URL is replaced.
    pub fn require_auth_url(&self, next: Option<&str>, required: &PermissionSet) -> String {
        let auth_url = &self.config().auth_url;
        let base = auth_url.split(['?', '#']).next().unwrap_or_default();

        let mut query = form_urlencoded::Serializer::new(String::new());
        if let Some(next) = next.filter(|next| !next.is_empty()) {
            query.append_pair("next", next);
        }
        if !required.is_empty() {
            query.append_pair("required_permissions", &required.to_csv());
        }
        let query = query.finish();

        if query.is_empty() {
            base.to_string()
        } else {
            format!("{base}?{query}")
        }
    }

    /// Where the browser should land after authorization: the canvas URL
    /// prefix is rewritten to the application's page on the network.
    pub fn canvas_redirect_uri(&self, url: &str) -> String {
        match self.config().canvas_url.as_deref().filter(|c| !c.is_empty()) {
            Some(canvas_url) => self.app_url(&url.replace(canvas_url, "")),
            None => url.to_string(),
        }
    }

    /// URL of `path` under the application's canvas page
    pub fn app_url(&self, path: &str) -> String {
        let config = self.config();
        format!(
            "{}/{}/{}",
            config.apps_url.trim_end_matches('/'),
            config.app_name.as_deref().unwrap_or_default(),
            path.trim_start_matches('/')
        )
    }

    fn graph_base(&self) -> &str {
        self.config().graph_url.trim_end_matches('/')
    }

    /// Drop the credential when the remote API rejected the token
    async fn observe<T>(&self, result: Result<T, FacebookError>) -> Result<T, FacebookError> {
        if let Err(e) = &result {
            if e.is_invalid_token() {
                warn!("Facebook rejected the access token, clearing credential: {e}");
                self.inner.revoked.store(true, Ordering::SeqCst);
                self.clear().await;
            }
        }
        result
    }
}

async fn send_json(request: RequestBuilder) -> Result<Value, FacebookError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    parse_json(status, &body)
}

async fn send_xml(request: RequestBuilder) -> Result<RemoteResponse, FacebookError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if let Some(error) = xml_element(&body, "error_response") {
        return Err(FacebookError::Remote {
            code: xml_element(error, "error_code")
                .and_then(|code| code.trim().parse().ok())
                .unwrap_or_default(),
            message: xml_element(error, "error_msg")
                .unwrap_or_default()
                .to_string(),
        });
    }
    if !status.is_success() {
        return Err(FacebookError::InvalidStatus(status));
    }
    Ok(RemoteResponse::Xml(body))
}

/// Parse a JSON body, turning error objects into [`FacebookError::Remote`]
fn parse_json(status: StatusCode, body: &str) -> Result<Value, FacebookError> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) if !status.is_success() => return Err(FacebookError::InvalidStatus(status)),
        Err(e) => return Err(FacebookError::Parse(e.to_string())),
    };

    if let Some(err) = remote_error(&value) {
        return Err(err);
    }
    if !status.is_success() {
        return Err(FacebookError::InvalidStatus(status));
    }
    Ok(value)
}

/// REST errors are flat `error_code`/`error_msg` pairs, Graph errors are
/// nested under `error`
fn remote_error(value: &Value) -> Option<FacebookError> {
    let object = value.as_object()?;

    if let Some(code) = object.get("error_code") {
        return Some(FacebookError::Remote {
            code: as_i64(code).unwrap_or_default(),
            message: string_or_default(object.get("error_msg")),
        });
    }

    let error = object.get("error")?;
    match error {
        Value::Object(error) => Some(FacebookError::Remote {
            code: error.get("code").and_then(as_i64).unwrap_or_default(),
            message: string_or_default(error.get("message")),
        }),
        Value::String(message) => Some(FacebookError::Remote {
            code: 0,
            message: message.clone(),
        }),
        _ => None,
    }
}

/// Token endpoint answers either JSON (`access_token`, `expires_in`) or a
/// form-encoded body (`access_token`, `expires`)
fn parse_token_response(
    status: StatusCode,
    body: &str,
) -> Result<(String, Option<i64>), FacebookError> {
    if body.trim_start().starts_with('{') {
        let value = parse_json(status, body)?;
        let token = value
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| FacebookError::Parse("token response has no access_token".to_string()))?;
        let expires = value
            .get("expires_in")
            .or_else(|| value.get("expires"))
            .and_then(as_i64);
        return Ok((token.to_string(), expires));
    }

    if !status.is_success() {
        return Err(FacebookError::InvalidStatus(status));
    }
    let fields: HashMap<String, String> = form_urlencoded::parse(body.trim().as_bytes())
        .into_owned()
        .collect();
    let token = fields
        .get("access_token")
        .filter(|token| !token.is_empty())
        .ok_or_else(|| FacebookError::Parse("token response has no access_token".to_string()))?;
    let expires = fields
        .get("expires")
        .or_else(|| fields.get("expires_in"))
        .and_then(|expires| expires.parse().ok());
    Ok((token.clone(), expires))
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_or_default(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn xml_element<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}
