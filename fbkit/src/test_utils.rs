use crate::cache::memory::InMemoryCache;
use crate::cache::Cache;
use crate::config::FacebookConfig;
use crate::credential::{Credential, PermissionSet, CREDENTIAL_KEY, PERMISSIONS_KEY};
use crate::middleware::facebook_middleware;
use crate::session::Session;
use crate::state::FacebookState;
use axum::body::Body;
use axum::{middleware, Router};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION, SET_COOKIE};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::BodyExt;
use log::LevelFilter;
use serde::Serialize;
use serde_json::Value;
use tower::ServiceExt;
use url::form_urlencoded;
use wiremock::matchers;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Test fixture wiring a router behind [`facebook_middleware`] with a mocked
/// Facebook API.
///
/// The Graph and REST hosts are both served by `facebook_mock`. Sessions live
/// in an in-memory store, so tests can seed a session, send a request with its
/// cookie and inspect what the middleware persisted afterwards.
///
/// # Examples
///
/// ```rust
/// #[tokio::test]
/// async fn test_endpoint() {
///     let fixture = TestFixture::new(Router::new().route("/", get(handler))).await;
///
///     fixture
///         .add_facebook_mock(Method::GET, "/me", json!({"id": "42"}), StatusCode::OK, 1)
///         .await;
///
///     let cookie = fixture.seed_session(&Credential::from_token("tok", None)).await;
///     let response = fixture.get("/", Some(&cookie)).await;
///
///     response.assert_ok();
/// }
/// ```
pub struct TestFixture {
    /// The application router, middleware included
    pub app: Router,
    /// State shared with the application
    pub state: FacebookState,
    /// Mock server for the Graph and REST APIs
    pub facebook_mock: MockServer,
}

impl TestFixture {
    /// Application secret of the test configuration
    pub const SECRET: &'static str = "1ab476e5962c119b61a819e692feff77";

    /// Host every test request is addressed to
    pub const HOST: &'static str = "testserver";

    /// Creates a fixture serving `routes` with the default test configuration.
    pub async fn new(routes: Router<FacebookState>) -> Self {
        Self::with_config(routes, |_| {}).await
    }

    /// Creates a fixture after letting `customize` adjust the configuration.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let fixture = TestFixture::with_config(routes(), |config| {
    ///     config.app_name = Some("fbsample".to_string());
    /// })
    /// .await;
    /// ```
    pub async fn with_config(
        routes: Router<FacebookState>,
        customize: impl FnOnce(&mut FacebookConfig),
    ) -> Self {
        Self::setup_logger(LevelFilter::Debug);

        let facebook_mock = MockServer::start().await;
        let mut config = FacebookConfig::for_test_with_mocks(&facebook_mock);
        customize(&mut config);

        let cache = InMemoryCache::new(config.session.ttl, 16)
            .expect("Failed to create in-memory session store");
        let state = FacebookState::with_cache(config, Cache::InMemory(cache))
            .expect("Failed to create test state");

        let app = routes
            .layer(middleware::from_fn_with_state(
                state.clone(),
                facebook_middleware,
            ))
            .with_state(state.clone());

        Self {
            app,
            state,
            facebook_mock,
        }
    }

    /// Initializes the test logger. Called by the constructors.
    pub fn setup_logger(level: LevelFilter) {
        let _ = env_logger::builder()
            .filter_level(level)
            .is_test(true)
            .try_init();
    }

    /// Builds a GET request for the test host, optionally carrying a cookie
    /// header such as `fbkit_session=...`.
    pub fn request(uri: &str, cookie: Option<&str>) -> Request<Body> {
        Self::request_builder(Method::GET, uri, cookie)
            .body(Body::empty())
            .expect("Failed to build request")
    }

    fn request_builder(method: Method, uri: &str, cookie: Option<&str>) -> http::request::Builder {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, Self::HOST);
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        builder
    }

    /// Sends a GET request to the specified URI.
    pub async fn get(&self, uri: &str, cookie: Option<&str>) -> TestResponse {
        self.send(Self::request(uri, cookie)).await
    }

    /// Sends a POST request with a urlencoded form body.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let response = fixture
    ///     .post_form("/", &[("language", "Rust")], Some(&cookie))
    ///     .await;
    /// ```
    pub async fn post_form(
        &self,
        uri: &str,
        fields: &[(&str, &str)],
        cookie: Option<&str>,
    ) -> TestResponse {
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        let request = Self::request_builder(Method::POST, uri, cookie)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .expect("Failed to build request");

        self.send(request).await
    }

    /// Sends a request through the fixture's application.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let mut response = Self::send_to(&self.app, request).await;
        response.cookie_name = self.state.config.session.cookie_name.clone();
        response
    }

    /// Sends a request through any router and collects the response.
    pub async fn send_to(app: &Router, request: Request<Body>) -> TestResponse {
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read response body")
            .to_bytes();
        let body = String::from_utf8_lossy(&bytes).into_owned();

        // Try to parse as JSON, defaulting to empty object if parsing fails or empty body
        let json = if !bytes.is_empty() {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        TestResponse {
            status,
            headers,
            body,
            json,
            cookie_name: String::new(),
        }
    }

    /// Stores a session holding `credential` and returns the matching cookie
    /// header value.
    pub async fn seed_session(&self, credential: &Credential) -> String {
        self.seed(credential, None).await
    }

    /// Like [`seed_session`](Self::seed_session), with a cached permission set.
    pub async fn seed_session_with_permissions(
        &self,
        credential: &Credential,
        permissions: &PermissionSet,
    ) -> String {
        self.seed(credential, Some(permissions)).await
    }

    async fn seed(&self, credential: &Credential, permissions: Option<&PermissionSet>) -> String {
        let session = self.state.sessions.load(None).await;
        session
            .insert(CREDENTIAL_KEY, &credential.save())
            .await
            .expect("Failed to store credential");
        if let Some(permissions) = permissions {
            session
                .insert(PERMISSIONS_KEY, permissions)
                .await
                .expect("Failed to store permissions");
        }
        self.state
            .sessions
            .save(&session)
            .await
            .expect("Failed to save session");

        format!("{}={}", self.state.config.session.cookie_name, session.id())
    }

    /// Loads the stored session with the given id.
    ///
    /// # Panics
    ///
    /// Panics if no such session is stored.
    pub async fn session(&self, id: &str) -> Session {
        let session = self.state.sessions.load(Some(id)).await;
        assert!(!session.is_new(), "Session {id} is not stored");
        session
    }

    /// Session id of a `name=id` cookie header value
    pub fn cookie_value(cookie: &str) -> &str {
        cookie.split_once('=').map(|(_, id)| id).unwrap_or(cookie)
    }

    /// Adds a Facebook API mock with the given method, path, and JSON response.
    ///
    /// # Parameters
    ///
    /// - `method`: The HTTP method (e.g., Method::POST)
    /// - `path`: The API path to mock (e.g., "/method/fql.query")
    /// - `response_body`: The JSON response body to return
    /// - `status_code`: HTTP status code for the response
    /// - `expected_calls`: Number of expected calls to this mock
    ///
    /// # Examples
    ///
    /// ```rust
    /// fixture.add_facebook_mock(
    ///     Method::GET,
    ///     "/me",
    ///     json!({"id": "42"}),
    ///     StatusCode::OK,
    ///     1
    /// ).await;
    /// ```
    pub async fn add_facebook_mock(
        &self,
        method: Method,
        path: impl Into<String>,
        response_body: impl Serialize,
        status_code: StatusCode,
        expected_calls: u64,
    ) {
        Mock::given(matchers::method(method.as_str()))
            .and(matchers::path(path.into()))
            .respond_with(ResponseTemplate::new(status_code.as_u16()).set_body_json(response_body))
            .expect(expected_calls)
            .mount(&self.facebook_mock)
            .await;
    }

    /// Adds a mock that only matches when every pair of `query` is present in
    /// the query string, answering with a raw text body.
    pub async fn add_facebook_mock_with_query(
        &self,
        method: Method,
        path: impl Into<String>,
        query: &[(&str, &str)],
        response_body: &str,
        status_code: StatusCode,
        expected_calls: u64,
    ) {
        let mut mock = Mock::given(matchers::method(method.as_str()))
            .and(matchers::path(path.into()));
        for (key, value) in query {
            mock = mock.and(matchers::query_param(*key, *value));
        }
        mock.respond_with(
            ResponseTemplate::new(status_code.as_u16()).set_body_string(response_body),
        )
        .expect(expected_calls)
        .mount(&self.facebook_mock)
        .await;
    }

    /// Adds a mock that only matches when the request body contains
    /// `body_fragment`, such as one urlencoded form pair.
    pub async fn add_facebook_mock_with_body(
        &self,
        method: Method,
        path: impl Into<String>,
        body_fragment: &str,
        response_body: impl Serialize,
        status_code: StatusCode,
        expected_calls: u64,
    ) {
        Mock::given(matchers::method(method.as_str()))
            .and(matchers::path(path.into()))
            .and(matchers::body_string_contains(body_fragment))
            .respond_with(ResponseTemplate::new(status_code.as_u16()).set_body_json(response_body))
            .expect(expected_calls)
            .mount(&self.facebook_mock)
            .await;
    }
}

/// Response from a test request with convenient access to status, headers
/// and body.
pub struct TestResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Raw body as text
    pub body: String,
    /// Response body as JSON (if present and valid JSON)
    pub json: Value,
    cookie_name: String,
}

impl TestResponse {
    /// Asserts that the response has the expected status code.
    ///
    /// # Panics
    ///
    /// Panics if the status code doesn't match the expected value.
    pub fn assert_status(&self, expected: StatusCode) -> &Self {
        assert_eq!(
            self.status, expected,
            "Expected status {} but got {} with body: {}",
            expected, self.status, self.body
        );
        self
    }

    /// Asserts that the response status is OK (200).
    pub fn assert_ok(&self) -> &Self {
        self.assert_status(StatusCode::OK)
    }

    /// Asserts a 302 redirect and returns its target.
    pub fn assert_redirect(&self) -> String {
        self.assert_status(StatusCode::FOUND);
        self.headers
            .get(LOCATION)
            .expect("Redirect without Location header")
            .to_str()
            .expect("Location header is not ASCII")
            .to_string()
    }

    /// Session id set by the response, if any
    pub fn session_cookie(&self) -> Option<String> {
        let prefix = format!("{}=", self.cookie_name);
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|value| value.strip_prefix(prefix.as_str()))
            .map(|rest| rest.split(';').next().unwrap_or_default().to_string())
    }
}
