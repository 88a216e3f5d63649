//! Test utilities for `bugdesk`.
//!
//! Shared by the unit tests and the integration tests under `tests/` so the
//! wiring of in-memory pipes, signed test tokens and the fake authorization
//! server lives in one place. The MCP client helpers panic on I/O failure;
//! they are only meant to drive tests.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{Form, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines},
    task::JoinHandle,
};
use url::Url;

use crate::{
    auth::{
        verify_challenge, BrowserLauncher, OAuthClient, OboExchanger, TokenValidator,
        ACCESS_TOKEN_TYPE, TOKEN_EXCHANGE_GRANT,
    },
    config::{AuthorizationConfig, DownstreamConfig, HttpConfig},
    error::{Error, Result},
    identity::{Identity, LaunchArgs},
    launcher::ServerSpawner,
    secret::Secret,
};

pub const TEST_AUDIENCE: &str = "urn:mcp:bug-reporter";
pub const TEST_CLIENT_ID: &str = "bugdesk-test";
pub const TEST_SIGNING_SECRET: &[u8] = b"bugdesk-test-signing-secret";
/// The authorization code the fake server hands out.
pub const AUTH_CODE: &str = "AUTH123";

/// Initialize a tracing subscriber for tests. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// HS256-sign arbitrary claims with the test secret.
pub fn sign_claims(claims: &Value) -> Result<String> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(TEST_SIGNING_SECRET),
    )
    .map_err(|e| Error::InternalError(format!("cannot sign test token: {e}")))
}

/// An access token for `user_id` scoped to `audience`. A negative `ttl_secs`
/// yields a token that has already expired.
pub fn access_token(user_id: &str, audience: &str, ttl_secs: i64) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    sign_claims(&json!({
        "sub": user_id,
        "aud": audience,
        "iat": now,
        "exp": now + ttl_secs,
        "scope": "issues:read issues:write",
    }))
}

pub fn test_validator() -> TokenValidator {
    TokenValidator::hs256(TEST_SIGNING_SECRET, TEST_AUDIENCE)
}

/// A validated identity for `user_id`, built the same way the server binary does.
pub fn test_identity(user_id: &str) -> Result<Identity> {
    let token = access_token(user_id, TEST_AUDIENCE, 600)?;
    Identity::establish(
        LaunchArgs::new(user_id, Secret::new(token)),
        &test_validator(),
    )
}

/// One side of an in-memory stdio pair speaking newline-delimited JSON.
pub struct TestClient {
    writer: Option<DuplexStream>,
    reader: TestReader,
}

/// The read half left after [`TestClient::close_write`].
pub struct TestReader {
    lines: Lines<BufReader<DuplexStream>>,
}

impl TestReader {
    /// Next message from the server, waiting at most five seconds.
    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a server message")
            .expect("read from server failed")
            .expect("server closed its output");
        serde_json::from_str(&line).expect("server wrote invalid JSON")
    }

    /// `true` once the server has closed its output.
    pub async fn at_eof(&mut self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line()).await,
            Ok(Ok(None))
        )
    }
}

impl TestClient {
    /// A client plus the `(reader, writer)` pair to hand to the server.
    pub fn pair() -> (Self, DuplexStream, DuplexStream) {
        let (server_reader, client_writer) = tokio::io::duplex(64 * 1024);
        let (client_reader, server_writer) = tokio::io::duplex(64 * 1024);
        let client = Self {
            writer: Some(client_writer),
            reader: TestReader {
                lines: BufReader::new(client_reader).lines(),
            },
        };
        (client, server_reader, server_writer)
    }

    pub async fn send(&mut self, message: Value) {
        self.send_raw(&message.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        let writer = self.writer.as_mut().expect("client output already closed");
        writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write to server failed");
        writer.flush().await.expect("flush to server failed");
    }

    pub async fn recv(&mut self) -> Value {
        self.reader.recv().await
    }

    pub async fn send_and_recv(&mut self, message: Value) -> Value {
        self.send(message).await;
        self.recv().await
    }

    pub async fn request(&mut self, id: i64, method: &str, params: Value) -> Value {
        self.send_and_recv(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await
    }

    /// Run the `initialize` handshake.
    pub async fn initialize(&mut self) -> Value {
        let response = self
            .request(
                0,
                "initialize",
                json!({
                    "protocolVersion": crate::schema::LATEST_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "bugdesk-tests", "version": "0.0.0"},
                }),
            )
            .await;
        self.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        response
    }

    pub async fn call_tool(&mut self, id: i64, name: &str, arguments: Value) -> Value {
        self.request(id, "tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }

    /// Close the client's output, as an IDE does when the session ends.
    pub fn close(&mut self) {
        self.writer = None;
    }

    pub fn close_write(self) -> TestReader {
        self.reader
    }
}

/// What `/token-exchange` does with the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    Issue,
    Deny,
    /// Hand back the subject token unchanged.
    Echo,
    Unavailable,
}

struct IssuedCode {
    challenge: String,
    redirect_uri: String,
}

struct FakeState {
    user_id: String,
    token_audience: String,
    access_token_override: Option<String>,
    issue_refresh_tokens: bool,
    rotate: bool,
    refresh_counter: usize,
    refresh_tokens: HashSet<String>,
    codes: HashMap<String, IssuedCode>,
    authorize_error: Option<(String, String)>,
    callback_state: Option<String>,
    exchange_mode: ExchangeMode,
    search_matches: Vec<(String, f64)>,
    search_failures: usize,
    authorize_requests: Vec<HashMap<String, String>>,
    token_grants: Vec<String>,
    exchange_requests: Vec<HashMap<String, String>>,
    search_tokens: Vec<String>,
}

impl FakeState {
    /// `R1`, `R2`, ... skipping any token that is currently live.
    fn next_refresh_token(&mut self) -> String {
        loop {
            self.refresh_counter += 1;
            let token = format!("R{}", self.refresh_counter);
            if self.refresh_tokens.insert(token.clone()) {
                return token;
            }
        }
    }

    fn access_token(&self) -> Result<String> {
        match &self.access_token_override {
            Some(token) => Ok(token.clone()),
            None => access_token(&self.user_id, &self.token_audience, 600),
        }
    }
}

type Shared = Arc<Mutex<FakeState>>;

fn lock(state: &Shared) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn oauth_error(status: StatusCode, error: &str, description: &str) -> Response {
    (
        status,
        Json(json!({"error": error, "error_description": description})),
    )
        .into_response()
}

/// An in-process authorization server with `/authorize`, `/token`,
/// `/token-exchange` and a downstream `/search` endpoint.
///
/// `/token` enforces PKCE, the redirect URI and the resource indicator, and
/// only honours refresh tokens it issued and has not revoked.
pub struct FakeAuthServer {
    base_url: Url,
    state: Shared,
    server: JoinHandle<()>,
}

impl FakeAuthServer {
    pub async fn start(user_id: &str) -> Result<Self> {
        let state: Shared = Arc::new(Mutex::new(FakeState {
            user_id: user_id.to_string(),
            token_audience: TEST_AUDIENCE.to_string(),
            access_token_override: None,
            issue_refresh_tokens: true,
            rotate: false,
            refresh_counter: 0,
            refresh_tokens: HashSet::new(),
            codes: HashMap::new(),
            authorize_error: None,
            callback_state: None,
            exchange_mode: ExchangeMode::Issue,
            search_matches: Vec::new(),
            search_failures: 0,
            authorize_requests: Vec::new(),
            token_grants: Vec::new(),
            exchange_requests: Vec::new(),
            search_tokens: Vec::new(),
        }));

        let app = Router::new()
            .route("/authorize", get(authorize))
            .route("/token", post(token))
            .route("/token-exchange", post(token_exchange))
            .route("/search", post(search))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let base_url = Url::parse(&format!("http://{addr}/"))
            .map_err(|e| Error::InternalError(e.to_string()))?;

        Ok(Self {
            base_url,
            state,
            server,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn authorization_config(&self) -> AuthorizationConfig {
        AuthorizationConfig {
            server_url: self.base_url.clone(),
            client_id: TEST_CLIENT_ID.to_string(),
            resource: TEST_AUDIENCE.to_string(),
            scopes: vec!["issues:read".to_string(), "issues:write".to_string()],
        }
    }

    pub fn oauth_client(&self) -> Result<OAuthClient> {
        OAuthClient::new(&self.authorization_config(), &HttpConfig::default())
    }

    pub fn obo_exchanger(&self) -> Result<OboExchanger> {
        OboExchanger::new(&self.authorization_config(), &HttpConfig::default())
    }

    pub fn downstream_config(&self, audience: &str) -> Result<DownstreamConfig> {
        Ok(DownstreamConfig {
            search_url: self
                .base_url
                .join("search")
                .map_err(|e| Error::InternalError(e.to_string()))?,
            audience: audience.to_string(),
        })
    }

    /// Register a refresh token as if a previous login had issued it.
    pub fn grant_refresh_token(&self, token: &str) {
        lock(&self.state).refresh_tokens.insert(token.to_string());
    }

    /// Invalidate every refresh token issued so far.
    pub fn revoke_refresh_tokens(&self) {
        lock(&self.state).refresh_tokens.clear();
    }

    pub fn set_rotation(&self, rotate: bool) {
        lock(&self.state).rotate = rotate;
    }

    pub fn set_issue_refresh_tokens(&self, issue: bool) {
        lock(&self.state).issue_refresh_tokens = issue;
    }

    /// Audience placed in access tokens minted from now on.
    pub fn set_token_audience(&self, audience: &str) {
        lock(&self.state).token_audience = audience.to_string();
    }

    pub fn set_access_token(&self, token: Option<String>) {
        lock(&self.state).access_token_override = token;
    }

    /// Make `/authorize` redirect back with `error` instead of a code.
    pub fn set_authorize_error(&self, error: &str, description: &str) {
        lock(&self.state).authorize_error = Some((error.to_string(), description.to_string()));
    }

    /// Replace the state echoed back to the callback.
    pub fn set_callback_state(&self, state: Option<String>) {
        lock(&self.state).callback_state = state;
    }

    pub fn set_exchange_mode(&self, mode: ExchangeMode) {
        lock(&self.state).exchange_mode = mode;
    }

    pub fn set_search_matches(&self, matches: &[(&str, f64)]) {
        lock(&self.state).search_matches = matches
            .iter()
            .map(|(id, score)| (id.to_string(), *score))
            .collect();
    }

    /// Fail the next `n` search calls with HTTP 503.
    pub fn fail_searches(&self, n: usize) {
        lock(&self.state).search_failures = n;
    }

    pub fn authorize_requests(&self) -> Vec<HashMap<String, String>> {
        lock(&self.state).authorize_requests.clone()
    }

    /// `grant_type` of every `/token` call, in order.
    pub fn token_grants(&self) -> Vec<String> {
        lock(&self.state).token_grants.clone()
    }

    pub fn exchange_requests(&self) -> Vec<HashMap<String, String>> {
        lock(&self.state).exchange_requests.clone()
    }

    /// Bearer tokens presented to `/search`.
    pub fn search_tokens(&self) -> Vec<String> {
        lock(&self.state).search_tokens.clone()
    }

    pub fn is_refresh_token_valid(&self, token: &str) -> bool {
        lock(&self.state).refresh_tokens.contains(token)
    }
}

impl Drop for FakeAuthServer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn authorize(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let mut s = lock(&state);
    s.authorize_requests.push(query.clone());

    let Some(mut target) = query
        .get("redirect_uri")
        .and_then(|uri| Url::parse(uri).ok())
    else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "redirect_uri");
    };
    let echoed_state = s
        .callback_state
        .clone()
        .or_else(|| query.get("state").cloned())
        .unwrap_or_default();

    let field = |name: &str| query.get(name).map(String::as_str).unwrap_or_default();
    let well_formed = field("response_type") == "code"
        && field("client_id") == TEST_CLIENT_ID
        && field("code_challenge_method") == "S256"
        && !field("code_challenge").is_empty()
        && field("resource") == TEST_AUDIENCE;

    {
        let mut pairs = target.query_pairs_mut();
        if let Some((error, description)) = &s.authorize_error {
            pairs
                .append_pair("error", error)
                .append_pair("error_description", description);
        } else if !well_formed {
            pairs
                .append_pair("error", "invalid_request")
                .append_pair("error_description", "malformed authorization request");
        } else {
            pairs.append_pair("code", AUTH_CODE);
        }
        pairs.append_pair("state", &echoed_state);
    }

    if s.authorize_error.is_none() && well_formed {
        let issued = IssuedCode {
            challenge: field("code_challenge").to_string(),
            redirect_uri: field("redirect_uri").to_string(),
        };
        s.codes.insert(AUTH_CODE.to_string(), issued);
    }
    Redirect::to(target.as_str()).into_response()
}

async fn token(State(state): State<Shared>, Form(form): Form<HashMap<String, String>>) -> Response {
    let mut s = lock(&state);
    let field = |name: &str| form.get(name).map(String::as_str).unwrap_or_default();
    s.token_grants.push(field("grant_type").to_string());

    if field("client_id") != TEST_CLIENT_ID {
        return oauth_error(StatusCode::UNAUTHORIZED, "invalid_client", "unknown client");
    }
    if field("resource") != TEST_AUDIENCE {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_target", "unknown resource");
    }

    let refresh_token = match field("grant_type") {
        "authorization_code" => {
            let Some(issued) = s.codes.remove(field("code")) else {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "unknown code");
            };
            if !verify_challenge(field("code_verifier"), &issued.challenge) {
                return oauth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_grant",
                    "PKCE verification failed",
                );
            }
            if field("redirect_uri") != issued.redirect_uri {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "redirect_uri mismatch");
            }
            if s.issue_refresh_tokens {
                Some(s.next_refresh_token())
            } else {
                None
            }
        }
        "refresh_token" => {
            let presented = field("refresh_token");
            if !s.refresh_tokens.contains(presented) {
                return oauth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_grant",
                    "refresh token revoked or expired",
                );
            }
            if s.rotate {
                let rotated = s.next_refresh_token();
                s.refresh_tokens.remove(presented);
                Some(rotated)
            } else {
                Some(presented.to_string())
            }
        }
        _ => {
            return oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type", "grant_type")
        }
    };

    let access_token = match s.access_token() {
        Ok(token) => token,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    let mut body = json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": 600,
        "scope": "issues:read issues:write",
    });
    if let Some(refresh_token) = refresh_token {
        body["refresh_token"] = Value::String(refresh_token);
    }
    Json(body).into_response()
}

async fn token_exchange(
    State(state): State<Shared>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let mut s = lock(&state);
    s.exchange_requests.push(form.clone());
    let field = |name: &str| form.get(name).map(String::as_str).unwrap_or_default();

    match s.exchange_mode {
        ExchangeMode::Unavailable => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
        ExchangeMode::Deny => {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "access_denied",
                "delegation not permitted for this audience",
            )
        }
        ExchangeMode::Echo => {
            return Json(json!({
                "access_token": field("subject_token"),
                "issued_token_type": ACCESS_TOKEN_TYPE,
                "token_type": "Bearer",
            }))
            .into_response()
        }
        ExchangeMode::Issue => {}
    }

    if field("grant_type") != TOKEN_EXCHANGE_GRANT
        || field("subject_token_type") != ACCESS_TOKEN_TYPE
        || field("client_id") != TEST_CLIENT_ID
        || field("audience").is_empty()
    {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "malformed exchange");
    }
    let Ok(subject) = test_validator().validate(field("subject_token")) else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "subject token rejected");
    };
    match access_token(&subject.user_id, field("audience"), 300) {
        Ok(token) => Json(json!({
            "access_token": token,
            "issued_token_type": ACCESS_TOKEN_TYPE,
            "token_type": "Bearer",
            "expires_in": 300,
        }))
        .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn search(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut s = lock(&state);
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    s.search_tokens.push(bearer);

    if s.search_failures > 0 {
        s.search_failures -= 1;
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let limit = body["limit"].as_u64().unwrap_or(20) as usize;
    let matches: Vec<Value> = s
        .search_matches
        .iter()
        .take(limit)
        .map(|(id, score)| json!({"issue_id": id, "score": score}))
        .collect();
    Json(json!({ "matches": matches })).into_response()
}

/// A [`BrowserLauncher`] that visits URLs with an HTTP client instead of a
/// real browser.
#[derive(Clone)]
pub struct TestBrowser {
    opened: Arc<Mutex<Vec<Url>>>,
    mode: BrowserMode,
    http: reqwest::Client,
}

#[derive(Clone)]
enum BrowserMode {
    /// Follow the authorization URL through to the loopback callback.
    Follow,
    /// Never visit anything.
    Idle,
    /// Visit a URL derived from the authorization URL instead.
    Direct(Arc<dyn Fn(&Url) -> Url + Send + Sync>),
}

impl TestBrowser {
    fn with_mode(mode: BrowserMode) -> Self {
        Self {
            opened: Arc::default(),
            mode,
            http: reqwest::Client::new(),
        }
    }

    pub fn following() -> Self {
        Self::with_mode(BrowserMode::Follow)
    }

    pub fn idle() -> Self {
        Self::with_mode(BrowserMode::Idle)
    }

    /// Send the browser straight to `target(authorization_url)`, e.g. a
    /// forged callback.
    pub fn direct<F>(target: F) -> Self
    where
        F: Fn(&Url) -> Url + Send + Sync + 'static,
    {
        Self::with_mode(BrowserMode::Direct(Arc::new(target)))
    }

    pub fn opened(&self) -> Vec<Url> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BrowserLauncher for TestBrowser {
    fn open(&self, url: &Url) -> std::io::Result<()> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.clone());
        let target = match &self.mode {
            BrowserMode::Idle => return Ok(()),
            BrowserMode::Follow => url.clone(),
            BrowserMode::Direct(derive) => derive(url),
        };
        let http = self.http.clone();
        tokio::spawn(async move {
            let _ = http.get(target).send().await;
        });
        Ok(())
    }
}

/// A [`ServerSpawner`] that records launches instead of starting processes.
#[derive(Clone, Default)]
pub struct RecordingSpawner {
    launches: Arc<Mutex<Vec<(PathBuf, LaunchArgs)>>>,
    exit_code: i32,
}

impl RecordingSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn launches(&self) -> Vec<(PathBuf, LaunchArgs)> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches().len()
    }
}

#[async_trait]
impl ServerSpawner for RecordingSpawner {
    async fn run(&self, entrypoint: &Path, args: &LaunchArgs) -> Result<i32> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((entrypoint.to_path_buf(), args.clone()));
        Ok(self.exit_code)
    }
}
